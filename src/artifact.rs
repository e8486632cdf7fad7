//! Release archive lookup.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Default suffix of a ProvenCore release archive.
pub const RELEASE_ARCHIVE_SUFFIX: &[&str] = &[".tar", ".xz"];

/// Find the one file in `dir` whose name ends with `suffix_parts`.
///
/// Only the directory itself is searched. Matching is case-sensitive and
/// requires a non-empty stem, so a file named `.tar.xz` does not count.
/// Zero matches and several matches are both errors; the candidate list of
/// the latter is sorted so the failure does not depend on directory order.
pub fn locate_release_archive(dir: &Path, suffix_parts: &[&str]) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(PipelineError::not_found("release directory", dir).into());
    }
    let suffix: String = suffix_parts.concat();

    let mut matches = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("reading release directory '{}'", dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("reading entry in release directory '{}'", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if has_suffix(name, &suffix) {
            matches.push(path);
        }
    }
    matches.sort();

    match matches.len() {
        0 => Err(PipelineError::not_found(
            format!("release archive matching '*{}'", suffix),
            dir,
        )
        .into()),
        1 => Ok(matches.remove(0)),
        _ => Err(PipelineError::AmbiguousArtifact {
            dir: dir.to_path_buf(),
            candidates: matches,
        }
        .into()),
    }
}

fn has_suffix(name: &str, suffix: &str) -> bool {
    name.len() > suffix.len() && name.ends_with(suffix)
}
