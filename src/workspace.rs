//! Run-scoped workspaces.
//!
//! Each run extracts its release into a fresh directory named
//! `<date>T<HH>h<MM>m.<id>.<suffix>` under a temp root. The timestamp keeps
//! directories sortable for humans; the id makes two runs started in the
//! same minute (or concurrently) land in different places.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;

use crate::error::PipelineError;
use crate::process::{Cmd, Runner};

static LAST_RUN_STAMP: AtomicU64 = AtomicU64::new(0);

/// A directory owned by exactly one run. It is left on disk after the run,
/// successful or not, so the operator can inspect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    run_id: String,
    path: PathBuf,
}

impl Workspace {
    /// Allocate a new workspace directory under `temp_root`.
    pub fn create(temp_root: &Path, suffix: &str) -> Result<Self> {
        fs::create_dir_all(temp_root)
            .with_context(|| format!("creating workspace root '{}'", temp_root.display()))?;

        let stamp = minute_stamp(OffsetDateTime::now_utc());
        for _ in 0..32 {
            let run_id = generate_run_id()?;
            let path = temp_root.join(format!("{stamp}.{run_id}.{suffix}"));
            match fs::create_dir(&path) {
                Ok(()) => {
                    tracing::debug!("allocated workspace {}", path.display());
                    return Ok(Self { run_id, path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("creating workspace '{}'", path.display()))
                }
            }
        }
        bail!(
            "failed allocating unique workspace directory under '{}'",
            temp_root.display()
        )
    }

    /// Use an existing directory (created if missing) as the workspace.
    pub fn at(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)
            .with_context(|| format!("creating workspace '{}'", path.display()))?;
        Ok(Self {
            run_id: generate_run_id()?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.path.join(rel)
    }
}

/// Extract `archive` into `dest`, dropping the archive's top-level directory.
pub fn extract_archive(runner: &dyn Runner, archive: &Path, dest: &Path) -> Result<()> {
    if !archive.is_file() {
        return Err(PipelineError::not_found("archive", archive).into());
    }
    let cmd = Cmd::new("tar")
        .arg("xf")
        .arg_path(archive)
        .arg("-C")
        .arg_path(dest)
        .arg("--strip-components=1");
    let output = runner
        .capture(&cmd)
        .with_context(|| format!("extracting '{}'", archive.display()))?;
    if !output.success() {
        return Err(PipelineError::ExtractionFailed {
            archive: archive.to_path_buf(),
            exit_code: output.exit_code(),
            stderr: output.stderr,
        }
        .into());
    }
    Ok(())
}

/// Write `payload` to `.<name>.partial` next to `path`, sync it, then
/// rename it into place so readers never see a half-written file.
pub(crate) fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        bail!("cannot write atomically to '{}'", path.display());
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;

    let mut partial_name = OsString::from(".");
    partial_name.push(name);
    partial_name.push(".partial");
    let partial = parent.join(partial_name);

    let mut file = File::create(&partial)
        .with_context(|| format!("creating '{}'", partial.display()))?;
    file.write_all(payload)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("writing '{}'", partial.display()))?;
    drop(file);
    fs::rename(&partial, path)
        .with_context(|| format!("moving '{}' into place", path.display()))
}

/// `2026-10-18T14h05m`, the prefix of every workspace name.
pub fn minute_stamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}h{:02}m",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute()
    )
}

/// `20261018T140512Z`, used for manifest timestamps.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Short base62 id taken from the wall clock in microseconds.
///
/// Ids are strictly increasing within one process. Two processes may still
/// draw the same id; [`Workspace::create`] retries with a fresh one when the
/// directory already exists.
pub fn generate_run_id() -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before 1970")?;
    let micros = u64::try_from(now.as_micros()).context("system clock out of range")?;

    let mut last = LAST_RUN_STAMP.load(Ordering::Relaxed);
    loop {
        let next = micros.max(last + 1);
        match LAST_RUN_STAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return Ok(to_base62(next)),
            Err(seen) => last = seen,
        }
    }
}

fn to_base62(mut value: u64) -> String {
    const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut digits = Vec::new();
    loop {
        digits.push(DIGITS[(value % 62) as usize] as char);
        value /= 62;
        if value == 0 {
            break;
        }
    }
    digits.iter().rev().collect()
}
