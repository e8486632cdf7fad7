//! Exclusive lock on a Yocto build directory.
//!
//! Two runs against one build directory would race on `conf/bblayers.conf`
//! and on BitBake's own state, so the layer and image stages hold this lock.

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub const LOCK_FILENAME: &str = ".board-pipeline.lock";

/// Released when dropped (closing the descriptor drops the flock). The lock
/// file itself stays so a concurrent run never locks a different inode.
#[derive(Debug)]
pub struct BuildDirLock {
    _file: File,
    path: PathBuf,
}

impl BuildDirLock {
    pub fn acquire(build_dir: &Path) -> Result<Self> {
        fs::create_dir_all(build_dir)
            .with_context(|| format!("creating build directory '{}'", build_dir.display()))?;
        let path = build_dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            drop(file);
            return Err(anyhow!(
                "build directory is locked by another run: {}",
                path.display()
            ));
        }

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
