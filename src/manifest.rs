//! `run-manifest.json`: what a run did, kept next to its workspace.
//!
//! Rewritten after every stage so a run that dies mid-way still leaves an
//! accurate record. `status` stays `building` until the run finishes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::deploy::ImageDigest;
use crate::stage::StageResult;
use crate::workspace::{now_utc_compact, write_atomic};

pub const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Building,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub board: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub workspace: PathBuf,
    pub stages: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageDigest>,
}

impl RunManifest {
    pub fn start(run_id: &str, board: &str, workspace: &Path) -> Self {
        Self {
            run_id: run_id.to_string(),
            board: board.to_string(),
            status: RunStatus::Building,
            created_at_utc: now_utc_compact(),
            finished_at_utc: None,
            workspace: workspace.to_path_buf(),
            stages: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn path(&self) -> PathBuf {
        manifest_path(&self.workspace)
    }

    pub fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at_utc = Some(now_utc_compact());
    }

    pub fn write(&self) -> Result<()> {
        write_json_atomic(&self.path(), self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading run manifest '{}'", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))
    }
}

pub fn manifest_path(workspace: &Path) -> PathBuf {
    workspace.join(RUN_MANIFEST_FILENAME)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    write_atomic(path, &payload)
}
