//! Stage identities and outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Pipeline states. `Init`, `Done` and `Aborted` are bookends; the rest are
/// stages that run one external step each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Compiling,
    Extracting,
    ConfiguringLayers,
    ConfiguringBuild,
    BuildingImage,
    ProvisioningNetwork,
    Deploying,
    Launching,
    Done,
    Aborted,
}

impl Stage {
    /// Short label used in log prefixes.
    pub fn slug(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Compiling => "compile",
            Stage::Extracting => "extract",
            Stage::ConfiguringLayers => "layers",
            Stage::ConfiguringBuild => "configure",
            Stage::BuildingImage => "image",
            Stage::ProvisioningNetwork => "network",
            Stage::Deploying => "deploy",
            Stage::Launching => "launch",
            Stage::Done => "done",
            Stage::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failure { exit_code: i32 },
}

/// Outcome of one stage, consumed by the orchestrator to continue or abort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    #[serde(flatten)]
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Non-fatal problems (best-effort provisioning and the like).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StageResult {
    pub fn success(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            diagnostic: None,
            message: None,
            warnings: Vec::new(),
        }
    }

    pub fn failure(stage: Stage, exit_code: i32) -> Self {
        Self {
            status: StageStatus::Failure { exit_code },
            ..Self::success(stage)
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: PathBuf) -> Self {
        self.diagnostic = Some(diagnostic);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            StageStatus::Success => None,
            StageStatus::Failure { exit_code } => Some(exit_code),
        }
    }
}
