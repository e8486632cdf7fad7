//! Fatal pipeline conditions.
//!
//! Everything else travels as `anyhow::Error`; these variants are the ones the
//! binary downcasts to pick an exit code and print diagnostics.

use std::path::PathBuf;
use thiserror::Error;

use crate::process::EXIT_SENTINEL;
use crate::stage::Stage;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// An external tool exited non-zero and the stage cannot continue.
    #[error("{stage} stage failed with exit code {exit_code}")]
    StageFailed {
        stage: Stage,
        exit_code: i32,
        diagnostic: Option<PathBuf>,
        stderr: String,
    },

    #[error("extracting '{}' failed with exit code {exit_code}", archive.display())]
    ExtractionFailed {
        archive: PathBuf,
        exit_code: i32,
        stderr: String,
    },

    #[error("{what} not found: {}", path.display())]
    ResourceNotFound { what: String, path: PathBuf },

    #[error(
        "more than one release archive in '{}': {}",
        dir.display(),
        candidates.iter().map(|c| c.display().to_string()).collect::<Vec<_>>().join(", ")
    )]
    AmbiguousArtifact {
        dir: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("network precondition failed: {0}")]
    NetworkPrecondition(String),

    #[error("{0}")]
    Usage(String),
}

impl PipelineError {
    pub fn not_found(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::ResourceNotFound {
            what: what.into(),
            path: path.into(),
        }
    }

    /// Exit code the process should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StageFailed { exit_code, .. } | Self::ExtractionFailed { exit_code, .. } => {
                *exit_code
            }
            Self::Usage(_) => 2,
            _ => EXIT_SENTINEL,
        }
    }

    /// Log file the operator should look at, if the failing tool named one.
    pub fn diagnostic(&self) -> Option<&PathBuf> {
        match self {
            Self::StageFailed { diagnostic, .. } => diagnostic.as_ref(),
            _ => None,
        }
    }

    /// Captured error output of the failing command.
    pub fn captured_stderr(&self) -> Option<&str> {
        match self {
            Self::StageFailed { stderr, .. } | Self::ExtractionFailed { stderr, .. }
                if !stderr.is_empty() =>
            {
                Some(stderr)
            }
            _ => None,
        }
    }
}

/// Exit code for any error reaching `main`.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::exit_code)
        .unwrap_or(EXIT_SENTINEL)
}
