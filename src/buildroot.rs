//! Buildroot out-of-tree builds driven through `make`.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::process::{Cmd, Runner};
use crate::stage::Stage;
use crate::workspace::write_atomic;

pub const DEFAULT_DEFCONFIG: &str = "pnc_qemu_virt_robust_proxies_defconfig";

/// Kconfig symbol pointing the ProvenCore package at the extracted delivery.
pub const PROVENCORE_EXTERNAL_PATH_KEY: &str = "BR2_PACKAGE_PROVENCORE_CONFIG_EXTERNAL_PATH";

/// `make -C <source> BR2_EXTERNAL=<external> O=<output> [target]`.
#[derive(Debug, Clone)]
pub struct BuildrootTree {
    pub source: PathBuf,
    pub external: PathBuf,
    pub output: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl BuildrootTree {
    pub fn command(&self, target: Option<&str>) -> Cmd {
        let mut external = std::ffi::OsString::from("BR2_EXTERNAL=");
        external.push(&self.external);
        let mut output = std::ffi::OsString::from("O=");
        output.push(&self.output);
        let cmd = Cmd::new("make")
            .arg("-C")
            .arg_path(&self.source)
            .arg(external)
            .arg(output)
            .envs(&self.env);
        match target {
            Some(target) => cmd.arg(target),
            None => cmd,
        }
    }

    /// Run `make` for `target` (or the default target), output streamed.
    pub fn make(&self, runner: &dyn Runner, stage: Stage, target: Option<&str>) -> Result<()> {
        let cmd = self.command(target);
        tracing::info!("[{}] {}", stage, cmd);
        let output = runner
            .stream(&cmd)
            .with_context(|| format!("running buildroot make in '{}'", self.source.display()))?;
        if !output.success() {
            return Err(PipelineError::StageFailed {
                stage,
                exit_code: output.exit_code(),
                diagnostic: None,
                stderr: String::new(),
            }
            .into());
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.output.join(".config")
    }
}

/// Set `KEY="value"` in a Kconfig `.config`.
///
/// An existing assignment (or `# KEY is not set` line) is replaced in place,
/// so running this twice leaves exactly one assignment.
pub fn set_config_string(config: &Path, key: &str, value: &str) -> Result<()> {
    let text = fs::read_to_string(config)
        .with_context(|| format!("reading buildroot config '{}'", config.display()))?;
    let assignment = format!("{}=\"{}\"", key, value.replace('\\', "\\\\").replace('"', "\\\""));
    let assigned = format!("{}=", key);
    let unset = format!("# {} is not set", key);

    let mut replaced = false;
    let mut lines = Vec::new();
    for line in text.lines() {
        if line.starts_with(&assigned) || line.trim_end() == unset {
            if !replaced {
                lines.push(assignment.clone());
                replaced = true;
            }
            continue;
        }
        lines.push(line.to_string());
    }
    if !replaced {
        lines.push(assignment);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    write_atomic(config, out.as_bytes())
        .with_context(|| format!("writing buildroot config '{}'", config.display()))
}
