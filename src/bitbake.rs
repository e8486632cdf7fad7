//! Yocto image build.
//!
//! The SDK's setup script only makes sense when sourced, and it mutates the
//! environment (PATH, BBPATH, BUILDDIR, ...). Rather than chaining it with
//! BitBake inside one shell string, the environment it produces is captured
//! first and BitBake is then started directly with exactly that environment.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PipelineError;
use crate::process::{Cmd, Runner};
use crate::stage::Stage;

pub const DEFAULT_IMAGE_TARGET: &str = "fsl-image-networking";

/// Sources `$1` with `set -e` so a failing setup script fails the shell, then
/// dumps the resulting environment NUL-separated. Script output goes to stderr.
const RESOLVE_SCRIPT: &str = "set -e; . \"$1\" >&2; env -0";

pub type Environment = BTreeMap<String, String>;

/// Run `script` in a shell and return the environment it leaves behind.
///
/// `overlay` is set before the script is sourced, so the operator's values
/// reach the script and survive into the returned environment unless the
/// script overrides them.
pub fn resolve_setup_environment(
    runner: &dyn Runner,
    script: &Path,
    build_dir: &Path,
    overlay: &Environment,
) -> Result<Environment> {
    if !script.is_file() {
        return Err(PipelineError::not_found("build environment setup script", script).into());
    }
    let cmd = Cmd::new("sh")
        .args(["-c", RESOLVE_SCRIPT, "sh"])
        .arg_path(script)
        .envs(overlay)
        .dir(build_dir);
    let output = runner
        .capture(&cmd)
        .with_context(|| format!("sourcing '{}'", script.display()))?;
    if !output.success() {
        return Err(PipelineError::StageFailed {
            stage: Stage::BuildingImage,
            exit_code: output.exit_code(),
            diagnostic: None,
            stderr: output.stderr,
        }
        .into());
    }
    let env = parse_env_dump(&output.stdout)?;
    tracing::debug!(
        "resolved {} environment variables from {}",
        env.len(),
        script.display()
    );
    Ok(env)
}

/// Parse `env -0` output.
pub fn parse_env_dump(dump: &str) -> Result<Environment> {
    let mut env = Environment::new();
    for entry in dump.split('\0').filter(|e| !e.is_empty()) {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("malformed environment entry {:?}", entry);
        };
        if key.is_empty() {
            bail!("environment entry without a name: {:?}", entry);
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Build `target` with BitBake in `build_dir`, output streamed to the operator.
pub fn invoke(
    runner: &dyn Runner,
    build_dir: &Path,
    target: &str,
    env: &Environment,
) -> Result<()> {
    let cmd = Cmd::new("bitbake")
        .arg(target)
        .env_clear()
        .envs(env)
        .dir(build_dir);
    tracing::info!("[{}] bitbake {}", Stage::BuildingImage, target);
    let output = runner
        .stream(&cmd)
        .with_context(|| format!("running bitbake for '{}'", target))?;
    if !output.success() {
        return Err(PipelineError::StageFailed {
            stage: Stage::BuildingImage,
            exit_code: output.exit_code(),
            diagnostic: None,
            stderr: String::new(),
        }
        .into());
    }
    Ok(())
}
