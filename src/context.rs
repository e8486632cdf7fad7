//! Run context.
//!
//! Everything a stage needs to know about the outside world is resolved once,
//! up front, into a [`PipelineContext`]. Stages read it; nothing writes to it
//! after construction, and no stage looks at the process environment itself.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::BoardProfile;
use crate::deploy::DeploymentChannel;
use crate::error::PipelineError;

pub const DEFAULT_YOCTO_ROOT: &str = "/home/nobackup/yocto-sdk";

/// Raw operator inputs, after CLI/env merging but before any resolution.
#[derive(Debug, Clone, Default)]
pub struct ContextInputs {
    pub cross_compile: Option<String>,
    pub cross_compile64: Option<String>,
    pub platform_integration: Option<String>,
    pub provencore: Option<String>,
    pub yocto: Option<String>,
    pub sdcard: Option<String>,
    /// Required alongside `sdcard`; exported for the build scripts.
    pub sdcard_partition: Option<String>,
    pub via_ssh: bool,
    pub network_interface: Option<String>,
    pub compile_only: bool,
    pub temp_root: Option<String>,
}

/// Anchors for turning operator-supplied paths into absolute ones.
#[derive(Debug, Clone)]
pub struct PathResolver {
    cwd: PathBuf,
    home: Option<PathBuf>,
    temp: PathBuf,
}

impl PathResolver {
    pub fn new(cwd: PathBuf, home: Option<PathBuf>, temp: PathBuf) -> Self {
        Self { cwd, home, temp }
    }

    /// Snapshot of this process's working, home and temp directories.
    pub fn from_process() -> Result<Self> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        Ok(Self::new(cwd, dirs::home_dir(), std::env::temp_dir()))
    }

    /// Expand a leading `~` and make `raw` absolute. Existence is not checked.
    pub fn resolve(&self, raw: &str) -> PathBuf {
        let expanded = match (raw.strip_prefix('~'), &self.home) {
            (Some(""), Some(home)) => home.clone(),
            (Some(rest), Some(home)) if rest.starts_with('/') => {
                home.join(rest.trim_start_matches('/'))
            }
            _ => PathBuf::from(raw),
        };
        if expanded.is_absolute() {
            expanded
        } else {
            self.cwd.join(expanded)
        }
    }

    /// Toolchain prefix such as `aarch64-linux-gnu-`. A bare prefix is left
    /// for `make` to find on PATH; one naming a directory is resolved.
    pub fn resolve_prefix(&self, raw: &str) -> PathBuf {
        if raw.starts_with('~') || raw.contains('/') {
            self.resolve(raw)
        } else {
            PathBuf::from(raw)
        }
    }

    pub fn temp(&self) -> &Path {
        &self.temp
    }
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub cross_compile: PathBuf,
    pub cross_compile64: PathBuf,
    pub platform_integration: PathBuf,
    pub provencore: PathBuf,
    pub sdk: PathBuf,
    pub temp_root: PathBuf,
    pub sdcard_partition: Option<PathBuf>,
    /// `None` only in compile-only runs.
    pub channel: Option<DeploymentChannel>,
    pub compile_only: bool,
    pub profile: BoardProfile,
    env: BTreeMap<String, String>,
}

impl PipelineContext {
    pub fn from_inputs(
        inputs: ContextInputs,
        profile: BoardProfile,
        resolver: &PathResolver,
    ) -> Result<Self> {
        let cross_compile = required(&inputs.cross_compile, "--cross-compile / CROSS_COMPILE")?;
        let platform_integration = required(
            &inputs.platform_integration,
            "--platform-integration / PLATFORM_INTEGRATION",
        )?;
        let provencore = required(&inputs.provencore, "--provencore / PNC")?;

        let cross_compile = resolver.resolve_prefix(cross_compile);
        let cross_compile64 = inputs
            .cross_compile64
            .as_deref()
            .map(|raw| resolver.resolve_prefix(raw))
            .unwrap_or_else(|| cross_compile.clone());
        let platform_integration = resolver.resolve(platform_integration);
        let provencore = resolver.resolve(provencore);
        let sdk = resolver.resolve(inputs.yocto.as_deref().unwrap_or(DEFAULT_YOCTO_ROOT));
        let temp_root = inputs
            .temp_root
            .as_deref()
            .map(|raw| resolver.resolve(raw))
            .unwrap_or_else(|| resolver.temp().to_path_buf());
        let sdcard = inputs.sdcard.as_deref().map(|raw| resolver.resolve(raw));
        let sdcard_partition = inputs
            .sdcard_partition
            .as_deref()
            .map(|raw| resolver.resolve(raw));

        let channel = match (sdcard.clone(), inputs.via_ssh) {
            (Some(_), true) => {
                return Err(PipelineError::Usage(
                    "--sdcard and --via-ssh are mutually exclusive".to_string(),
                )
                .into())
            }
            (Some(_), false) if sdcard_partition.is_none() => {
                return Err(PipelineError::Usage(
                    "--sdcard-partition / SDCARD_PARTITION is required with --sdcard".to_string(),
                )
                .into())
            }
            (Some(device), false) => Some(DeploymentChannel::LocalBlockDevice { device }),
            (None, true) => Some(DeploymentChannel::RemoteSecureShell {
                host: profile.remote.host.clone(),
                device: profile.remote.device.clone(),
                interface: inputs.network_interface.clone(),
            }),
            (None, false) if inputs.compile_only => None,
            (None, false) => {
                return Err(PipelineError::Usage(
                    "either --sdcard or --via-ssh is required unless --compile-only".to_string(),
                )
                .into())
            }
        };

        let mut env = BTreeMap::new();
        let mut put = |key: &str, value: &Path| {
            env.insert(key.to_string(), value.display().to_string());
        };
        put("PROVENCORE", &provencore);
        put("PLATFORM_INTEGRATION", &platform_integration);
        put("YOCTO", &sdk);
        put("CROSS_COMPILE", &cross_compile);
        put("CROSS_COMPILE64", &cross_compile64);
        if let Some(device) = &sdcard {
            put("SDCARD", device);
        }
        if let Some(partition) = &sdcard_partition {
            put("SDCARD_PARTITION", partition);
        }
        if let Some(iface) = &inputs.network_interface {
            env.insert("NETWORK_INTERFACE".to_string(), iface.clone());
        }

        Ok(Self {
            cross_compile,
            cross_compile64,
            platform_integration,
            provencore,
            sdk,
            temp_root,
            sdcard_partition,
            channel,
            compile_only: inputs.compile_only,
            profile,
            env,
        })
    }

    /// Variables added to the environment of build-tool children.
    pub fn env_overlay(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn release_dir(&self) -> PathBuf {
        self.profile.release_dir_in(&self.provencore)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.profile.build_dir_in(&self.sdk)
    }

    pub fn setup_script(&self) -> PathBuf {
        self.profile.setup_script_in(&self.sdk)
    }

    pub fn images_dir(&self) -> PathBuf {
        crate::deploy::images_dir(&self.sdk, &self.profile.build_dir, &self.profile.machine)
    }

    /// Paths that must exist before the first stage runs.
    pub fn check_paths(&self) -> Result<()> {
        let mut required = vec![
            ("ProvenCore root", self.provencore.as_path()),
            ("platform integration root", self.platform_integration.as_path()),
        ];
        if !self.compile_only {
            required.push(("Yocto SDK root", self.sdk.as_path()));
        }
        for (what, path) in required {
            if !path.is_dir() {
                return Err(PipelineError::not_found(what, path).into());
            }
        }
        Ok(())
    }
}

fn required<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PipelineError::Usage(format!("missing required argument {}", flag)).into())
}
