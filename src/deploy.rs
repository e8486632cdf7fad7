//! Writing boot images to the target's storage.
//!
//! Both channels execute the same [`WritePlan`]; only the [`BlockSink`]
//! differs. The plan owns the component-to-sector mapping, so the bytes that
//! land on the device do not depend on which channel carried them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::process::{Cmd, CmdOutput, Runner, EXIT_SENTINEL};
use crate::stage::{Stage, StageResult};

pub const SECTOR_SIZE: u64 = 512;

pub const DEFAULT_REMOTE_HOST: &str = "root@192.168.18.6";
pub const DEFAULT_REMOTE_DEVICE: &str = "/dev/mmcblk0";

/// One boot image and where it goes on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageComponent {
    pub name: String,
    /// Relative to the image deploy directory.
    pub path: PathBuf,
    /// Destination, in 512-byte sectors.
    pub sector: u64,
}

impl ImageComponent {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, sector: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            sector,
        }
    }

    /// Byte offset of `sector`, or `None` when it does not fit in a `u64`.
    pub fn offset_bytes(&self) -> Option<u64> {
        self.sector.checked_mul(SECTOR_SIZE)
    }
}

/// Ordered list of components making up a bootable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifactSet {
    components: Vec<ImageComponent>,
}

impl ImageArtifactSet {
    pub fn new(components: Vec<ImageComponent>) -> Self {
        Self { components }
    }

    /// LS1043ARDB SD boot layout: BL2 at sector 8, FIP with U-Boot at 0x20000.
    pub fn ls1043ardb() -> Self {
        Self::new(vec![
            ImageComponent::new("bl2", "atf/bl2_sd.pbl", 8),
            ImageComponent::new("fip", "atf/fip_uboot.bin", 0x20000),
        ])
    }

    pub fn components(&self) -> &[ImageComponent] {
        &self.components
    }
}

/// `<sdk>/<build_dir>/tmp/deploy/images/<machine>`.
pub fn images_dir(sdk_root: &Path, build_dir: &str, machine: &str) -> PathBuf {
    sdk_root
        .join(build_dir)
        .join("tmp/deploy/images")
        .join(machine)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub name: String,
    pub source: PathBuf,
    pub sector: u64,
    pub offset_bytes: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    ops: Vec<WriteOp>,
}

impl WritePlan {
    /// Resolve every component under `images_dir`. All sources must exist.
    pub fn from_artifacts(set: &ImageArtifactSet, images_dir: &Path) -> Result<Self> {
        let mut ops = Vec::with_capacity(set.components().len());
        for component in set.components() {
            let source = images_dir.join(&component.path);
            if !source.is_file() {
                return Err(PipelineError::not_found(
                    format!("{} image", component.name),
                    source,
                )
                .into());
            }
            let len = fs::metadata(&source)
                .with_context(|| format!("reading metadata of '{}'", source.display()))?
                .len();
            let offset_bytes = component.offset_bytes().with_context(|| {
                format!(
                    "{} image sector {} is beyond the addressable range",
                    component.name, component.sector
                )
            })?;
            ops.push(WriteOp {
                name: component.name.clone(),
                source,
                sector: component.sector,
                offset_bytes,
                len,
            });
        }
        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Size and sha256 of every source, in plan order.
    pub fn digests(&self) -> Result<Vec<ImageDigest>> {
        self.ops
            .iter()
            .map(|op| {
                let (sha256, size_bytes) = sha256_file(&op.source)?;
                Ok(ImageDigest {
                    name: op.name.clone(),
                    path: op.source.clone(),
                    sector: op.sector,
                    size_bytes,
                    sha256,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDigest {
    pub name: String,
    pub path: PathBuf,
    pub sector: u64,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Where a [`WritePlan`] is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentChannel {
    LocalBlockDevice {
        device: PathBuf,
    },
    RemoteSecureShell {
        host: String,
        device: String,
        /// Host interface to bind the board subnet to, if it is missing.
        interface: Option<String>,
    },
}

impl DeploymentChannel {
    pub fn describe(&self) -> String {
        match self {
            Self::LocalBlockDevice { device } => device.display().to_string(),
            Self::RemoteSecureShell { host, device, .. } => format!("{}:{}", host, device),
        }
    }
}

/// Something that can put a file's bytes at a sector of a block device.
pub trait BlockSink {
    /// Human-readable target, for logs.
    fn target(&self) -> String;

    /// Command that performs `op`.
    fn command(&self, op: &WriteOp) -> Cmd;

    fn runner(&self) -> &dyn Runner;

    fn write(&self, op: &WriteOp) -> Result<CmdOutput> {
        let cmd = self.command(op);
        self.runner()
            .capture(&cmd)
            .with_context(|| format!("writing {} to {}", op.name, self.target()))
    }
}

/// `dd` on this host, as root.
pub struct LocalDeviceSink<'a> {
    runner: &'a dyn Runner,
    device: PathBuf,
}

impl<'a> LocalDeviceSink<'a> {
    pub fn new(runner: &'a dyn Runner, device: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            device: device.into(),
        }
    }
}

impl BlockSink for LocalDeviceSink<'_> {
    fn target(&self) -> String {
        self.device.display().to_string()
    }

    fn command(&self, op: &WriteOp) -> Cmd {
        let mut input = std::ffi::OsString::from("if=");
        input.push(&op.source);
        let mut output = std::ffi::OsString::from("of=");
        output.push(&self.device);
        Cmd::privileged("dd")
            .arg(input)
            .arg(output)
            .arg(format!("bs={}", SECTOR_SIZE))
            .arg(format!("seek={}", op.sector))
    }

    fn runner(&self) -> &dyn Runner {
        self.runner
    }
}

/// `dd` on the board over ssh, fed from local stdin.
pub struct RemoteShellSink<'a> {
    runner: &'a dyn Runner,
    host: String,
    device: String,
}

impl<'a> RemoteShellSink<'a> {
    pub fn new(runner: &'a dyn Runner, host: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            runner,
            host: host.into(),
            device: device.into(),
        }
    }
}

impl BlockSink for RemoteShellSink<'_> {
    fn target(&self) -> String {
        format!("{}:{}", self.host, self.device)
    }

    fn command(&self, op: &WriteOp) -> Cmd {
        Cmd::new("ssh")
            .arg(&self.host)
            .arg("dd")
            .arg(format!("of={}", self.device))
            .arg(format!("bs={}", SECTOR_SIZE))
            .arg(format!("seek={}", op.sector))
            .stdin_file(&op.source)
    }

    fn runner(&self) -> &dyn Runner {
        self.runner
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub name: String,
    pub exit_code: i32,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub written: Vec<String>,
    pub failures: Vec<WriteFailure>,
}

impl DeployReport {
    /// Success result, or a fatal error carrying the first failing exit code.
    pub fn into_result(self) -> Result<StageResult> {
        let Some(first) = self.failures.first() else {
            return Ok(StageResult::success(Stage::Deploying));
        };
        let stderr = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.name, f.stderr.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        Err(PipelineError::StageFailed {
            stage: Stage::Deploying,
            exit_code: first.exit_code,
            diagnostic: None,
            stderr,
        }
        .into())
    }
}

/// Run every op in order. A failed write does not stop the others.
pub fn execute_plan(plan: &WritePlan, sink: &dyn BlockSink) -> DeployReport {
    let mut report = DeployReport::default();
    for op in plan.ops() {
        tracing::info!(
            "[{}] {} ({} bytes) -> {} at sector {:#x}",
            Stage::Deploying,
            op.name,
            op.len,
            sink.target(),
            op.sector
        );
        match sink.write(op) {
            Ok(out) if out.success() => report.written.push(op.name.clone()),
            Ok(out) => {
                tracing::error!(
                    "[{}] writing {} failed with exit code {}",
                    Stage::Deploying,
                    op.name,
                    out.exit_code()
                );
                report.failures.push(WriteFailure {
                    name: op.name.clone(),
                    exit_code: out.exit_code(),
                    stderr: out.stderr,
                });
            }
            Err(err) => {
                tracing::error!("[{}] {:#}", Stage::Deploying, err);
                report.failures.push(WriteFailure {
                    name: op.name.clone(),
                    exit_code: EXIT_SENTINEL,
                    stderr: format!("{:#}", err),
                });
            }
        }
    }
    report
}

pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
