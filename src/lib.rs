//! Build-and-deploy pipeline for ProvenCore on the LS1043ARDB.
//!
//! Turns a ProvenCore tree into a running image, either on a physical board
//! (Yocto image, written to an SD card or over SSH) or on an emulated QEMU
//! virt machine (Buildroot image).
//!
//! - **Process runner** - [`process::Cmd`] descriptions executed by a [`process::Runner`]
//! - **Release handling** - archive lookup, per-run workspaces and extraction
//! - **Build drivers** - `bblayers.conf` generation, BitBake and Buildroot invocation
//! - **Deployment** - a [`deploy::WritePlan`] executed through a [`deploy::BlockSink`]
//! - **Orchestration** - [`pipeline::BoardPipeline`] and [`emulator::EmulatorPipeline`]
//!
//! # Architecture
//!
//! ```text
//! board-pipeline flash
//!     │
//!     ├── Compiling          make -C <provencore> <target>   (stderr scanned for a log)
//!     ├── Extracting         tar xf <release> -C <workspace> --strip-components=1
//!     ├── ConfiguringLayers  <build>/conf/bblayers.conf
//!     ├── BuildingImage      setup script environment, then bitbake <image>
//!     └── Deploying          dd at sector 8 and 0x20000, locally or over ssh
//!
//! board-pipeline emulate
//!     │
//!     ├── Extracting, ConfiguringBuild, BuildingImage   (Buildroot)
//!     ├── ProvisioningNetwork                           (best effort)
//!     └── Launching
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use board_pipeline::config::BoardProfile;
//! use board_pipeline::context::{ContextInputs, PathResolver, PipelineContext};
//! use board_pipeline::pipeline::BoardPipeline;
//! use board_pipeline::process::HostRunner;
//!
//! # fn main() -> anyhow::Result<()> {
//! let inputs = ContextInputs {
//!     cross_compile: Some("/opt/toolchains/aarch64-none-elf-".into()),
//!     platform_integration: Some("~/src/platform-integration".into()),
//!     provencore: Some("~/src/provencore".into()),
//!     sdcard: Some("/dev/sdX".into()),
//!     sdcard_partition: Some("/dev/sdX1".into()),
//!     ..Default::default()
//! };
//! let ctx = PipelineContext::from_inputs(inputs, BoardProfile::default(), &PathResolver::from_process()?)?;
//! BoardPipeline::new(&ctx, &HostRunner).run()?;
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod bitbake;
pub mod buildroot;
pub mod config;
pub mod context;
pub mod deploy;
pub mod diagnostics;
pub mod emulator;
pub mod error;
pub mod layers;
pub mod lock;
pub mod manifest;
pub mod network;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod stage;
pub mod workspace;

pub use error::{exit_code_for, PipelineError};
pub use process::{Cmd, CmdOutput, HostRunner, Runner};
pub use stage::{Stage, StageResult, StageStatus};
