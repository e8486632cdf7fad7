use anyhow::Result;
use clap::Args;

use board_pipeline::config::BoardProfile;
use board_pipeline::context::{ContextInputs, PathResolver, PipelineContext};
use board_pipeline::pipeline::{validate, BoardPipeline};
use board_pipeline::preflight::{board_tools, check_required_tools};
use board_pipeline::process::HostRunner;

#[derive(Debug, Args)]
pub(crate) struct FlashArgs {
    /// Path to the SD card block device
    #[arg(short = 's', long, env = "SDCARD", value_name = "SDCARD")]
    sdcard: Option<String>,

    /// Path to the SD card partition, required with --sdcard
    #[arg(short = 'p', long, env = "SDCARD_PARTITION", value_name = "SDCARD_PARTITION")]
    sdcard_partition: Option<String>,

    /// Flash over SSH instead of writing an SD card
    #[arg(long, env = "VIA_SSH")]
    via_ssh: bool,

    /// Host interface to bind the board subnet to when flashing over SSH
    #[arg(long, env = "NETWORK_INTERFACE", value_name = "NETWORK_INTERFACE")]
    network_interface: Option<String>,

    /// Path prefix of the cross compiler toolchain
    #[arg(long, env = "CROSS_COMPILE", value_name = "CROSS_COMPILE")]
    cross_compile: Option<String>,

    /// Path prefix of the 64-bit cross compiler toolchain [default: --cross-compile]
    #[arg(long, env = "CROSS_COMPILE64", value_name = "CROSS_COMPILE64")]
    cross_compile64: Option<String>,

    /// Path to the platform-integration repository [env: PLATFORM_INTEGRATION also accepted]
    #[arg(
        short = 'i',
        long,
        env = "PR_PLATFORM_INTEGRATION_REPOSITORY_PATH",
        value_name = "PLATFORM_INTEGRATION"
    )]
    platform_integration: Option<String>,

    /// Path to the ProvenCore repository [env: PROVENCORE also accepted]
    #[arg(long, env = "PNC", value_name = "PNC")]
    provencore: Option<String>,

    /// Path to the Yocto SDK
    #[arg(short = 'y', long, env = "YOCTO", value_name = "YOCTO")]
    yocto: Option<String>,

    /// Stop after compiling ProvenCore
    #[arg(short = 'C', long, env = "COMPILE_ONLY")]
    compile_only: bool,

    /// Directory under which run workspaces are created [default: system temp dir]
    #[arg(long, value_name = "DIR")]
    temp_root: Option<String>,

    /// TOML board profile overriding the built-in LS1043ARDB defaults
    #[arg(long, env = "BOARD_PROFILE", value_name = "FILE")]
    profile: Option<String>,
}

impl FlashArgs {
    fn into_inputs(self) -> ContextInputs {
        ContextInputs {
            cross_compile: self.cross_compile,
            cross_compile64: self.cross_compile64,
            platform_integration: self
                .platform_integration
                .or_else(|| std::env::var("PLATFORM_INTEGRATION").ok()),
            provencore: self
                .provencore
                .or_else(|| std::env::var("PROVENCORE").ok()),
            yocto: self.yocto,
            sdcard: self.sdcard,
            sdcard_partition: self.sdcard_partition,
            via_ssh: self.via_ssh,
            network_interface: self.network_interface,
            compile_only: self.compile_only,
            temp_root: self.temp_root,
        }
    }
}

pub(crate) fn run_flash(args: FlashArgs) -> Result<()> {
    let resolver = PathResolver::from_process()?;
    let profile = match args.profile.as_deref() {
        Some(path) => BoardProfile::load(&resolver.resolve(path))?,
        None => BoardProfile::default(),
    };
    let ctx = PipelineContext::from_inputs(args.into_inputs(), profile, &resolver)?;
    tracing::debug!("{:#?}", ctx);

    check_required_tools(&board_tools(ctx.channel.as_ref()))?;
    let runner = HostRunner;
    validate(&ctx, &runner)?;

    let outcome = BoardPipeline::new(&ctx, &runner).run()?;
    if let Some(manifest) = &outcome.manifest {
        println!("[{}:{}] manifest {}", ctx.profile.board, outcome.final_stage, manifest.display());
    }
    Ok(())
}
