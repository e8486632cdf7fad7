use anyhow::Result;
use clap::Args;
use std::time::Duration;

use board_pipeline::buildroot::DEFAULT_DEFCONFIG;
use board_pipeline::context::PathResolver;
use board_pipeline::emulator::{EmulatorOptions, EmulatorPipeline, DEFAULT_LAUNCH_DELAY};
use board_pipeline::network::{NetworkBinding, DEFAULT_HOST_TAP, DEFAULT_TAP_DEVICES};
use board_pipeline::preflight::{check_required_tools, EMULATOR_TOOLS};
use board_pipeline::process::HostRunner;

#[derive(Debug, Args)]
pub(crate) struct EmulateArgs {
    /// Path to the robust_proxies delivery archive
    delivery: String,

    /// Where to put the archive's contents [default: fresh directory under --temp-root]
    #[arg(short = 'd', long)]
    dest: Option<String>,

    /// Where to put the build's artefacts [default: <dest>.working-dir]
    #[arg(short = 'w', long)]
    working_dir: Option<String>,

    /// Buildroot source tree
    #[arg(long, env = "BUILDROOT", value_name = "DIR")]
    buildroot: String,

    /// Buildroot defconfig provided by the delivery
    #[arg(long, default_value = DEFAULT_DEFCONFIG)]
    defconfig: String,

    /// Host address bound to the emulator's tap device
    #[arg(long, default_value = "192.168.18.1/24", value_name = "CIDR")]
    host_address: String,

    /// Start the VM once the image is built
    #[arg(long)]
    start_vm: bool,

    /// Seconds to wait before starting the VM
    #[arg(long, default_value_t = DEFAULT_LAUNCH_DELAY.as_secs())]
    launch_delay_secs: u64,

    /// Directory under which the default destination is created [default: system temp dir]
    #[arg(long, value_name = "DIR")]
    temp_root: Option<String>,
}

pub(crate) fn run_emulate(args: EmulateArgs) -> Result<()> {
    let resolver = PathResolver::from_process()?;
    let opts = EmulatorOptions {
        delivery: resolver.resolve(&args.delivery),
        dest: args.dest.as_deref().map(|d| resolver.resolve(d)),
        working_dir: args.working_dir.as_deref().map(|w| resolver.resolve(w)),
        buildroot: resolver.resolve(&args.buildroot),
        defconfig: args.defconfig,
        taps: DEFAULT_TAP_DEVICES.iter().map(|t| t.to_string()).collect(),
        host_binding: NetworkBinding::parse(DEFAULT_HOST_TAP, &args.host_address)?,
        start_vm: args.start_vm,
        launch_delay: Duration::from_secs(args.launch_delay_secs),
        temp_root: args
            .temp_root
            .as_deref()
            .map(|t| resolver.resolve(t))
            .unwrap_or_else(|| resolver.temp().to_path_buf()),
    };
    tracing::debug!("{:#?}", opts);

    check_required_tools(EMULATOR_TOOLS)?;
    let outcome = EmulatorPipeline::new(&opts, &HostRunner).run()?;
    if let Some(dest) = &outcome.workspace {
        println!("[qemu:{}] delivery at {}", outcome.final_stage, dest.display());
    }
    Ok(())
}
