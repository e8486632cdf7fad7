use board_pipeline::diagnostics::COMPILATION_FAILED;
use board_pipeline::{exit_code_for, PipelineError, Stage};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod workflows;

/// Compile ProvenCore and bring the result up on an LS1043ARDB or in QEMU.
///
/// Every option can also be supplied through the environment variable named
/// in its help; options given on the command line win.
#[derive(Debug, Parser)]
#[command(name = "board-pipeline", version)]
struct App {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile, build the Yocto image and flash it to an SD card or over SSH
    Flash(workflows::FlashArgs),
    /// Build the QEMU virt image with Buildroot and optionally boot it
    Emulate(workflows::EmulateArgs),
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let app = App::parse();
    tracing::debug!("{:#?}", app);

    let result = match app.command {
        Command::Flash(args) => workflows::run_flash(args),
        Command::Emulate(args) => workflows::run_emulate(args),
    };

    match result {
        Ok(()) => println!("READY"),
        Err(err) => {
            report_failure(&err);
            std::process::exit(exit_code_for(&err));
        }
    }
}

/// Captured stderr of the failing tool, the error, then the log to look at.
fn report_failure(err: &anyhow::Error) {
    let pipeline_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>());
    if let Some(stderr) = pipeline_err.and_then(PipelineError::captured_stderr) {
        eprintln!("{}", stderr.trim_end());
    }
    eprintln!("error: {err:#}");
    if let Some(PipelineError::StageFailed {
        stage: Stage::Compiling,
        diagnostic: Some(_),
        ..
    }) = pipeline_err
    {
        eprintln!("{COMPILATION_FAILED}");
    }
    if let Some(diagnostic) = pipeline_err.and_then(PipelineError::diagnostic) {
        eprintln!("Check file://{}", diagnostic.display());
    }
}
