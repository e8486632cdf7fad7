//! Board pipeline: compile, extract, configure, build, deploy.
//!
//! Stages run strictly in order and each blocks on its child process. The
//! first failure ends the run; nothing already done is rolled back, so the
//! workspace of a failed run stays on disk for inspection.

use anyhow::Result;
use std::path::PathBuf;

use crate::artifact::locate_release_archive;
use crate::bitbake;
use crate::context::PipelineContext;
use crate::deploy::{execute_plan, DeploymentChannel, LocalDeviceSink, RemoteShellSink, WritePlan};
use crate::diagnostics::classify_compile;
use crate::error::{exit_code_for, PipelineError};
use crate::layers::BuildLayerConfig;
use crate::lock::BuildDirLock;
use crate::manifest::{RunManifest, RunStatus};
use crate::network::{ensure_address, subnet_present, NetworkBinding, ProvisionOutcome};
use crate::process::{Cmd, Runner};
use crate::stage::{Stage, StageResult};
use crate::workspace::{extract_archive, Workspace};

/// Everything the operator gets back from a successful run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub final_stage: Stage,
    pub results: Vec<StageResult>,
    pub workspace: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
}

/// Stage results of one run, mirrored into its manifest once a workspace exists.
#[derive(Debug, Default)]
pub(crate) struct RunLog {
    current: Option<Stage>,
    results: Vec<StageResult>,
    manifest: Option<RunManifest>,
}

impl RunLog {
    pub(crate) fn enter(&mut self, stage: Stage) {
        self.current = Some(stage);
    }

    /// Start persisting. Results recorded so far are written too.
    pub(crate) fn attach(&mut self, workspace: &Workspace, board: &str) -> Result<()> {
        let mut manifest = RunManifest::start(workspace.run_id(), board, workspace.path());
        manifest.stages = self.results.clone();
        manifest.write()?;
        self.manifest = Some(manifest);
        Ok(())
    }

    pub(crate) fn manifest_mut(&mut self) -> Option<&mut RunManifest> {
        self.manifest.as_mut()
    }

    pub(crate) fn record(&mut self, result: StageResult) -> Result<()> {
        self.results.push(result.clone());
        if let Some(manifest) = self.manifest.as_mut() {
            manifest.record(result);
            manifest.write()?;
        }
        Ok(())
    }

    pub(crate) fn finish(mut self, workspace: Option<PathBuf>) -> Result<PipelineOutcome> {
        if let Some(manifest) = self.manifest.as_mut() {
            manifest.finish(RunStatus::Success);
            manifest.write()?;
        }
        Ok(PipelineOutcome {
            final_stage: Stage::Done,
            manifest: self.manifest.as_ref().map(RunManifest::path),
            results: self.results,
            workspace,
        })
    }

    /// Record the failing stage and mark the run failed. Persisting the
    /// manifest is best effort here: the stage error is what gets reported.
    pub(crate) fn abort(&mut self, err: &anyhow::Error) {
        let stage = self.current.unwrap_or(Stage::Init);
        let mut result =
            StageResult::failure(stage, exit_code_for(err)).with_message(format!("{:#}", err));
        if let Some(diagnostic) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<PipelineError>())
            .and_then(PipelineError::diagnostic)
        {
            result = result.with_diagnostic(diagnostic.clone());
        }
        self.results.push(result.clone());
        tracing::error!("[{}] aborted: {:#}", stage, err);

        if let Some(manifest) = self.manifest.as_mut() {
            manifest.record(result);
            manifest.finish(RunStatus::Failed);
            if let Err(write_err) = manifest.write() {
                eprintln!(
                    "[{}] warning: failed to persist run manifest: {write_err:#}",
                    Stage::Aborted
                );
            }
        }
    }
}

/// Checks that must pass before the first stage starts.
pub fn validate(ctx: &PipelineContext, runner: &dyn Runner) -> Result<()> {
    ctx.check_paths()?;
    if let Some(DeploymentChannel::RemoteSecureShell {
        interface: None, ..
    }) = &ctx.channel
    {
        let binding = remote_binding(ctx, "any")?;
        if !subnet_present(runner, &binding)? {
            return Err(PipelineError::NetworkPrecondition(format!(
                "no host interface is in the subnet of {}; pass --network-interface to bind it",
                binding.cidr()
            ))
            .into());
        }
    }
    Ok(())
}

pub struct BoardPipeline<'a> {
    ctx: &'a PipelineContext,
    runner: &'a dyn Runner,
}

impl<'a> BoardPipeline<'a> {
    pub fn new(ctx: &'a PipelineContext, runner: &'a dyn Runner) -> Self {
        Self { ctx, runner }
    }

    pub fn run(&self) -> Result<PipelineOutcome> {
        let mut log = RunLog::default();
        match self.run_stages(&mut log) {
            Ok(workspace) => log.finish(workspace),
            Err(err) => {
                log.abort(&err);
                Err(err)
            }
        }
    }

    fn run_stages(&self, log: &mut RunLog) -> Result<Option<PathBuf>> {
        let ctx = self.ctx;
        let board = ctx.profile.board.as_str();

        log.enter(Stage::Compiling);
        let compiled = self.compile()?;
        log.record(compiled)?;
        if ctx.compile_only {
            println!("[{board}:{}] compile-only run, stopping", Stage::Compiling);
            return Ok(None);
        }

        log.enter(Stage::Extracting);
        let archive =
            locate_release_archive(&ctx.release_dir(), &ctx.profile.suffix_parts())?;
        let workspace = Workspace::create(&ctx.temp_root, board)?;
        log.attach(&workspace, board)?;
        println!(
            "[{board}:{}] {} -> {}",
            Stage::Extracting,
            archive.display(),
            workspace.path().display()
        );
        extract_archive(self.runner, &archive, workspace.path())?;
        log.record(StageResult::success(Stage::Extracting))?;

        let build_dir = ctx.build_dir();
        let lock = BuildDirLock::acquire(&build_dir)?;

        log.enter(Stage::ConfiguringLayers);
        let layers = BuildLayerConfig::for_sdk(
            &ctx.sdk,
            &ctx.profile.layers,
            workspace.path(),
            &ctx.profile.run_layer,
        );
        let conf = layers.write(&build_dir)?;
        println!("[{board}:{}] wrote {}", Stage::ConfiguringLayers, conf.display());
        log.record(StageResult::success(Stage::ConfiguringLayers))?;

        log.enter(Stage::BuildingImage);
        let env = bitbake::resolve_setup_environment(
            self.runner,
            &ctx.setup_script(),
            &build_dir,
            ctx.env_overlay(),
        )?;
        bitbake::invoke(self.runner, &build_dir, &ctx.profile.image_target, &env)?;
        drop(lock);
        log.record(StageResult::success(Stage::BuildingImage))?;

        log.enter(Stage::Deploying);
        let deployed = self.deploy(log)?;
        log.record(deployed)?;

        println!("[{board}:{}] run {}", Stage::Done, workspace.run_id());
        Ok(Some(workspace.path().to_path_buf()))
    }

    fn compile(&self) -> Result<StageResult> {
        let ctx = self.ctx;
        let cmd = Cmd::new("make")
            .arg("-C")
            .arg_path(&ctx.provencore)
            .arg(&ctx.profile.make_target)
            .envs(ctx.env_overlay());
        println!("[{}:{}] {}", ctx.profile.board, Stage::Compiling, cmd);
        let output = self.runner.capture_stderr(&cmd)?;
        let result = classify_compile(output.exit_code(), &output.stderr);

        if let Some(exit_code) = result.exit_code() {
            return Err(PipelineError::StageFailed {
                stage: Stage::Compiling,
                exit_code,
                diagnostic: result.diagnostic,
                stderr: output.stderr,
            }
            .into());
        }
        if let Some(diagnostic) = &result.diagnostic {
            tracing::warn!(
                "[{}] succeeded but left a log: {}",
                Stage::Compiling,
                diagnostic.display()
            );
            if let Some(message) = &result.message {
                println!("{message}");
            }
            println!("Check file://{}", diagnostic.display());
        }
        Ok(result)
    }

    fn deploy(&self, log: &mut RunLog) -> Result<StageResult> {
        let ctx = self.ctx;
        let Some(channel) = &ctx.channel else {
            return Err(PipelineError::Usage("no deployment channel configured".to_string()).into());
        };

        let plan = WritePlan::from_artifacts(&ctx.profile.images, &ctx.images_dir())?;
        let digests = plan.digests()?;
        if let Some(manifest) = log.manifest_mut() {
            manifest.images = digests;
        }

        let mut messages = Vec::new();
        let report = match channel {
            DeploymentChannel::LocalBlockDevice { device } => {
                execute_plan(&plan, &LocalDeviceSink::new(self.runner, device.clone()))
            }
            DeploymentChannel::RemoteSecureShell {
                host,
                device,
                interface,
            } => {
                if let Some(interface) = interface {
                    let binding = remote_binding(ctx, interface)?;
                    if ensure_address(self.runner, &binding)? == ProvisionOutcome::Created {
                        messages.push(format!("bound {}", binding));
                    }
                }
                execute_plan(&plan, &RemoteShellSink::new(self.runner, host, device))
            }
        };
        let result = report.into_result()?;
        println!(
            "[{}:{}] images written to {}",
            ctx.profile.board,
            Stage::Deploying,
            channel.describe()
        );
        if messages.is_empty() {
            Ok(result)
        } else {
            Ok(result.with_message(messages.join("; ")))
        }
    }
}

fn remote_binding(ctx: &PipelineContext, interface: &str) -> Result<NetworkBinding> {
    NetworkBinding::new(
        interface,
        ctx.profile.remote.address,
        ctx.profile.remote.prefix_len,
    )
}
