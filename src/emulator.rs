//! Emulated-machine pipeline.
//!
//! Extracts a robust-proxies delivery, builds the QEMU virt image with
//! Buildroot using the delivery as `BR2_EXTERNAL`, prepares the tap network
//! the emulator expects and optionally boots it.

use anyhow::Result;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::buildroot::{set_config_string, BuildrootTree, PROVENCORE_EXTERNAL_PATH_KEY};
use crate::error::PipelineError;
use crate::network::{
    bring_up, ensure_interface_address, ensure_tap_devices, NetworkBinding, ProvisionOutcome,
};
use crate::pipeline::{PipelineOutcome, RunLog};
use crate::process::{Cmd, Runner};
use crate::stage::{Stage, StageResult};
use crate::workspace::{extract_archive, Workspace};

pub const WORKSPACE_SUFFIX: &str = "ls1043ardb-qemu";
pub const DEFAULT_LAUNCH_DELAY: Duration = Duration::from_secs(10);

const EXTERNAL_TREE: &str = "integration/buildroot_external";
const RUN_SCRIPT: &str = "board/qemu/aarch64-virt/scripts/run_simu.sh";
const RUN_ARGS: &[&str] = &["-gicv3", "-netdev", "tap", "-dtb", "pnc_virt.dtb", "-smp", "1"];

#[derive(Debug, Clone)]
pub struct EmulatorOptions {
    pub delivery: PathBuf,
    /// Extraction target. A fresh workspace under `temp_root` when unset.
    pub dest: Option<PathBuf>,
    /// Buildroot `O=` directory. `<dest>.working-dir` when unset.
    pub working_dir: Option<PathBuf>,
    pub buildroot: PathBuf,
    pub defconfig: String,
    pub taps: Vec<String>,
    pub host_binding: NetworkBinding,
    pub start_vm: bool,
    pub launch_delay: Duration,
    pub temp_root: PathBuf,
}

/// Paths an emulator run settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorLayout {
    pub dest: PathBuf,
    pub working_dir: PathBuf,
    pub external: PathBuf,
}

impl EmulatorLayout {
    pub fn new(dest: &Path, working_dir: Option<&Path>) -> Self {
        let working_dir = working_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_working_dir(dest));
        Self {
            dest: dest.to_path_buf(),
            external: dest.join(EXTERNAL_TREE),
            working_dir,
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.working_dir.join("images")
    }

    pub fn run_script(&self) -> PathBuf {
        self.external.join(RUN_SCRIPT)
    }

    /// What the operator types to boot the image by hand.
    pub fn instructions(&self) -> String {
        format!(
            "\nRun the following commands to start the emulated machine:\n\n    \
             # run_simu.sh depends on specific files being in the CWD\n    \
             cd {}\n    \
             {} {}\n\n\
             Quit qemu by entering the following key sequence:\n\n    \
             C-a c q RET\n",
            self.images_dir().display(),
            self.run_script().display(),
            RUN_ARGS.join(" ")
        )
    }
}

/// `<dest>.working-dir`, next to `dest`.
pub fn default_working_dir(dest: &Path) -> PathBuf {
    let mut name: OsString = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".working-dir");
    dest.with_file_name(name)
}

pub struct EmulatorPipeline<'a> {
    opts: &'a EmulatorOptions,
    runner: &'a dyn Runner,
}

impl<'a> EmulatorPipeline<'a> {
    pub fn new(opts: &'a EmulatorOptions, runner: &'a dyn Runner) -> Self {
        Self { opts, runner }
    }

    pub fn run(&self) -> Result<PipelineOutcome> {
        let mut log = RunLog::default();
        match self.run_stages(&mut log) {
            Ok(dest) => log.finish(Some(dest)),
            Err(err) => {
                log.abort(&err);
                Err(err)
            }
        }
    }

    fn run_stages(&self, log: &mut RunLog) -> Result<PathBuf> {
        let opts = self.opts;

        log.enter(Stage::Extracting);
        if !opts.delivery.is_file() {
            return Err(PipelineError::not_found("delivery archive", &opts.delivery).into());
        }
        if !opts.buildroot.is_dir() {
            return Err(PipelineError::not_found("buildroot source tree", &opts.buildroot).into());
        }
        let workspace = match &opts.dest {
            Some(dest) => Workspace::at(dest)?,
            None => Workspace::create(&opts.temp_root, WORKSPACE_SUFFIX)?,
        };
        log.attach(&workspace, WORKSPACE_SUFFIX)?;
        let layout = EmulatorLayout::new(workspace.path(), opts.working_dir.as_deref());
        extract_archive(self.runner, &opts.delivery, &layout.dest)?;
        println!("[qemu:{}] untarred delivery into {}", Stage::Extracting, layout.dest.display());
        log.record(StageResult::success(Stage::Extracting))?;

        let tree = BuildrootTree {
            source: opts.buildroot.clone(),
            external: layout.external.clone(),
            output: layout.working_dir.clone(),
            env: BTreeMap::from([(
                "PATH_TO_PNC_DELIVERY".to_string(),
                layout.external.display().to_string(),
            )]),
        };

        log.enter(Stage::ConfiguringBuild);
        tree.make(self.runner, Stage::ConfiguringBuild, Some("list-defconfigs"))?;
        tree.make(self.runner, Stage::ConfiguringBuild, Some(opts.defconfig.as_str()))?;
        set_config_string(
            &tree.config_path(),
            PROVENCORE_EXTERNAL_PATH_KEY,
            &layout.dest.display().to_string(),
        )?;
        println!("[qemu:{}] built buildroot config", Stage::ConfiguringBuild);
        log.record(StageResult::success(Stage::ConfiguringBuild))?;

        log.enter(Stage::BuildingImage);
        tree.make(self.runner, Stage::BuildingImage, None)?;
        log.record(StageResult::success(Stage::BuildingImage))?;

        log.enter(Stage::ProvisioningNetwork);
        let warnings = self.provision_network();
        log.record(StageResult::success(Stage::ProvisioningNetwork).with_warnings(warnings))?;

        log.enter(Stage::Launching);
        println!("{}", layout.instructions());
        if opts.start_vm {
            self.launch(&layout)?;
        }
        log.record(StageResult::success(Stage::Launching))?;

        Ok(layout.dest)
    }

    /// Taps, host address and link state. Problems are returned as warnings.
    fn provision_network(&self) -> Vec<String> {
        let opts = self.opts;
        let mut report = ensure_tap_devices(self.runner, &opts.taps);
        match ensure_interface_address(self.runner, &opts.host_binding) {
            Ok(ProvisionOutcome::Created) => report.created.push(opts.host_binding.cidr()),
            Ok(ProvisionOutcome::AlreadyPresent) => report.present.push(opts.host_binding.cidr()),
            Err(err) => report.warn(format!("binding {}: {:#}", opts.host_binding, err)),
        }
        if let Err(err) = bring_up(self.runner, &opts.host_binding.interface) {
            report.warn(format!("{:#}", err));
        }
        report.warnings
    }

    fn launch(&self, layout: &EmulatorLayout) -> Result<()> {
        let delay = self.opts.launch_delay;
        println!("\nstarting vm in {} seconds", delay.as_secs());
        std::thread::sleep(delay);

        let images = layout.images_dir();
        let cmd = Cmd::new(layout.run_script()).args(RUN_ARGS).dir(&images);
        let output = self.runner.stream(&cmd)?;
        if !output.success() {
            return Err(PipelineError::StageFailed {
                stage: Stage::Launching,
                exit_code: output.exit_code(),
                diagnostic: None,
                stderr: String::new(),
            }
            .into());
        }
        Ok(())
    }
}
