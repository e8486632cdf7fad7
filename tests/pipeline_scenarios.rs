//! End-to-end runs of the board and emulator pipelines against a recording
//! runner that plays every external tool.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use board_pipeline::config::BoardProfile;
use board_pipeline::context::{ContextInputs, PathResolver, PipelineContext};
use board_pipeline::emulator::{EmulatorOptions, EmulatorPipeline};
use board_pipeline::layers::conf_path;
use board_pipeline::manifest::{RunManifest, RunStatus};
use board_pipeline::network::{NetworkBinding, DEFAULT_TAP_DEVICES};
use board_pipeline::pipeline::{validate, BoardPipeline};
use board_pipeline::{Cmd, CmdOutput, PipelineError, Runner, Stage};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Capture,
    CaptureStderr,
    Stream,
}

#[derive(Debug, Clone)]
struct Call {
    program: String,
    args: Vec<String>,
    mode: Mode,
    envs: BTreeMap<String, String>,
    clears_env: bool,
}

impl Call {
    /// Program name with any `sudo` prefix removed.
    fn tool(&self) -> &str {
        if self.program == "sudo" {
            &self.args[0]
        } else {
            &self.program
        }
    }
}

/// Plays `make`, `tar`, `sh`, `bitbake`, `dd`, `ssh`, `ip` and `run_simu.sh`.
#[derive(Default)]
struct RecordingRunner {
    calls: RefCell<Vec<Call>>,
    compile: Option<CmdOutput>,
    host_addrs: String,
}

impl RecordingRunner {
    fn tools(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|c| c.tool().to_string())
            .collect()
    }

    fn respond(&self, cmd: &Cmd, mode: Mode) -> CmdOutput {
        let call = Call {
            program: cmd.program().to_string_lossy().into_owned(),
            args: cmd.arg_strings(),
            mode,
            envs: cmd
                .get_envs()
                .iter()
                .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
                .collect(),
            clears_env: cmd.clears_env(),
        };
        self.calls.borrow_mut().push(call.clone());

        let args = &call.args;
        match call.tool() {
            "make" if args.iter().any(|a| a.starts_with("BR2_EXTERNAL=")) => {
                let output = args
                    .iter()
                    .find_map(|a| a.strip_prefix("O="))
                    .map(PathBuf::from)
                    .unwrap();
                fs::create_dir_all(&output).unwrap();
                if args.last().map(String::as_str) == Some("pnc_qemu_virt_robust_proxies_defconfig") {
                    fs::write(output.join(".config"), "BR2_aarch64=y\n").unwrap();
                }
                CmdOutput::with_code(0)
            }
            "make" => self.compile.clone().unwrap_or_else(|| CmdOutput::with_code(0)),
            "tar" => {
                let dest = PathBuf::from(&args[args.iter().position(|a| a == "-C").unwrap() + 1]);
                fs::create_dir_all(dest.join("meta-provenrun/conf")).unwrap();
                fs::write(dest.join("meta-provenrun/conf/layer.conf"), "BBPATH .= \"\"\n").unwrap();
                CmdOutput::with_code(0)
            }
            "sh" => {
                let mut dump = String::from("PATH=/sdk/bin:/usr/bin\0MACHINE=ls1043ardb\0");
                for (key, value) in &call.envs {
                    dump.push_str(&format!("{key}={value}\0"));
                }
                CmdOutput {
                    code: Some(0),
                    stdout: dump,
                    stderr: String::new(),
                }
            }
            "ip" if args.contains(&"show".to_string()) && args.contains(&"addr".to_string()) => {
                CmdOutput {
                    code: Some(0),
                    stdout: self.host_addrs.clone(),
                    stderr: String::new(),
                }
            }
            "ip" if args.contains(&"link".to_string()) && args.contains(&"show".to_string()) => {
                CmdOutput::with_code(1)
            }
            _ => CmdOutput::with_code(0),
        }
    }
}

impl Runner for RecordingRunner {
    fn capture(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
        Ok(self.respond(cmd, Mode::Capture))
    }

    fn stream(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
        Ok(self.respond(cmd, Mode::Stream))
    }

    fn capture_stderr(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
        Ok(self.respond(cmd, Mode::CaptureStderr))
    }
}

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
}

impl Fixture {
    /// ProvenCore tree with one release, an SDK with its setup script and
    /// deploy images, and an empty temp root.
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let releases = root.join("pnc/releases/ls1043ardb_robust_proxies");
        fs::create_dir_all(&releases).unwrap();
        fs::write(releases.join("foo-1.0.tar.xz"), b"release").unwrap();
        fs::create_dir_all(root.join("platform-integration")).unwrap();

        let build = root.join("sdk/build_ls1043ardb");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("SOURCE_THIS"), "export MACHINE=ls1043ardb\n").unwrap();
        let images = build.join("tmp/deploy/images/ls1043ardb/atf");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("bl2_sd.pbl"), vec![0xaa; 4096]).unwrap();
        fs::write(images.join("fip_uboot.bin"), vec![0x55; 8192]).unwrap();

        fs::create_dir_all(root.join("runs")).unwrap();
        Self { _temp: temp, root }
    }

    fn context(&self, inputs: ContextInputs) -> PipelineContext {
        let resolver = PathResolver::new(self.root.clone(), None, self.root.join("runs"));
        PipelineContext::from_inputs(inputs, BoardProfile::default(), &resolver).unwrap()
    }

    fn inputs(&self) -> ContextInputs {
        ContextInputs {
            cross_compile: Some("/opt/gcc/bin/aarch64-none-elf-".into()),
            platform_integration: Some("platform-integration".into()),
            provencore: Some("pnc".into()),
            yocto: Some("sdk".into()),
            sdcard: Some("/dev/sdX".into()),
            sdcard_partition: Some("/dev/sdX1".into()),
            ..Default::default()
        }
    }

    fn workspaces(&self) -> Vec<PathBuf> {
        fs::read_dir(self.root.join("runs"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }
}

#[test]
fn release_is_extracted_and_becomes_the_last_layer() {
    let fx = Fixture::new();
    let ctx = fx.context(fx.inputs());
    let runner = RecordingRunner::default();

    let outcome = BoardPipeline::new(&ctx, &runner).run().unwrap();
    assert_eq!(outcome.final_stage, Stage::Done);

    let workspaces = fx.workspaces();
    assert_eq!(workspaces.len(), 1);
    let workspace = &workspaces[0];
    assert_eq!(outcome.workspace.as_ref(), Some(workspace));

    let tar = runner.calls.borrow()[1].clone();
    assert_eq!(tar.tool(), "tar");
    assert_eq!(
        PathBuf::from(&tar.args[1]),
        fx.root.join("pnc/releases/ls1043ardb_robust_proxies/foo-1.0.tar.xz")
    );
    assert_eq!(tar.args[4], "--strip-components=1");

    let conf = fs::read_to_string(conf_path(&fx.root.join("sdk/build_ls1043ardb"))).unwrap();
    let layers: Vec<&str> = conf
        .lines()
        .filter(|l| l.ends_with(" \\") && l.starts_with("    /"))
        .map(|l| l.trim().trim_end_matches(" \\"))
        .collect();
    assert_eq!(
        Path::new(layers.last().unwrap()),
        workspace.join("meta-provenrun")
    );
    assert_eq!(layers.len(), 18);
}

#[test]
fn stages_run_in_order_and_manifest_records_success() {
    let fx = Fixture::new();
    let ctx = fx.context(fx.inputs());
    let runner = RecordingRunner::default();

    let outcome = BoardPipeline::new(&ctx, &runner).run().unwrap();
    assert_eq!(runner.tools(), vec!["make", "tar", "sh", "bitbake", "dd", "dd"]);

    let calls = runner.calls.borrow();
    assert_eq!(calls[0].mode, Mode::CaptureStderr);
    assert_eq!(calls[3].mode, Mode::Stream);
    assert_eq!(
        calls[0].args,
        vec![
            "-C".to_string(),
            fx.root.join("pnc").display().to_string(),
            "ls1043ardb_robust_proxies_release".to_string(),
        ]
    );

    let manifest = RunManifest::load(outcome.manifest.as_ref().unwrap()).unwrap();
    assert_eq!(manifest.status, RunStatus::Success);
    let stages: Vec<Stage> = manifest.stages.iter().map(|s| s.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Compiling,
            Stage::Extracting,
            Stage::ConfiguringLayers,
            Stage::BuildingImage,
            Stage::Deploying
        ]
    );
    assert_eq!(manifest.images.len(), 2);
    assert_eq!(manifest.images[1].size_bytes, 8192);
}

#[test]
fn compile_failure_with_log_aborts_before_extraction() {
    let fx = Fixture::new();
    let ctx = fx.context(fx.inputs());
    let runner = RecordingRunner {
        compile: Some(CmdOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "make[1]: *** [all] Error 1\nCheck /var/log/build123.log too\n".into(),
        }),
        ..Default::default()
    };

    let err = BoardPipeline::new(&ctx, &runner).run().unwrap_err();
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::StageFailed {
            stage,
            exit_code,
            diagnostic,
            stderr,
        }) => {
            assert_eq!(*stage, Stage::Compiling);
            assert_eq!(*exit_code, 1);
            assert_eq!(diagnostic.as_deref(), Some(Path::new("/var/log/build123.log")));
            assert!(stderr.contains("Check /var/log/build123.log too"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(board_pipeline::exit_code_for(&err), 1);
    assert_eq!(runner.tools(), vec!["make"]);
    assert!(fx.workspaces().is_empty());
}

#[test]
fn operator_environment_reaches_setup_script_and_bitbake() {
    let fx = Fixture::new();
    let ctx = fx.context(ContextInputs {
        cross_compile: Some("aarch64-linux-gnu-".into()),
        ..fx.inputs()
    });
    let runner = RecordingRunner::default();

    BoardPipeline::new(&ctx, &runner).run().unwrap();
    let calls = runner.calls.borrow();
    let provencore = fx.root.join("pnc").display().to_string();

    let compile = &calls[0];
    let setup = calls.iter().find(|c| c.tool() == "sh").unwrap();
    let bitbake = calls.iter().find(|c| c.tool() == "bitbake").unwrap();
    for call in [compile, setup, bitbake] {
        assert_eq!(call.envs["PROVENCORE"], provencore, "{}", call.program);
        assert_eq!(call.envs["CROSS_COMPILE"], "aarch64-linux-gnu-", "{}", call.program);
        assert_eq!(call.envs["SDCARD_PARTITION"], "/dev/sdX1", "{}", call.program);
    }
    assert!(!setup.clears_env);
    assert!(bitbake.clears_env);
    assert_eq!(bitbake.envs["MACHINE"], "ls1043ardb");
}

#[test]
fn compile_success_with_log_continues_and_keeps_diagnostic() {
    let fx = Fixture::new();
    let ctx = fx.context(fx.inputs());
    let runner = RecordingRunner {
        compile: Some(CmdOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: "warning: unused variable\nCheck /var/log/build456.log too\n".into(),
        }),
        ..Default::default()
    };

    let outcome = BoardPipeline::new(&ctx, &runner).run().unwrap();
    assert_eq!(runner.tools(), vec!["make", "tar", "sh", "bitbake", "dd", "dd"]);

    let manifest = RunManifest::load(outcome.manifest.as_ref().unwrap()).unwrap();
    assert_eq!(manifest.status, RunStatus::Success);
    let compiled = &manifest.stages[0];
    assert_eq!(compiled.stage, Stage::Compiling);
    assert!(compiled.is_success());
    assert_eq!(
        compiled.diagnostic.as_deref(),
        Some(Path::new("/var/log/build456.log"))
    );
    assert_eq!(compiled.message.as_deref(), Some("Compilation successful"));
}

#[test]
fn compile_only_stops_after_compiling() {
    let fx = Fixture::new();
    let ctx = fx.context(ContextInputs {
        compile_only: true,
        sdcard: None,
        ..fx.inputs()
    });
    let runner = RecordingRunner::default();

    let outcome = BoardPipeline::new(&ctx, &runner).run().unwrap();
    assert_eq!(runner.tools(), vec!["make"]);
    assert_eq!(outcome.results.len(), 1);
    assert!(outcome.workspace.is_none());
    assert!(fx.workspaces().is_empty());
}

#[test]
fn image_build_failure_leaves_workspace_and_failed_manifest() {
    struct FailingBitbake(RecordingRunner);

    impl Runner for FailingBitbake {
        fn capture(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
            self.0.capture(cmd)
        }

        fn capture_stderr(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
            self.0.capture_stderr(cmd)
        }

        fn stream(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
            self.0.stream(cmd)?;
            if cmd.program() == "bitbake" {
                return Ok(CmdOutput::with_code(3));
            }
            Ok(CmdOutput::with_code(0))
        }
    }

    let fx = Fixture::new();
    let ctx = fx.context(fx.inputs());
    let runner = FailingBitbake(RecordingRunner::default());

    let err = BoardPipeline::new(&ctx, &runner).run().unwrap_err();
    assert_eq!(board_pipeline::exit_code_for(&err), 3);
    assert!(!runner.0.tools().contains(&"dd".to_string()));

    let workspace = &fx.workspaces()[0];
    assert!(workspace.join("meta-provenrun/conf/layer.conf").is_file());
    let manifest = RunManifest::load(&workspace.join("run-manifest.json")).unwrap();
    assert_eq!(manifest.status, RunStatus::Failed);
    let last = manifest.stages.last().unwrap();
    assert_eq!(last.stage, Stage::BuildingImage);
    assert_eq!(last.exit_code(), Some(3));
}

#[test]
fn remote_channel_binds_subnet_then_streams_over_ssh() {
    let fx = Fixture::new();
    let ctx = fx.context(ContextInputs {
        sdcard: None,
        via_ssh: true,
        network_interface: Some("enp0s31f6".into()),
        ..fx.inputs()
    });
    let runner = RecordingRunner::default();

    BoardPipeline::new(&ctx, &runner).run().unwrap();
    assert_eq!(
        runner.tools(),
        vec!["make", "tar", "sh", "bitbake", "ip", "ip", "ssh", "ssh"]
    );
    let calls = runner.calls.borrow();
    let bind = &calls[5];
    assert!(bind.args.ends_with(&[
        "addr".to_string(),
        "add".to_string(),
        "192.168.18.1/24".to_string(),
        "dev".to_string(),
        "enp0s31f6".to_string()
    ]));
    assert_eq!(
        calls[7].args,
        vec!["root@192.168.18.6", "dd", "of=/dev/mmcblk0", "bs=512", "seek=131072"]
    );
}

#[test]
fn remote_channel_without_subnet_or_interface_is_rejected() {
    let fx = Fixture::new();
    let ctx = fx.context(ContextInputs {
        sdcard: None,
        via_ssh: true,
        ..fx.inputs()
    });
    let runner = RecordingRunner {
        host_addrs: "2: eth0    inet 10.1.2.3/16 brd 10.1.255.255 scope global eth0\n".into(),
        ..Default::default()
    };

    let err = validate(&ctx, &runner).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::NetworkPrecondition(_))
    ));

    let present = RecordingRunner {
        host_addrs: "2: eth1    inet 192.168.18.20/24 scope global eth1\n".into(),
        ..Default::default()
    };
    validate(&ctx, &present).unwrap();
}

#[test]
fn emulator_flow_configures_buildroot_and_provisions_taps() {
    let temp = TempDir::new().unwrap();
    let delivery = temp.path().join("robust_proxies.tar.xz");
    fs::write(&delivery, b"delivery").unwrap();
    let buildroot = temp.path().join("buildroot-2022.02");
    fs::create_dir_all(&buildroot).unwrap();
    let dest = temp.path().join("dest");

    let opts = EmulatorOptions {
        delivery,
        dest: Some(dest.clone()),
        working_dir: None,
        buildroot,
        defconfig: "pnc_qemu_virt_robust_proxies_defconfig".into(),
        taps: DEFAULT_TAP_DEVICES.iter().map(|t| t.to_string()).collect(),
        host_binding: NetworkBinding::parse("tap2", "192.168.18.1/24").unwrap(),
        start_vm: true,
        launch_delay: Duration::ZERO,
        temp_root: temp.path().to_path_buf(),
    };
    let runner = RecordingRunner::default();

    let outcome = EmulatorPipeline::new(&opts, &runner).run().unwrap();
    assert_eq!(outcome.workspace.as_deref(), Some(dest.as_path()));

    let working_dir = temp.path().join("dest.working-dir");
    let config = fs::read_to_string(working_dir.join(".config")).unwrap();
    assert_eq!(
        config,
        format!(
            "BR2_aarch64=y\nBR2_PACKAGE_PROVENCORE_CONFIG_EXTERNAL_PATH=\"{}\"\n",
            dest.display()
        )
    );

    let calls = runner.calls.borrow();
    let makes: Vec<_> = calls.iter().filter(|c| c.tool() == "make").collect();
    assert_eq!(makes.len(), 3);
    assert_eq!(makes[0].args.last().unwrap(), "list-defconfigs");
    assert!(makes[2].args.last().unwrap().starts_with("O="));
    assert!(makes.iter().all(|c| c.mode == Mode::Stream));

    let tuntaps = calls
        .iter()
        .filter(|c| c.args.contains(&"tuntap".to_string()))
        .count();
    assert_eq!(tuntaps, 3);

    let launch = calls.last().unwrap();
    assert!(launch.program.ends_with("board/qemu/aarch64-virt/scripts/run_simu.sh"));
    assert_eq!(
        launch.args,
        vec!["-gicv3", "-netdev", "tap", "-dtb", "pnc_virt.dtb", "-smp", "1"]
    );

    let manifest = RunManifest::load(&dest.join("run-manifest.json")).unwrap();
    assert_eq!(manifest.status, RunStatus::Success);
    let network = manifest
        .stages
        .iter()
        .find(|s| s.stage == Stage::ProvisioningNetwork)
        .unwrap();
    assert!(network.warnings.is_empty());
}
