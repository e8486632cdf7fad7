//! External command execution.
//!
//! Every stage talks to the outside world through a [`Cmd`] handed to a
//! [`Runner`]. [`HostRunner`] spawns real processes; tests substitute a
//! recording runner so stage sequencing can be checked without `make`,
//! `bitbake` or a block device.
//!
//! A non-zero exit status is never an error at this level. Runners only fail
//! when the child cannot be spawned or waited on; callers decide what an exit
//! code means.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Exit code reported when a child was killed by a signal or never produced one.
pub const EXIT_SENTINEL: i32 = 1;

/// Description of one external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: BTreeMap<OsString, OsString>,
    env_clear: bool,
    dir: Option<PathBuf>,
    stdin: Option<PathBuf>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: BTreeMap::new(),
            env_clear: false,
            dir: None,
            stdin: None,
        }
    }

    /// Command that needs root. Goes through `sudo` unless we already are root.
    pub fn privileged(program: impl AsRef<OsStr>) -> Self {
        if is_root() {
            Self::new(program)
        } else {
            Self::new("sudo").arg(program)
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (k, v) in vars {
            self.envs
                .insert(k.as_ref().to_os_string(), v.as_ref().to_os_string());
        }
        self
    }

    /// Start the child from an empty environment instead of inheriting ours.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    /// Feed the contents of `path` to the child's stdin.
    pub fn stdin_file(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Arguments as lossy strings, convenient for matching and logging.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn get_envs(&self) -> &BTreeMap<OsString, OsString> {
        &self.envs
    }

    pub fn clears_env(&self) -> bool {
        self.env_clear
    }

    pub fn get_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn get_stdin(&self) -> Option<&Path> {
        self.stdin.as_deref()
    }

    /// `interactive` children share the operator's stdin unless a file is given.
    fn to_command(&self, interactive: bool) -> Result<Command> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if self.env_clear {
            command.env_clear();
        }
        command.envs(&self.envs);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        match &self.stdin {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("opening '{}' as stdin for {}", path.display(), self))?;
                command.stdin(Stdio::from(file));
            }
            None if interactive => {
                command.stdin(Stdio::inherit());
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        Ok(command)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Exit status and captured text of a finished command.
///
/// In stream mode `stdout` and `stderr` are empty: the operator already saw them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, or [`EXIT_SENTINEL`] when the child died without one.
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(EXIT_SENTINEL)
    }
}

/// Executes [`Cmd`]s.
pub trait Runner {
    /// Run to completion with stdout and stderr captured.
    fn capture(&self, cmd: &Cmd) -> Result<CmdOutput>;

    /// Run to completion with stdout and stderr going straight to the operator.
    fn stream(&self, cmd: &Cmd) -> Result<CmdOutput>;

    /// Run to completion with stdout going to the operator and stderr captured.
    fn capture_stderr(&self, cmd: &Cmd) -> Result<CmdOutput> {
        self.capture(cmd)
    }
}

impl<R: Runner + ?Sized> Runner for &R {
    fn capture(&self, cmd: &Cmd) -> Result<CmdOutput> {
        (**self).capture(cmd)
    }

    fn stream(&self, cmd: &Cmd) -> Result<CmdOutput> {
        (**self).stream(cmd)
    }

    fn capture_stderr(&self, cmd: &Cmd) -> Result<CmdOutput> {
        (**self).capture_stderr(cmd)
    }
}

/// Runs commands on this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn capture(&self, cmd: &Cmd) -> Result<CmdOutput> {
        tracing::debug!("capture: {}", cmd);
        let output = cmd
            .to_command(false)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("running {}", cmd))?;
        Ok(CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn stream(&self, cmd: &Cmd) -> Result<CmdOutput> {
        tracing::debug!("stream: {}", cmd);
        let status = cmd
            .to_command(true)?
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("running {}", cmd))?;
        Ok(CmdOutput {
            code: status.code(),
            ..Default::default()
        })
    }

    fn capture_stderr(&self, cmd: &Cmd) -> Result<CmdOutput> {
        tracing::debug!("capture stderr: {}", cmd);
        let output = cmd
            .to_command(false)?
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("running {}", cmd))?;
        Ok(CmdOutput {
            code: output.status.code(),
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
