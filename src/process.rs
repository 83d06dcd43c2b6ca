//! Command execution with captured diagnostics.
//!
//! Every external tool rootcast drives (the Go toolchain, mkfs.vfat, mtools,
//! mksquashfs) goes through [`Cmd`], so failures always carry the tool's
//! stderr. Compiles run through [`Cmd::output`], which is async and kills the
//! child when the future is dropped.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            allow_fail: false,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_owned());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Human-readable command line, used in log output.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    fn std_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    fn check(&self, result: CommandResult) -> Result<CommandResult> {
        if self.allow_fail || result.success() {
            return Ok(result);
        }
        let prefix = self
            .error_prefix
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.program_name()));
        let stderr = result.stderr_trimmed();
        if stderr.is_empty() {
            bail!("{} (exit code {})", prefix, result.code());
        }
        bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        log::debug!("running {}", self.display());
        let output = self.std_command().output().with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program_name())
        })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        self.check(result)
    }

    /// Run the command on the tokio runtime and capture output.
    ///
    /// The child is killed if the returned future is dropped before the
    /// command finishes.
    pub async fn output(self) -> Result<CommandResult> {
        log::debug!("running {}", self.display());
        let mut cmd = tokio::process::Command::from(self.std_command());
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let output = cmd.output().await.with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program_name())
        })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        self.check(result)
    }
}

/// Check that every host tool is on PATH (or is an existing path).
pub fn require_tools<'a>(tools: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let missing: Vec<&str> = tools
        .into_iter()
        .filter(|tool| which::which(tool).is_err())
        .collect();
    if !missing.is_empty() {
        bail!(
            "Missing host tools: {}\n\
             Install dosfstools, mtools and squashfs-tools.",
            missing.join(", ")
        );
    }
    Ok(())
}
