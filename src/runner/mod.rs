// src/runner/mod.rs

//! External command execution
//!
//! Every mutation and probe the engine performs goes through a
//! [`CommandRunner`]. Commands are described by a typed [`CommandSpec`]
//! (absolute program path, discrete argv, optional stdin and environment)
//! and never by a shell string, so arguments cannot be reinterpreted by a
//! shell.
//!
//! A non-zero exit is not an error at this layer. `run` only fails when the
//! process could not be spawned at all; callers inspect
//! [`CommandResult::success`] and decide what a failure means for them.
//! A timeout kills the child and is reported through `timed_out`, which
//! [`CommandResult::success`] treats exactly like a failing exit code.

mod system;

pub use system::SystemRunner;

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of stderr characters carried into error messages
pub const STDERR_TAIL_CHARS: usize = 500;

/// Absolute paths of every binary the engine invokes
///
/// Programs are never resolved through `PATH`.
pub mod bin {
    pub const A2DISCONF: &str = "/usr/sbin/a2disconf";
    pub const A2ENCONF: &str = "/usr/sbin/a2enconf";
    pub const APACHE2CTL: &str = "/usr/sbin/apache2ctl";
    pub const APT_GET: &str = "/usr/bin/apt-get";
    pub const CAT: &str = "/usr/bin/cat";
    pub const CHMOD: &str = "/usr/bin/chmod";
    pub const CHOWN: &str = "/usr/bin/chown";
    pub const DIG: &str = "/usr/bin/dig";
    pub const DPKG_QUERY: &str = "/usr/bin/dpkg-query";
    pub const LN: &str = "/usr/bin/ln";
    pub const MV: &str = "/usr/bin/mv";
    pub const MYSQL: &str = "/usr/bin/mysql";
    pub const NGINX: &str = "/usr/sbin/nginx";
    pub const RM: &str = "/usr/bin/rm";
    pub const SYSTEMCTL: &str = "/usr/bin/systemctl";
    pub const TEE: &str = "/usr/bin/tee";
    pub const TEST: &str = "/usr/bin/test";
    pub const UNBOUND_CHECKCONF: &str = "/usr/sbin/unbound-checkconf";
}

/// Per-class command timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Status probes (`systemctl is-active`, `test -e`, `dpkg-query`)
    pub probe: Duration,
    /// Ordinary mutations (file writes, unit enable, SQL)
    pub default: Duration,
    /// Package installation
    pub install: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(3),
            default: Duration::from_secs(60),
            install: Duration::from_secs(300),
        }
    }
}

/// A single external invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<String>,
    stdin: Option<String>,
    env: Vec<(String, String)>,
    timeout: Duration,
    privileged: bool,
}

impl CommandSpec {
    /// Describe an invocation of `program` (an absolute path)
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
            timeout: Timeouts::default().default,
            privileged: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` to the child's stdin. Used for secrets and file content.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run through the configured privilege-escalation prefix
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Program file name, for logs and error messages
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn input(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn time_limit(&self) -> Duration {
        self.timeout
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Reject programs that would be resolved through a search path
    pub fn validate(&self) -> Result<()> {
        if !self.program.is_absolute() {
            return Err(Error::Validation(format!(
                "program must be an absolute path: {}",
                self.program.display()
            )));
        }
        Ok(())
    }

    /// Command line for logging. Never includes stdin or environment values.
    pub fn display_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Outcome of an external invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit code, or -1 when the process was killed or terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandResult {
    /// Exit 0 within the time limit
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Last [`STDERR_TAIL_CHARS`] characters of stderr, trimmed
    pub fn stderr_tail(&self) -> String {
        tail(self.stderr.trim(), STDERR_TAIL_CHARS)
    }

    /// Human-readable reason for a failed invocation
    pub fn failure_detail(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let tail = self.stderr_tail();
        if tail.is_empty() {
            format!("exit status {}", self.exit_code)
        } else {
            format!("exit status {}: {}", self.exit_code, tail)
        }
    }

    /// Convert a failed result into [`Error::Command`]
    pub fn check(self, spec: &CommandSpec) -> Result<CommandResult> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Command {
                program: spec.program_name(),
                detail: self.failure_detail(),
            })
        }
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        s.chars().skip(count - max_chars).collect()
    }
}

/// Executes external programs
///
/// Implementations must be shareable across request threads. Tests swap in a
/// scripted runner that records every invocation.
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion or until its timeout elapses
    ///
    /// Returns `Err` only when the program cannot be started.
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult>;

    /// Run `spec` and turn any non-success into [`Error::Command`]
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandResult> {
        self.run(spec)?.check(spec)
    }
}
