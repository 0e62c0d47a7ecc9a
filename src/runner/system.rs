// src/runner/system.rs

//! Runner backed by real child processes
//!
//! Each child leads its own process group. A timeout kills the whole group,
//! so forked helpers (dpkg under apt-get, shell wrappers) die with it, and
//! output collection never waits past a short drain window.

use super::{CommandResult, CommandRunner, CommandSpec};
use crate::{Error, Result};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How long to keep reading pipes once the child is gone
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Spawns commands on the local host
///
/// Privileged specs are prefixed with the configured escalation command
/// (for example `/usr/bin/sudo -n`). With an empty prefix the daemon is
/// expected to already run as root.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    privilege_prefix: Vec<String>,
}

impl SystemRunner {
    pub fn new(privilege_prefix: Vec<String>) -> Self {
        Self { privilege_prefix }
    }

    fn build_command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = match (spec.is_privileged(), self.privilege_prefix.split_first()) {
            (true, Some((escalate, escalate_args))) => {
                let mut cmd = Command::new(escalate);
                cmd.args(escalate_args);
                if !spec.environment().is_empty() {
                    // sudo resets the environment unless told which names to keep
                    let names: Vec<&str> =
                        spec.environment().iter().map(|(k, _)| k.as_str()).collect();
                    cmd.arg(format!("--preserve-env={}", names.join(",")));
                }
                cmd.arg(spec.program());
                cmd
            }
            _ => Command::new(spec.program()),
        };

        cmd.args(spec.arguments());
        // Stable, untranslated tool output for the parsers downstream
        cmd.env("LC_ALL", "C");
        for (key, value) in spec.environment() {
            cmd.env(key, value);
        }
        cmd.process_group(0);

        cmd.stdin(if spec.input().is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
        rx
    })
}

/// Collect a reader's output, giving up after `DRAIN_GRACE`
///
/// A descendant that escaped the process group can hold the pipe open
/// indefinitely; its output is abandoned rather than waited for.
fn join_reader(rx: Option<Receiver<String>>, program: &str) -> String {
    rx.map(|rx| {
        rx.recv_timeout(DRAIN_GRACE).unwrap_or_else(|_| {
            warn!("{} left its output pipe open, abandoning it", program);
            String::new()
        })
    })
    .unwrap_or_default()
}

/// Feed stdin from a detached thread so a child that never reads cannot stall the runner
fn spawn_writer(pipe: Option<ChildStdin>, input: Option<&str>, program: String) {
    if let (Some(mut pipe), Some(input)) = (pipe, input) {
        let input = input.to_owned();
        thread::spawn(move || {
            if let Err(e) = pipe.write_all(input.as_bytes()) {
                // The child may exit before consuming its input; its exit status tells the rest
                debug!("Short write to {} stdin: {}", program, e);
            }
            // Dropping the pipe closes stdin
        });
    }
}

fn kill_group(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg({}) failed: {}, killing leader only", pgid, e);
        let _ = child.kill();
    }
    let _ = child.wait();
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult> {
        spec.validate()?;
        debug!(
            command = %spec.display_line(),
            privileged = spec.is_privileged(),
            "Running command"
        );

        let mut child = self.build_command(spec).spawn().map_err(|e| Error::Command {
            program: spec.program_name(),
            detail: format!("failed to spawn {}: {}", spec.program().display(), e),
        })?;

        // Drain both pipes concurrently so a chatty child cannot block on a full pipe
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());
        spawn_writer(child.stdin.take(), spec.input(), spec.program_name());

        let (exit_code, timed_out) = match child.wait_timeout(spec.time_limit()) {
            Ok(Some(status)) => (status.code().unwrap_or(-1), false),
            Ok(None) => {
                warn!(
                    "{} timed out after {}s, killing its process group",
                    spec.program_name(),
                    spec.time_limit().as_secs()
                );
                kill_group(&mut child);
                (-1, true)
            }
            Err(e) => {
                kill_group(&mut child);
                return Err(e.into());
            }
        };

        let program = spec.program_name();
        let result = CommandResult {
            exit_code,
            stdout: join_reader(stdout, &program),
            stderr: join_reader(stderr, &program),
            timed_out,
        };

        debug!(
            program = %program,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "Command finished"
        );
        for line in result.stderr.lines().filter(|l| !l.trim().is_empty()) {
            debug!("[{} stderr] {}", program, line);
        }

        Ok(result)
    }
}
