//! Real command executor implementation.
//!
//! This module provides [`RealCommandExecutor`], which executes commands
//! using `std::process::Command`, draining stdout and stderr concurrently.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use which::which;

use super::pipe::{StreamType, panic_message, read_pipe};
use super::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::ProvisionError;

/// Cleans up a child process and its associated reader threads.
///
/// Called from error paths in [`RealCommandExecutor::execute()`] to ensure
/// proper cleanup when thread spawning or process waiting fails.
fn cleanup_child_process<I>(child: &mut Child, handles: I)
where
    I: IntoIterator<Item = JoinHandle<Vec<u8>>>,
{
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to wait for child process after kill: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            tracing::warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

fn execution_error(spec: &CommandSpec, status: String) -> anyhow::Error {
    ProvisionError::Command {
        command: spec.display(),
        status,
    }
    .into()
}

/// Command executor that runs actual system commands.
///
/// When `dry_run` is true, commands are logged but not executed,
/// and `execute()` returns a result with no exit status and empty output.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        if self.dry_run {
            tracing::info!("dry run: {}", spec.display());
            return Ok(ExecutionResult::default());
        }

        let (program, args) = spec.argv();
        let cmd = which(&program).with_context(|| format!("command not found: {}", program))?;
        tracing::trace!("command found: {}: {}", program, cmd.to_string_lossy());

        let mut command = Command::new(cmd);
        command.args(&args);

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().with_context(|| {
            format!("failed to spawn command `{}` with args {:?}", program, args)
        })?;

        tracing::trace!("spawned command: {}: pid={}", program, child.id());

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_handle = match thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || read_pipe(stdout_pipe, StreamType::Stdout))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, []);
                return Err(execution_error(
                    spec,
                    format!("failed to spawn stdout reader thread: {}", e),
                ));
            }
        };

        let stderr_handle = match thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || read_pipe(stderr_pipe, StreamType::Stderr))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle]);
                return Err(execution_error(
                    spec,
                    format!("failed to spawn stderr reader thread: {}", e),
                ));
            }
        };

        let status = match child.wait() {
            Ok(s) => s,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle, stderr_handle]);
                return Err(execution_error(spec, format!("failed to wait for command: {}", e)));
            }
        };

        let mut panicked_streams = Vec::new();
        let mut outputs = Vec::with_capacity(2);
        for (name, handle) in [("stdout", stdout_handle), ("stderr", stderr_handle)] {
            match handle.join() {
                Ok(bytes) => outputs.push(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    let msg = panic_message(&*e);
                    tracing::error!(stream = name, panic = msg, "reader thread panicked");
                    panicked_streams.push(format!("{}: {}", name, msg));
                    outputs.push(String::new());
                }
            }
        }

        if !panicked_streams.is_empty() {
            return Err(execution_error(
                spec,
                format!(
                    "reader thread(s) panicked during command execution: {}",
                    panicked_streams.join(", ")
                ),
            ));
        }

        let Some(code) = status.code() else {
            return Err(execution_error(spec, format!("terminated by signal: {}", status)));
        };

        tracing::trace!("executed command: {}: code={}", program, code);

        let stderr = outputs.pop().unwrap_or_default();
        let stdout = outputs.pop().unwrap_or_default();
        Ok(ExecutionResult {
            status: Some(code),
            stdout,
            stderr,
        })
    }
}
