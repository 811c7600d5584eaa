//! Local process execution for hostprov.
//!
//! This module provides:
//! - [`CommandSpec`]: Specification for commands to execute
//! - [`ExecutionResult`]: Exit code plus captured output
//! - [`CommandExecutor`]: Trait for command execution strategies
//! - [`RealCommandExecutor`]: Production implementation using `std::process::Command`
//!
//! Runners build on top of this: the local runner hands `sh -c <cmd>` to an
//! executor, the SSH runner hands it `ssh ... <cmd>`.

pub(crate) mod pipe;
mod real;

use anyhow::Result;

use crate::privilege::PrivilegeMethod;

pub use real::RealCommandExecutor;

/// Formats string arguments into a space-separated, debug-quoted string.
///
/// Used by error messages and dry-run output to consistently format
/// command arguments (e.g., `"-p" "22" "docker@10.0.0.5"`).
pub(crate) fn format_command_args(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("{:?}", a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Specification for a command to be executed
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command to execute (e.g., "ssh")
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Environment variables to set (in addition to inherited environment)
    pub env: Vec<(String, String)>,
    /// Privilege escalation method to wrap the command
    pub privilege: Option<PrivilegeMethod>,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
            privilege: None,
        }
    }

    /// Sets the privilege escalation method
    #[must_use]
    pub fn with_privilege(mut self, privilege: Option<PrivilegeMethod>) -> Self {
        self.privilege = privilege;
        self
    }

    /// Adds an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns the program and argument vector after privilege wrapping.
    pub fn argv(&self) -> (String, Vec<String>) {
        match self.privilege {
            Some(method) => {
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.push(self.command.clone());
                args.extend(self.args.iter().cloned());
                (method.command_name().to_string(), args)
            }
            None => (self.command.clone(), self.args.clone()),
        }
    }

    /// Human-readable rendering used in logs and errors.
    pub fn display(&self) -> String {
        let (program, args) = self.argv();
        if args.is_empty() {
            program
        } else {
            format!("{} {}", program, format_command_args(&args))
        }
    }
}

/// Result of command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code of the command (None in dry-run mode)
    pub status: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ExecutionResult {
    /// Creates a result with the given exit code and output.
    pub fn new(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Convenience constructor for a successful run that printed `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(0, stdout, "")
    }

    /// Returns true if the command executed successfully.
    ///
    /// In dry-run mode (status is None), this always returns true.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|code| code == 0)
    }

    /// Returns the exit code if available
    pub fn code(&self) -> Option<i32> {
        self.status
    }

    /// Describes a failed run: exit code followed by whatever was printed.
    pub fn failure_summary(&self) -> String {
        let code = match self.status {
            Some(code) => format!("exit status: {}", code),
            None => "no exit status".to_string(),
        };
        let output = [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if output.is_empty() {
            code
        } else {
            format!("{}\n{}", code, output)
        }
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so a single executor can back both
/// the local and the remote runner.
pub trait CommandExecutor: Send + Sync {
    /// Executes a command with the given specification.
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}
