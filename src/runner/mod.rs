//! Runners execute shell command lines and place assets, either on this
//! machine or on the host being provisioned.
//!
//! Every remote action is a single request/response command string. A
//! [`Runner`] reports transport failures as `Err` and returns the exit code
//! and output of commands that did run; [`run_checked`] turns a non-zero
//! exit into [`ProvisionError::Command`].

mod local;
mod ssh;

use anyhow::Result;

use crate::asset::Asset;
use crate::error::ProvisionError;
use crate::executor::ExecutionResult;
use crate::privilege::PrivilegeMethod;

pub use local::LocalRunner;
pub use ssh::{SshRunner, SshTarget};

/// Executes command lines and copies assets into place.
pub trait Runner: Send + Sync {
    /// Runs a shell command line.
    fn run(&self, command: &str) -> Result<ExecutionResult>;

    /// Places an asset at its target path with its permissions.
    fn copy(&self, asset: &dyn Asset) -> Result<()>;

    /// Escalation helper to prefix privileged commands with.
    fn privilege(&self) -> PrivilegeMethod {
        PrivilegeMethod::Sudo
    }
}

/// Runs `command` and returns its stdout, failing on non-zero exit.
pub fn run_checked(runner: &dyn Runner, command: &str) -> Result<String, ProvisionError> {
    tracing::debug!("run: {}", command);
    let result = runner.run(command).map_err(|source| ProvisionError::Transport {
        command: command.to_string(),
        source,
    })?;
    if !result.success() {
        return Err(ProvisionError::Command {
            command: command.to_string(),
            status: result.failure_summary(),
        });
    }
    Ok(result.stdout)
}

/// Quotes `value` for a POSIX shell.
///
/// The result is wrapped in single quotes with embedded single quotes
/// written as `'\''`, so nothing inside is expanded or interpreted.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Returns the `/`-separated parent directory of a remote path.
pub(crate) fn remote_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Builds the command that writes `content` to `path` on a remote host.
///
/// The content travels as a single-quoted `printf` argument and is written
/// through the escalation helper with `tee`.
pub(crate) fn write_file_command(privilege: PrivilegeMethod, content: &str, path: &str) -> String {
    format!(
        "printf %s {} | {} >/dev/null",
        shell_quote(content),
        privilege.wrap(&format!("tee {}", path))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedRunner {
        results: Mutex<Vec<Result<ExecutionResult>>>,
    }

    impl Runner for ScriptedRunner {
        fn run(&self, _command: &str) -> Result<ExecutionResult> {
            self.results.lock().unwrap().remove(0)
        }

        fn copy(&self, _asset: &dyn Asset) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("abc"), "'abc'");
    }

    #[test]
    fn test_shell_quote_neutralises_expansion() {
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("a\"b`c"), "'a\"b`c'");
    }

    #[test]
    fn test_remote_dir() {
        assert_eq!(remote_dir("/lib/systemd/system/docker.service"), "/lib/systemd/system");
        assert_eq!(remote_dir("/ca.pem"), "/");
        assert_eq!(remote_dir("ca.pem"), ".");
    }

    #[test]
    fn test_write_file_command() {
        assert_eq!(
            write_file_command(PrivilegeMethod::Sudo, "a'b", "/etc/x"),
            "printf %s 'a'\\''b' | sudo tee /etc/x >/dev/null"
        );
    }

    #[test]
    fn test_run_checked_maps_failures() {
        let runner = ScriptedRunner {
            results: Mutex::new(vec![
                Ok(ExecutionResult::ok("out\n")),
                Ok(ExecutionResult::new(2, "", "boom")),
                Err(anyhow::anyhow!("connection reset")),
            ]),
        };
        assert_eq!(run_checked(&runner, "a").unwrap(), "out\n");
        assert!(matches!(
            run_checked(&runner, "b").unwrap_err(),
            ProvisionError::Command { ref status, .. } if status.contains("boom")
        ));
        assert!(matches!(
            run_checked(&runner, "c").unwrap_err(),
            ProvisionError::Transport { .. }
        ));
    }
}
