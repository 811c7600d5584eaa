//! Runner that reaches the target host through the system `ssh` client.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::Deserialize;

use super::{Runner, remote_dir, write_file_command};
use crate::asset::{Asset, parse_mode};
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::privilege::PrivilegeMethod;

/// Connection parameters for the target host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SshTarget {
    /// Host name or address; defaults to the machine IP when loaded from a profile.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Private key used for authentication.
    #[serde(default)]
    pub key: Option<Utf8PathBuf>,
    /// Extra `-o` options appended after the defaults.
    #[serde(default)]
    pub options: Vec<String>,
}

impl Default for SshTarget {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: default_user(),
            port: default_port(),
            key: None,
            options: Vec::new(),
        }
    }
}

fn default_user() -> String {
    "docker".to_string()
}

fn default_port() -> u16 {
    22
}

/// Options every connection uses: non-interactive, no host key prompts.
const BASE_OPTIONS: &[&str] = &[
    "ConnectionAttempts=3",
    "ConnectTimeout=10",
    "ControlMaster=no",
    "ControlPath=none",
    "LogLevel=quiet",
    "PasswordAuthentication=no",
    "ServerAliveInterval=60",
    "StrictHostKeyChecking=no",
    "UserKnownHostsFile=/dev/null",
];

impl SshTarget {
    /// Builds the `ssh` argument vector that runs `command` remotely.
    pub fn args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["-F".to_string(), "/dev/null".to_string()];
        let options = BASE_OPTIONS
            .iter()
            .copied()
            .map(str::to_string)
            .chain(self.options.iter().cloned());
        for opt in options {
            args.push("-o".to_string());
            args.push(opt);
        }
        if let Some(key) = &self.key {
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
            args.push("-i".to_string());
            args.push(key.to_string());
        }
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(format!("{}@{}", self.user, self.host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

/// Executes command lines on the target host over `ssh`.
pub struct SshRunner {
    executor: Arc<dyn CommandExecutor>,
    target: SshTarget,
    privilege: PrivilegeMethod,
}

impl SshRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        target: SshTarget,
        privilege: PrivilegeMethod,
    ) -> Self {
        Self {
            executor,
            target,
            privilege,
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }
}

impl Runner for SshRunner {
    fn run(&self, command: &str) -> Result<ExecutionResult> {
        let spec = CommandSpec::new("ssh", self.target.args(command));
        self.executor
            .execute(&spec)
            .with_context(|| format!("ssh to {}@{} failed", self.target.user, self.target.host))
    }

    fn copy(&self, asset: &dyn Asset) -> Result<()> {
        let target = asset.target_path();
        let mode = parse_mode(asset.permissions())?;
        let bytes = asset.contents()?;
        let content = String::from_utf8(bytes)
            .with_context(|| format!("asset {} is not valid UTF-8 text", asset.source()))?;

        let command = format!(
            "{} && {} && {}",
            self.privilege.wrap(&format!("mkdir -p {}", remote_dir(&target))),
            write_file_command(self.privilege, &content, &target),
            self.privilege.wrap(&format!("chmod {:o} {}", mode, target)),
        );

        let result = self.run(&command)?;
        if !result.success() {
            anyhow::bail!(
                "failed to transfer {} to {}: {}",
                asset.source(),
                target,
                result.failure_summary()
            );
        }
        Ok(())
    }

    fn privilege(&self) -> PrivilegeMethod {
        self.privilege
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::MemoryAsset;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl CommandExecutor for RecordingExecutor {
        fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok(ExecutionResult::ok(""))
        }
    }

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.5".to_string(),
            user: default_user(),
            port: 2222,
            key: Some("/home/me/.ssh/id_ed25519".into()),
            options: vec!["Compression=yes".to_string()],
        }
    }

    #[test]
    fn test_args_layout() {
        let args = target().args("uname -a");
        assert_eq!(&args[..2], &["-F", "/dev/null"]);
        assert!(args.contains(&"Compression=yes".to_string()));
        let n = args.len();
        assert_eq!(&args[n - 5..], &["-p", "2222", "docker@10.0.0.5", "--", "uname -a"]);
        let key_idx = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key_idx + 1], "/home/me/.ssh/id_ed25519");
    }

    #[test]
    fn test_copy_builds_single_remote_command() {
        let executor = Arc::new(RecordingExecutor::default());
        let runner = SshRunner::new(executor.clone(), target(), PrivilegeMethod::Sudo);
        let asset = MemoryAsset::new("-----BEGIN-----\n", "/etc/docker", "ca.pem", "0640");
        runner.copy(&asset).unwrap();

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "ssh");
        let remote = calls[0].args.last().unwrap();
        assert_eq!(
            remote,
            "sudo mkdir -p /etc/docker && \
             printf %s '-----BEGIN-----\n' | sudo tee /etc/docker/ca.pem >/dev/null && \
             sudo chmod 640 /etc/docker/ca.pem"
        );
    }

    #[test]
    fn test_copy_rejects_binary() {
        let executor = Arc::new(RecordingExecutor::default());
        let runner = SshRunner::new(executor, target(), PrivilegeMethod::Sudo);
        let asset = MemoryAsset::new(vec![0xff, 0xfe], "/tmp", "blob", "0644");
        assert!(runner.copy(&asset).is_err());
    }
}
