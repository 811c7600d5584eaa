//! Host drivers: the facts about a machine and the channel to reach it.

use anyhow::Result;

use crate::provision::wait::{CancelToken, WaitPolicy, WaitOutcome, wait_for};
use crate::runner::Runner;

/// Trait for host driver implementations.
///
/// A driver knows the machine's name and addresses and owns the runner
/// that executes commands on it.
pub trait Driver: Send + Sync {
    /// Short driver identifier, also used as the `provider=` engine label.
    fn driver_name(&self) -> &str;

    fn machine_name(&self) -> &str;

    fn ip(&self) -> Result<String>;

    /// Host name or address used for the SSH connection.
    fn ssh_hostname(&self) -> Result<String>;

    /// Blocks until the remote shell answers.
    fn wait_for_ssh(&self) -> Result<()>;

    /// Runner executing on the host.
    fn runner(&self) -> &dyn Runner;
}

/// An already running host at a fixed address.
pub struct GenericDriver {
    machine_name: String,
    ip: String,
    ssh_host: String,
    runner: Box<dyn Runner>,
    ssh_policy: WaitPolicy,
    cancel: CancelToken,
}

impl GenericDriver {
    /// Creates a driver; an empty `ssh_host` falls back to `ip`.
    pub fn new(
        machine_name: impl Into<String>,
        ip: impl Into<String>,
        ssh_host: impl Into<String>,
        runner: Box<dyn Runner>,
    ) -> Self {
        let ip = ip.into();
        let ssh_host = ssh_host.into();
        Self {
            machine_name: machine_name.into(),
            ssh_host: if ssh_host.is_empty() { ip.clone() } else { ssh_host },
            ip,
            runner,
            ssh_policy: WaitPolicy::standard(),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_ssh_policy(mut self, policy: WaitPolicy, cancel: CancelToken) -> Self {
        self.ssh_policy = policy;
        self.cancel = cancel;
        self
    }
}

impl Driver for GenericDriver {
    fn driver_name(&self) -> &str {
        "generic"
    }

    fn machine_name(&self) -> &str {
        &self.machine_name
    }

    fn ip(&self) -> Result<String> {
        if self.ip.is_empty() {
            anyhow::bail!("machine {} has no IP address", self.machine_name);
        }
        Ok(self.ip.clone())
    }

    fn ssh_hostname(&self) -> Result<String> {
        Ok(self.ssh_host.clone())
    }

    fn wait_for_ssh(&self) -> Result<()> {
        tracing::info!("waiting for ssh on {}", self.ssh_host);
        let outcome = wait_for(&self.ssh_policy, &self.cancel, |attempt| {
            match self.runner.run("exit 0") {
                Ok(result) => Ok(result.success()),
                Err(e) => {
                    tracing::debug!(attempt, "ssh not ready: {:#}", e);
                    Ok(false)
                }
            }
        })?;
        match outcome {
            WaitOutcome::Ready { .. } => Ok(()),
            WaitOutcome::Exhausted { attempts } => {
                anyhow::bail!("{} did not answer after {} attempt(s)", self.ssh_host, attempts)
            }
        }
    }

    fn runner(&self) -> &dyn Runner {
        self.runner.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::executor::ExecutionResult;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Flaky {
        failures_left: Mutex<u32>,
    }

    impl Runner for Flaky {
        fn run(&self, _command: &str) -> Result<ExecutionResult> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("connection refused");
            }
            Ok(ExecutionResult::ok(""))
        }

        fn copy(&self, _asset: &dyn Asset) -> Result<()> {
            Ok(())
        }
    }

    fn driver(failures: u32, attempts: u32) -> GenericDriver {
        GenericDriver::new(
            "node-1",
            "10.0.0.5",
            "",
            Box::new(Flaky {
                failures_left: Mutex::new(failures),
            }),
        )
        .with_ssh_policy(WaitPolicy::new(attempts, Duration::ZERO), CancelToken::new())
    }

    #[test]
    fn test_ssh_host_falls_back_to_ip() {
        let d = driver(0, 1);
        assert_eq!(d.ssh_hostname().unwrap(), "10.0.0.5");
        assert_eq!(d.driver_name(), "generic");
    }

    #[test]
    fn test_wait_for_ssh_retries() {
        driver(2, 3).wait_for_ssh().unwrap();
    }

    #[test]
    fn test_wait_for_ssh_exhausted() {
        let err = driver(5, 3).wait_for_ssh().unwrap_err();
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }

    #[test]
    fn test_cancelled_wait() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let d = driver(0, 3).with_ssh_policy(WaitPolicy::new(3, Duration::ZERO), cancel);
        let err = d.wait_for_ssh().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::ProvisionError>(),
            Some(crate::error::ProvisionError::Cancelled(_))
        ));
    }

    #[test]
    fn test_empty_ip_is_error() {
        let flaky = Flaky {
            failures_left: Mutex::new(0),
        };
        let d = GenericDriver::new("node-1", "", "host", Box::new(flaky));
        assert!(d.ip().is_err());
    }
}
