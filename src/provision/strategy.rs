//! Per-OS strategy objects a provisioner is assembled from.
//!
//! A variant picks one implementation for each axis: how packages are
//! managed and how services are driven. The runtime-config generator lives
//! in [`unit`](super::unit) and the compatibility predicate in
//! [`variants`](super::variants).

use strum::Display;

use super::wait::{CancelToken, WaitPolicy, wait_for_lock};
use crate::error::ProvisionError;
use crate::runner::{Runner, run_checked};

/// Action on a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PackageAction {
    Install,
    Remove,
    Upgrade,
}

/// Action on a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
    DaemonReload,
}

/// Package management axis.
pub trait PackageManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies `action` to `package` on the host behind `runner`, giving up
    /// when `cancel` fires while waiting for the package database.
    fn package(
        &self,
        runner: &dyn Runner,
        package: &str,
        action: PackageAction,
        cancel: &CancelToken,
    ) -> Result<(), ProvisionError>;
}

/// Hosts whose image already contains everything (buildroot ISOs).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPackages;

impl PackageManager for NoPackages {
    fn name(&self) -> &'static str {
        "none"
    }

    fn package(
        &self,
        _runner: &dyn Runner,
        package: &str,
        action: PackageAction,
        _cancel: &CancelToken,
    ) -> Result<(), ProvisionError> {
        tracing::debug!("ignoring package {} {}: image has no package manager", action, package);
        Ok(())
    }
}

/// Debian-family `apt-get`, retrying while another process holds the lock.
#[derive(Debug, Clone, Copy)]
pub struct Apt {
    lock_policy: WaitPolicy,
}

impl Default for Apt {
    fn default() -> Self {
        Self {
            lock_policy: WaitPolicy::standard(),
        }
    }
}

impl Apt {
    pub fn with_lock_policy(lock_policy: WaitPolicy) -> Self {
        Self { lock_policy }
    }

    fn apt_command(runner: &dyn Runner, package: &str, action: PackageAction) -> String {
        let verb = match action {
            PackageAction::Install => "install",
            PackageAction::Remove => "remove",
            PackageAction::Upgrade => "upgrade",
        };
        runner.privilege().wrap(&format!(
            "DEBIAN_FRONTEND=noninteractive apt-get {} -y -o Dpkg::Options::=\"--force-confnew\" {}",
            verb, package
        ))
    }
}

impl PackageManager for Apt {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn package(
        &self,
        runner: &dyn Runner,
        package: &str,
        action: PackageAction,
        cancel: &CancelToken,
    ) -> Result<(), ProvisionError> {
        if action == PackageAction::Install || action == PackageAction::Upgrade {
            let update = runner.privilege().wrap("apt-get update");
            wait_for_lock(runner, &update, &self.lock_policy, cancel)?;
        }
        let command = Self::apt_command(runner, package, action);
        tracing::info!("{} package {}", action, package);
        wait_for_lock(runner, &command, &self.lock_policy, cancel)?;
        Ok(())
    }
}

/// Service management axis.
pub trait ServiceManager: Send + Sync {
    fn name(&self) -> &'static str;

    fn service(
        &self,
        runner: &dyn Runner,
        service: &str,
        action: ServiceAction,
    ) -> Result<(), ProvisionError>;
}

/// `systemctl`-driven services.
#[derive(Debug, Default, Clone, Copy)]
pub struct Systemd;

impl Systemd {
    /// The command line for `action`; `daemon-reload` ignores `service`.
    pub fn command(runner: &dyn Runner, service: &str, action: ServiceAction) -> String {
        match action {
            ServiceAction::DaemonReload => runner.privilege().wrap("systemctl -f daemon-reload"),
            other => runner.privilege().wrap(&format!("systemctl -f {} {}", other, service)),
        }
    }
}

impl ServiceManager for Systemd {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn service(
        &self,
        runner: &dyn Runner,
        service: &str,
        action: ServiceAction,
    ) -> Result<(), ProvisionError> {
        run_checked(runner, &Self::command(runner, service, action))?;
        Ok(())
    }
}
