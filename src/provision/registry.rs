//! Provisioner catalogue and host detection.

use std::sync::Arc;

use tracing::{debug, info};

use super::Provisioner;
use super::variants;
use crate::driver::Driver;
use crate::error::ProvisionError;
use crate::osrelease::OsRelease;
use crate::runner::run_checked;

/// Builds a provisioner bound to a driver.
pub type Factory = fn(Arc<dyn Driver>) -> Box<dyn Provisioner>;

/// Name-keyed provisioner factories in registration order.
///
/// Detection tries entries in the order they were registered, so when
/// several variants accept a host the earliest registration wins.
#[derive(Default, Clone)]
pub struct Registry {
    entries: Vec<(String, Factory)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in variants: `buildroot`, `debian`, `ubuntu`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("buildroot", variants::buildroot);
        registry.register("debian", variants::debian);
        registry.register("ubuntu", variants::ubuntu);
        registry
    }

    /// Registers `factory` under `name`. Re-registering a name replaces its
    /// factory and keeps its position.
    pub fn register(&mut self, name: impl Into<String>, factory: Factory) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((name, factory)),
        }
    }

    pub fn get(&self, name: &str) -> Option<Factory> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, f)| *f)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Factory)> {
        self.entries.iter().map(|(n, f)| (n.as_str(), *f))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("names", &self.names()).finish()
    }
}

/// Picks the first registered provisioner compatible with the host.
///
/// Waits for SSH, reads `/etc/os-release` once and tests every factory's
/// provisioner against that record. Only the read touches the host.
#[tracing::instrument(skip_all, fields(machine = driver.machine_name()))]
pub fn detect(
    registry: &Registry,
    driver: Arc<dyn Driver>,
) -> Result<Box<dyn Provisioner>, ProvisionError> {
    info!("waiting for SSH to be available");
    driver.wait_for_ssh().map_err(ProvisionError::SshUnavailable)?;

    info!("detecting the provisioner");
    let output = run_checked(driver.runner(), "cat /etc/os-release")?;
    let info = OsRelease::parse(&output)?;

    for (name, factory) in registry.iter() {
        let mut provisioner = factory(Arc::clone(&driver));
        provisioner.set_os_release(info.clone());
        if provisioner.compatible_with_host() {
            debug!("found compatible host: {:?} ({})", info.id(), name);
            return Ok(provisioner);
        }
    }

    Err(ProvisionError::DetectionFailed {
        id: info.id().map(str::to_string),
    })
}
