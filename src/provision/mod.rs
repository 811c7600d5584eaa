//! The provisioning engine.
//!
//! A [`Provisioner`] is picked for a host by [`detect`] and then drives the
//! host from bare to a TLS-secured container runtime with
//! [`Provisioner::provision`]. Every step is a single remote command line
//! issued through the driver's [`Runner`](crate::runner::Runner).

pub mod auth;
pub mod options;
pub mod registry;
pub mod runtime;
pub mod strategy;
pub mod systemd;
pub mod unit;
pub mod variants;
pub mod wait;

use std::fmt;

use strum::Display;

use crate::driver::Driver;
use crate::error::ProvisionError;
use crate::osrelease::OsRelease;
use crate::runner::Runner;

pub use auth::{CertAuthority, CertRequest, RcgenAuthority};
pub use options::{AuthOptions, DEFAULT_DOCKER_PORT, DockerOptions, EngineOptions, SwarmOptions};
pub use registry::{Factory, Registry, detect};
pub use runtime::{ClusterConfig, ConfigStore, ContainerRuntime};
pub use strategy::{PackageAction, ServiceAction};
pub use systemd::SystemdProvisioner;
pub use unit::UnitChange;
pub use wait::{CancelToken, WaitPolicy};

/// Where a provisioning run is, or where it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ProvisionStage {
    Start,
    HostnameSet,
    AuthConfigured,
    RuntimeConfigured,
    Done,
}

/// Option sets handed to a provisioning run.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub swarm: SwarmOptions,
    pub auth: AuthOptions,
    pub engine: EngineOptions,
    /// Poll the docker port after configuring the runtime.
    pub wait_for_daemon: bool,
}

/// Collaborators a provisioning run needs besides the driver.
pub struct Collaborators<'a> {
    pub config: &'a dyn ConfigStore,
    pub authority: &'a dyn CertAuthority,
    /// Runner for this machine, used to fill the local certificate store.
    pub local: &'a dyn Runner,
    pub daemon_policy: WaitPolicy,
    pub cancel: CancelToken,
}

impl<'a> Collaborators<'a> {
    pub fn new(
        config: &'a dyn ConfigStore,
        authority: &'a dyn CertAuthority,
        local: &'a dyn Runner,
    ) -> Self {
        Self {
            config,
            authority,
            local,
            daemon_policy: WaitPolicy::daemon(),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_daemon_policy(mut self, policy: WaitPolicy) -> Self {
        self.daemon_policy = policy;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// OS-family specific provisioning.
pub trait Provisioner: fmt::Display + Send + Sync {
    fn driver(&self) -> &dyn Driver;

    fn set_os_release(&mut self, info: OsRelease);

    fn os_release(&self) -> Option<&OsRelease>;

    /// Whether this provisioner handles the host described by its OsRelease.
    fn compatible_with_host(&self) -> bool;

    /// Directory the runtime reads its TLS material and options from.
    fn docker_options_dir(&self) -> &str;

    fn auth_options(&self) -> &AuthOptions;

    fn engine_options(&self) -> &EngineOptions;

    fn swarm_options(&self) -> &SwarmOptions;

    fn hostname(&self) -> Result<String, ProvisionError>;

    fn set_hostname(&self, hostname: &str) -> Result<(), ProvisionError>;

    fn package(&self, name: &str, action: PackageAction) -> Result<(), ProvisionError>;

    fn service(&self, name: &str, action: ServiceAction) -> Result<(), ProvisionError>;

    /// Adopts the option sets of `request` and derives the remote auth paths
    /// from [`docker_options_dir`](Self::docker_options_dir).
    fn set_options(&mut self, request: &ProvisionRequest);

    /// Renders the docker unit for `port` and deploys it to the host.
    fn generate_docker_options(&mut self, port: u16) -> Result<DockerOptions, ProvisionError>;

    /// Runs the full sequence: options, hostname, certificates, runtime.
    fn provision(
        &mut self,
        request: ProvisionRequest,
        collaborators: &Collaborators<'_>,
    ) -> Result<(), ProvisionError>;
}
