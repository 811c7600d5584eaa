//! The systemd-based provisioner every built-in variant is assembled into.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use super::auth::configure_auth;
use super::options::{AuthOptions, DockerOptions, EngineOptions, SwarmOptions};
use super::runtime::{ContainerRuntime, configure_crio, needs_no_pivot};
use super::strategy::{
    NoPackages, PackageAction, PackageManager, ServiceAction, ServiceManager, Systemd,
};
use super::unit::{DockerUnitTemplate, update_unit};
use super::wait::{CancelToken, wait_for_daemon};
use super::{Collaborators, ProvisionRequest, ProvisionStage, Provisioner};
use crate::driver::Driver;
use crate::error::ProvisionError;
use crate::osrelease::OsRelease;
use crate::runner::{Runner, run_checked, shell_quote};

/// Where docker reads its TLS material.
pub const DOCKER_OPTIONS_DIR: &str = "/etc/docker";

/// Package providing the docker engine on hosts that install it.
const DOCKER_PACKAGE: &str = "docker.io";

/// Decides whether a provisioner handles a host.
pub type Compatibility = fn(&OsRelease) -> bool;

/// A provisioner composed of one strategy per axis.
pub struct SystemdProvisioner {
    name: &'static str,
    driver: Arc<dyn Driver>,
    os_release: Option<OsRelease>,
    compatible: Compatibility,
    packages: Box<dyn PackageManager>,
    services: Box<dyn ServiceManager>,
    unit: DockerUnitTemplate,
    options_dir: String,
    install_runtime: bool,
    auth: AuthOptions,
    engine: EngineOptions,
    swarm: SwarmOptions,
    /// Cancellation of the run in progress.
    cancel: CancelToken,
}

impl SystemdProvisioner {
    /// Creates a provisioner with no package manager and `systemctl` services.
    pub fn new(
        name: &'static str,
        driver: Arc<dyn Driver>,
        compatible: Compatibility,
        unit: DockerUnitTemplate,
    ) -> Self {
        Self {
            name,
            driver,
            os_release: None,
            compatible,
            packages: Box::new(NoPackages),
            services: Box::new(Systemd),
            unit,
            options_dir: DOCKER_OPTIONS_DIR.to_string(),
            install_runtime: false,
            auth: AuthOptions::default(),
            engine: EngineOptions::default(),
            swarm: SwarmOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Uses `packages` and installs the docker engine when it is missing.
    #[must_use]
    pub fn with_packages(mut self, packages: Box<dyn PackageManager>) -> Self {
        self.packages = packages;
        self.install_runtime = true;
        self
    }

    #[must_use]
    pub fn with_services(mut self, services: Box<dyn ServiceManager>) -> Self {
        self.services = services;
        self
    }

    fn runner(&self) -> &dyn Runner {
        self.driver.runner()
    }

    fn ensure_docker_installed(&self) -> Result<(), ProvisionError> {
        let probe = self.runner().run("type docker").map_err(|source| ProvisionError::Transport {
            command: "type docker".to_string(),
            source,
        })?;
        if probe.success() {
            debug!("docker is already installed");
            return Ok(());
        }
        info!("installing {}", DOCKER_PACKAGE);
        self.package(DOCKER_PACKAGE, PackageAction::Install)
    }

    fn configure_runtime(
        &mut self,
        collaborators: &Collaborators<'_>,
    ) -> Result<ContainerRuntime, ProvisionError> {
        let profile = self.engine.engine_name.clone();
        let cluster = collaborators.config.load(&profile).map_err(|e| {
            ProvisionError::Config(format!("getting cluster config for {:?}: {:#}", profile, e))
        })?;

        let runtime = cluster.container_runtime;
        info!("setting options for container runtime {}", runtime);
        match runtime {
            ContainerRuntime::Containerd => debug!("containerd is configured in the image"),
            ContainerRuntime::Crio => {
                configure_crio(self.runner(), self.services.as_ref(), &self.engine)?
            }
            ContainerRuntime::Docker => {
                if self.install_runtime {
                    self.ensure_docker_installed()?;
                }
                self.generate_docker_options(self.engine.port)?;
            }
        }
        Ok(runtime)
    }
}

impl fmt::Display for SystemdProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Checks `name` against RFC 1123 host name rules.
pub fn validate_hostname(name: &str) -> Result<(), ProvisionError> {
    let invalid = |why: &str| {
        Err(ProvisionError::Validation(format!("invalid hostname {:?}: {}", name, why)))
    };
    if name.is_empty() || name.len() > 253 {
        return invalid("must be 1 to 253 characters");
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return invalid("each label must be 1 to 63 characters");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return invalid("only letters, digits, '-' and '.' are allowed");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("labels cannot start or end with '-'");
        }
    }
    Ok(())
}

/// Stops the sequence before `next` when the run was cancelled.
fn checkpoint(cancel: &CancelToken, next: ProvisionStage) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled(format!("cancelled before {}", next)).at_stage(next));
    }
    Ok(())
}

/// Rewrites or appends the `127.0.1.1` entry in `/etc/hosts`.
fn hosts_entry_command(runner: &dyn Runner, hostname: &str) -> String {
    let privilege = runner.privilege();
    let entry = format!("127.0.1.1 {}", hostname);
    format!(
        "if ! grep -xq '.*\\s{name}' /etc/hosts; then \
         if grep -xq '127.0.1.1\\s.*' /etc/hosts; then {sed}; \
         else echo {entry} | {append}; fi; fi",
        name = hostname,
        sed = privilege.wrap(&format!("sed -i 's/^127.0.1.1\\s.*/{}/g' /etc/hosts", entry)),
        entry = shell_quote(&entry),
        append = privilege.wrap("tee -a /etc/hosts"),
    )
}

impl Provisioner for SystemdProvisioner {
    fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    fn set_os_release(&mut self, info: OsRelease) {
        self.os_release = Some(info);
    }

    fn os_release(&self) -> Option<&OsRelease> {
        self.os_release.as_ref()
    }

    fn compatible_with_host(&self) -> bool {
        self.os_release.as_ref().is_some_and(|info| (self.compatible)(info))
    }

    fn docker_options_dir(&self) -> &str {
        &self.options_dir
    }

    fn auth_options(&self) -> &AuthOptions {
        &self.auth
    }

    fn engine_options(&self) -> &EngineOptions {
        &self.engine
    }

    fn swarm_options(&self) -> &SwarmOptions {
        &self.swarm
    }

    fn hostname(&self) -> Result<String, ProvisionError> {
        Ok(run_checked(self.runner(), "hostname")?.trim().to_string())
    }

    fn set_hostname(&self, hostname: &str) -> Result<(), ProvisionError> {
        validate_hostname(hostname)?;
        let runner = self.runner();
        let privilege = runner.privilege();
        let set = format!(
            "{} && echo {} | {}",
            privilege.wrap(&format!("hostname {}", hostname)),
            hostname,
            privilege.wrap("tee /etc/hostname")
        );
        run_checked(runner, &set)?;
        run_checked(runner, &hosts_entry_command(runner, hostname))?;
        Ok(())
    }

    fn package(&self, name: &str, action: PackageAction) -> Result<(), ProvisionError> {
        self.packages.package(self.runner(), name, action, &self.cancel)
    }

    fn service(&self, name: &str, action: ServiceAction) -> Result<(), ProvisionError> {
        self.services.service(self.runner(), name, action)
    }

    fn set_options(&mut self, request: &ProvisionRequest) {
        self.swarm = request.swarm.clone();
        self.auth = request.auth.with_remote_paths(&self.options_dir);
        self.engine = request.engine.clone();
    }

    fn generate_docker_options(&mut self, port: u16) -> Result<DockerOptions, ProvisionError> {
        let label = format!("provider={}", self.driver.driver_name());
        if !self.engine.labels.contains(&label) {
            self.engine.labels.push(label);
        }

        let no_pivot = needs_no_pivot(self.runner());
        let content = self.unit.render(port, &self.auth, &self.engine, no_pivot)?;
        update_unit(self.runner(), self.services.as_ref(), "docker", &content, &self.unit.path)?;

        Ok(DockerOptions {
            engine_options: content,
            engine_options_path: self.unit.path.clone(),
        })
    }

    #[tracing::instrument(
        skip_all,
        fields(provisioner = self.name, machine = self.driver.machine_name())
    )]
    fn provision(
        &mut self,
        request: ProvisionRequest,
        collaborators: &Collaborators<'_>,
    ) -> Result<(), ProvisionError> {
        self.set_options(&request);
        self.cancel = collaborators.cancel.clone();
        let cancel = &collaborators.cancel;

        let machine_name = self.driver.machine_name().to_string();
        checkpoint(cancel, ProvisionStage::HostnameSet)?;
        info!(stage = %ProvisionStage::Start, "provisioning hostname {:?}", machine_name);
        self.set_hostname(&machine_name)
            .map_err(|e| e.at_stage(ProvisionStage::HostnameSet))?;

        checkpoint(cancel, ProvisionStage::AuthConfigured)?;
        info!(stage = %ProvisionStage::HostnameSet, "setting up certificates");
        configure_auth(
            self.driver.as_ref(),
            collaborators.local,
            collaborators.authority,
            &self.auth,
        )
        .map_err(|e| e.at_stage(ProvisionStage::AuthConfigured))?;

        checkpoint(cancel, ProvisionStage::RuntimeConfigured)?;
        info!(stage = %ProvisionStage::AuthConfigured, "configuring container runtime");
        let runtime = self
            .configure_runtime(collaborators)
            .map_err(|e| e.at_stage(ProvisionStage::RuntimeConfigured))?;

        if request.wait_for_daemon && runtime == ContainerRuntime::Docker {
            info!(
                stage = %ProvisionStage::RuntimeConfigured,
                "waiting for docker on port {}", self.engine.port
            );
            // Done is reached only once the daemon answers.
            wait_for_daemon(
                self.runner(),
                self.engine.port,
                &collaborators.daemon_policy,
                cancel,
            )
            .map_err(|e| e.at_stage(ProvisionStage::RuntimeConfigured))?;
        }

        info!(stage = %ProvisionStage::Done, "provisioned {}", machine_name);
        Ok(())
    }
}
