//! Container runtime selection and the host probes runtime setup relies on.

use std::str::FromStr;

use anyhow::Result;
use serde::Deserialize;
use strum::{Display, EnumString};

use super::options::EngineOptions;
use super::strategy::{ServiceAction, ServiceManager};
use crate::error::ProvisionError;
use crate::runner::{Runner, remote_dir, run_checked, write_file_command};

/// Where CRI-O picks up extra daemon options.
pub const CRIO_OPTIONS_PATH: &str = "/etc/sysconfig/crio.minikube";

/// Runtime the cluster is configured to use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    /// Already configured when the image is built.
    Containerd,
    #[strum(to_string = "crio", serialize = "cri-o")]
    #[serde(alias = "cri-o")]
    Crio,
}

/// Cluster-level settings the provisioner needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub container_runtime: ContainerRuntime,
}

/// Source of cluster configuration, keyed by profile name.
pub trait ConfigStore: Send + Sync {
    fn load(&self, profile: &str) -> Result<ClusterConfig>;
}

impl ContainerRuntime {
    /// Parses a runtime name as used on the command line.
    pub fn parse(name: &str) -> Result<Self, ProvisionError> {
        Self::from_str(name.trim())
            .map_err(|_| ProvisionError::Config(format!("unknown container runtime: {:?}", name)))
    }
}

/// Filesystem type of the remote root mount.
pub fn root_filesystem_type(runner: &dyn Runner) -> Result<String, ProvisionError> {
    let out = run_checked(runner, "df --output=fstype / | tail -n 1")?;
    Ok(out.trim().to_string())
}

/// Whether dockerd must avoid `pivot_root`.
///
/// `pivot_root` does not work on an initramfs root (`rootfs`). When the
/// type cannot be read the safe answer is to avoid it.
pub fn needs_no_pivot(runner: &dyn Runner) -> bool {
    match root_filesystem_type(runner) {
        Ok(fstype) => {
            tracing::info!("root file system type: {}", fstype);
            fstype == "rootfs"
        }
        Err(e) => {
            tracing::debug!("could not determine root file system type: {}", e);
            true
        }
    }
}

/// Parses the client version from `docker --version`
/// (`Docker version 24.0.7, build afdd53b` → `24.0.7`).
pub fn docker_client_version(runner: &dyn Runner) -> Result<String, ProvisionError> {
    let output = run_checked(runner, "docker --version")?;
    parse_docker_version(&output)
}

fn parse_docker_version(output: &str) -> Result<String, ProvisionError> {
    let words: Vec<&str> = output.split_whitespace().collect();
    if words.len() < 3 || words[0] != "Docker" || words[1] != "version" {
        return Err(ProvisionError::Parse(format!(
            "cannot parse version string from {:?}",
            output
        )));
    }
    Ok(words[2].trim_end_matches(',').to_string())
}

/// The CRI-O options file: insecure registries passed through.
pub fn render_crio_options(engine: &EngineOptions) -> String {
    let flags: String = engine
        .insecure_registry
        .iter()
        .map(|r| format!("--insecure-registry {} ", r))
        .collect();
    format!("\nCRIO_MINIKUBE_OPTIONS='{}'\n", flags)
}

/// Writes the CRI-O options file and restarts `crio`.
pub fn configure_crio(
    runner: &dyn Runner,
    services: &dyn ServiceManager,
    engine: &EngineOptions,
) -> Result<(), ProvisionError> {
    let content = render_crio_options(engine);
    let privilege = runner.privilege();
    let command = format!(
        "{} && {}",
        privilege.wrap(&format!("mkdir -p {}", remote_dir(CRIO_OPTIONS_PATH))),
        write_file_command(privilege, &content, CRIO_OPTIONS_PATH)
    );
    run_checked(runner, &command)?;
    services.service(runner, "crio", ServiceAction::Restart)
}
