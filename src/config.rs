//! YAML profile describing one machine to provision.

use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ProvisionError;
use crate::privilege::PrivilegeMethod;
use crate::provision::systemd::validate_hostname;
use crate::provision::{
    AuthOptions, ClusterConfig, ConfigStore, EngineOptions, ProvisionRequest, SwarmOptions,
};
use crate::runner::SshTarget;

/// The only driver this crate ships.
pub const GENERIC_DRIVER: &str = "generic";

#[derive(Debug, Deserialize)]
pub struct Profile {
    /// Directory containing the profile file; relative paths resolve here.
    #[serde(skip)]
    pub dir: Utf8PathBuf,
    pub machine: Machine,
    #[serde(default)]
    pub privilege: PrivilegeMethod,
    pub auth: AuthOptions,
    #[serde(default)]
    pub engine: EngineOptions,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub swarm: SwarmOptions,
}

#[derive(Debug, Deserialize)]
pub struct Machine {
    pub name: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    pub ip: String,
    #[serde(default)]
    pub ssh: SshTarget,
    /// Registered provisioner to use instead of detecting one.
    #[serde(default)]
    pub provisioner: Option<String>,
}

fn default_driver() -> String {
    GENERIC_DRIVER.to_string()
}

pub fn load_profile(path: &Utf8Path) -> Result<Profile> {
    let file = File::open(path).with_context(|| format!("failed to load file: {}", path))?;
    let reader = BufReader::new(file);
    let mut profile: Profile =
        serde_yaml::from_reader(reader).with_context(|| format!("failed to parse yaml: {}", path))?;
    profile.dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .map(Utf8Path::to_path_buf)
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    profile.resolve_paths();
    Ok(profile)
}

impl Profile {
    fn resolve_paths(&mut self) {
        let dir = self.dir.clone();
        let resolve = |path: &mut Utf8PathBuf| {
            if path.is_relative() && !path.as_str().is_empty() {
                *path = dir.join(&*path);
            }
        };
        let auth = &mut self.auth;
        for path in [
            &mut auth.store_path,
            &mut auth.ca_cert,
            &mut auth.ca_key,
            &mut auth.client_cert,
            &mut auth.client_key,
            &mut auth.server_cert,
            &mut auth.server_key,
        ] {
            resolve(path);
        }
        if let Some(key) = self.machine.ssh.key.as_mut() {
            resolve(key);
        }
    }

    /// Checks the profile for values provisioning cannot proceed with.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.machine.name.trim().is_empty() {
            return Err(ProvisionError::Validation("machine.name must not be empty".to_string()));
        }
        validate_hostname(&self.machine.name)?;
        if self.machine.ip.trim().is_empty() {
            return Err(ProvisionError::Validation("machine.ip must not be empty".to_string()));
        }
        if self.machine.driver != GENERIC_DRIVER {
            return Err(ProvisionError::Validation(format!(
                "unsupported driver {:?}: only {:?} is available",
                self.machine.driver, GENERIC_DRIVER
            )));
        }
        if self.cluster.name.trim().is_empty() {
            return Err(ProvisionError::Validation("cluster.name must not be empty".to_string()));
        }
        if self.engine.port == 0 {
            return Err(ProvisionError::Validation("engine.port must not be 0".to_string()));
        }

        let auth = &self.auth;
        let required = [
            ("auth.store_path", &auth.store_path),
            ("auth.ca_cert", &auth.ca_cert),
            ("auth.ca_key", &auth.ca_key),
            ("auth.client_cert", &auth.client_cert),
            ("auth.client_key", &auth.client_key),
            ("auth.server_cert", &auth.server_cert),
            ("auth.server_key", &auth.server_key),
        ];
        for (field, path) in required {
            if path.as_str().is_empty() {
                return Err(ProvisionError::Validation(format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }

    /// SSH connection settings, defaulting the host to the machine IP.
    pub fn ssh_target(&self) -> SshTarget {
        let mut target = self.machine.ssh.clone();
        if target.host.is_empty() {
            target.host = self.machine.ip.clone();
        }
        target
    }

    /// Option sets for a provisioning run; the engine is keyed by the
    /// cluster name unless the profile names one.
    pub fn request(&self, wait_for_daemon: bool) -> ProvisionRequest {
        let mut engine = self.engine.clone();
        if engine.engine_name.is_empty() {
            engine.engine_name = self.cluster.name.clone();
        }
        ProvisionRequest {
            swarm: self.swarm.clone(),
            auth: self.auth.clone(),
            engine,
            wait_for_daemon,
        }
    }
}

impl ConfigStore for Profile {
    fn load(&self, profile: &str) -> Result<ClusterConfig> {
        if profile.is_empty() || profile == self.cluster.name {
            return Ok(self.cluster.clone());
        }
        anyhow::bail!("no cluster config for profile {:?} (have {:?})", profile, self.cluster.name)
    }
}
