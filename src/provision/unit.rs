//! Docker unit rendering and idempotent unit deployment.
//!
//! Deployment pushes the rendered text to `<path>.new`, compares it with
//! the installed unit and only swaps the file and restarts the service when
//! they differ. The `.new` file never outlives a deployment attempt, and a
//! unit whose activation failed is rolled back so the next run retries it.

use std::fmt::Write as _;

use tracing::{debug, info, warn};

use super::options::{AuthOptions, EngineOptions};
use super::strategy::{ServiceAction, ServiceManager};
use crate::error::ProvisionError;
use crate::runner::{Runner, remote_dir, run_checked, write_file_command};

/// Where the docker unit is installed on systemd hosts.
pub const DOCKER_UNIT_PATH: &str = "/lib/systemd/system/docker.service";

/// Result of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitChange {
    /// Installed unit already matched; nothing was restarted.
    Unchanged,
    /// Unit replaced and the service reloaded, enabled and restarted.
    Updated,
}

/// Doubles every `%` so systemd does not read it as a specifier, then wraps
/// each assignment in double quotes since values may contain whitespace.
pub fn escape_systemd_directives(env: &[String]) -> Vec<String> {
    env.iter()
        .map(|value| format!("\"{}\"", value.replace('%', "%%")))
        .collect()
}

/// Unit skeleton parameters that differ between OS families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerUnitTemplate {
    pub after: Vec<String>,
    pub requires: Vec<String>,
    pub path: String,
}

impl DockerUnitTemplate {
    /// Buildroot images mount persistent storage before docker starts.
    pub fn buildroot() -> Self {
        Self {
            after: vec![
                "network.target".to_string(),
                "minikube-automount.service".to_string(),
                "docker.socket".to_string(),
            ],
            requires: vec!["minikube-automount.service".to_string(), "docker.socket".to_string()],
            path: DOCKER_UNIT_PATH.to_string(),
        }
    }

    pub fn debian() -> Self {
        Self {
            after: vec!["network-online.target".to_string(), "docker.socket".to_string()],
            requires: vec!["docker.socket".to_string()],
            path: DOCKER_UNIT_PATH.to_string(),
        }
    }

    /// Renders the unit.
    ///
    /// `no_pivot` adds `DOCKER_RAMDISK=yes`, which makes dockerd use
    /// `MS_MOVE` instead of `pivot_root`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Validation`] if any engine option contains
    /// a line break, which would inject extra unit directives.
    pub fn render(
        &self,
        port: u16,
        auth: &AuthOptions,
        engine: &EngineOptions,
        no_pivot: bool,
    ) -> Result<String, ProvisionError> {
        for value in engine
            .env
            .iter()
            .chain(&engine.labels)
            .chain(&engine.insecure_registry)
            .chain(&engine.registry_mirror)
            .chain(&engine.arbitrary_flags)
        {
            if value.contains(['\n', '\r']) {
                return Err(ProvisionError::Validation(format!(
                    "engine option must be a single line: {:?}",
                    value
                )));
            }
        }

        let mut unit = String::new();
        unit.push_str("[Unit]\n");
        unit.push_str("Description=Docker Application Container Engine\n");
        unit.push_str("Documentation=https://docs.docker.com\n");
        let _ = writeln!(unit, "After={}", self.after.join(" "));
        let _ = writeln!(unit, "Requires={}", self.requires.join(" "));
        unit.push_str("StartLimitBurst=3\nStartLimitIntervalSec=60\n\n");
        unit.push_str("[Service]\nType=notify\nRestart=on-failure\n");

        if no_pivot {
            unit.push_str(
                "\n# DOCKER_RAMDISK disables pivot_root in Docker, using MS_MOVE instead.\n",
            );
            unit.push_str("Environment=DOCKER_RAMDISK=yes\n");
        }

        unit.push('\n');
        for env in escape_systemd_directives(&engine.env) {
            let _ = writeln!(unit, "Environment={}", env);
        }

        unit.push_str(
            "\n# The base configuration may already set ExecStart=. An empty ExecStart=\n\
             # clears it; otherwise systemd treats both as a sequence and refuses to start\n\
             # a non-oneshot service.\n",
        );
        unit.push_str("ExecStart=\n");
        let _ = writeln!(unit, "ExecStart={}", dockerd_command(port, auth, engine));
        unit.push_str("ExecReload=/bin/kill -s HUP $MAINPID\n\n");

        unit.push_str(
            "# Having non-zero Limit*s causes performance problems due to accounting overhead\n\
             # in the kernel. We recommend using cgroups to do container-local accounting.\n\
             LimitNOFILE=infinity\n\
             LimitNPROC=infinity\n\
             LimitCORE=infinity\n\n\
             TasksMax=infinity\n\
             TimeoutStartSec=0\n\n\
             # set delegate yes so that systemd does not reset the cgroups of docker containers\n\
             Delegate=yes\n\n\
             # kill only the docker process, not all processes in the cgroup\n\
             KillMode=process\n\n\
             [Install]\n\
             WantedBy=multi-user.target\n",
        );

        Ok(unit)
    }
}

/// The `dockerd` command line, flags in configured order.
fn dockerd_command(port: u16, auth: &AuthOptions, engine: &EngineOptions) -> String {
    let mut args = vec![
        "/usr/bin/dockerd".to_string(),
        "-H".to_string(),
        format!("tcp://0.0.0.0:{}", port),
        "-H".to_string(),
        "unix:///var/run/docker.sock".to_string(),
        "--default-ulimit=nofile=1048576:1048576".to_string(),
        "--tlsverify".to_string(),
        "--tlscacert".to_string(),
        auth.ca_cert_remote.clone(),
        "--tlscert".to_string(),
        auth.server_cert_remote.clone(),
        "--tlskey".to_string(),
        auth.server_key_remote.clone(),
    ];
    for label in &engine.labels {
        args.push("--label".to_string());
        args.push(label.clone());
    }
    for registry in &engine.insecure_registry {
        args.push("--insecure-registry".to_string());
        args.push(registry.clone());
    }
    for mirror in &engine.registry_mirror {
        args.push("--registry-mirror".to_string());
        args.push(mirror.clone());
    }
    for flag in &engine.arbitrary_flags {
        args.push(format!("--{}", flag));
    }
    args.join(" ")
}

/// Installs `content` at `path` and restarts `service` only if it changed.
///
/// Steps: create the parent directory, write `<path>.new`, `diff` it
/// against `<path>`. Identical → remove `.new`, done. Different (or no
/// installed unit) → keep the installed unit as `<path>.orig`, move `.new`
/// over `path`, then daemon-reload, enable and restart `service`.
///
/// When activation fails after the swap, the previous unit is put back (or
/// the new one removed when there was none), so a later run sees a
/// difference and activates again.
pub fn update_unit(
    runner: &dyn Runner,
    services: &dyn ServiceManager,
    service: &str,
    content: &str,
    path: &str,
) -> Result<UnitChange, ProvisionError> {
    info!("updating {} unit: {}", service, path);
    let fail = |err: ProvisionError| ProvisionError::UnitDeploy {
        unit: service.to_string(),
        path: path.to_string(),
        reason: err.to_string(),
    };

    let privilege = runner.privilege();
    let staged = format!("{}.new", path);
    let backup = format!("{}.orig", path);

    run_checked(runner, &privilege.wrap(&format!("mkdir -p {}", remote_dir(path)))).map_err(fail)?;
    run_checked(runner, &write_file_command(privilege, content, &staged)).map_err(fail)?;

    let mut backed_up = false;
    let mut swapped = false;
    let result = (|| -> Result<UnitChange, ProvisionError> {
        let diff_cmd = privilege.wrap(&format!("diff -u {} {}", path, staged));
        let diff = runner.run(&diff_cmd).map_err(|source| ProvisionError::Transport {
            command: diff_cmd.clone(),
            source,
        })?;
        if diff.success() {
            debug!("{} is up to date", path);
            return Ok(UnitChange::Unchanged);
        }
        debug!("{} differs:\n{}", path, diff.stdout);

        // diff exits 1 only when both files exist.
        if diff.code() == Some(1) {
            run_checked(runner, &privilege.wrap(&format!("cp -p {} {}", path, backup)))?;
            backed_up = true;
        }
        run_checked(runner, &privilege.wrap(&format!("mv {} {}", staged, path)))?;
        swapped = true;
        services.service(runner, service, ServiceAction::DaemonReload)?;
        services.service(runner, service, ServiceAction::Enable)?;
        services.service(runner, service, ServiceAction::Restart)?;
        Ok(UnitChange::Updated)
    })();

    if !swapped {
        remove_quietly(runner, &staged);
    }
    if swapped && result.is_err() {
        roll_back(runner, services, service, path, backed_up.then_some(backup.as_str()));
    } else if backed_up {
        remove_quietly(runner, &backup);
    }

    result.map_err(fail)
}

/// Leaves `path` as it was before a failed activation.
fn roll_back(
    runner: &dyn Runner,
    services: &dyn ServiceManager,
    service: &str,
    path: &str,
    backup: Option<&str>,
) {
    let privilege = runner.privilege();
    let restore = match backup {
        Some(backup) => privilege.wrap(&format!("mv {} {}", backup, path)),
        None => privilege.wrap(&format!("rm -f {}", path)),
    };
    warn!("activating {} failed, restoring {}", service, path);
    if let Err(e) = run_checked(runner, &restore) {
        warn!("failed to restore {}: {}", path, e);
        return;
    }
    if let Err(e) = services.service(runner, service, ServiceAction::DaemonReload) {
        warn!("failed to reload units after restoring {}: {}", path, e);
    }
}

fn remove_quietly(runner: &dyn Runner, path: &str) {
    let cleanup = runner.privilege().wrap(&format!("rm -f {}", path));
    if let Err(e) = run_checked(runner, &cleanup) {
        // The deployment outcome stands; a stale file is overwritten next run.
        warn!("failed to remove {}: {}", path, e);
    }
}
