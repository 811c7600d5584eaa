//! Built-in provisioner variants and their compatibility predicates.

use std::sync::Arc;

use super::Provisioner;
use super::strategy::{Apt, Systemd};
use super::systemd::SystemdProvisioner;
use super::unit::DockerUnitTemplate;
use crate::driver::Driver;
use crate::osrelease::OsRelease;

pub fn is_buildroot(info: &OsRelease) -> bool {
    info.id() == Some("buildroot")
}

/// Ubuntu and its derivatives (`ID_LIKE=ubuntu`).
pub fn is_ubuntu(info: &OsRelease) -> bool {
    info.id() == Some("ubuntu") || info.id_like().contains(&"ubuntu")
}

/// Debian and derivatives that are not Ubuntu based.
pub fn is_debian(info: &OsRelease) -> bool {
    if is_ubuntu(info) {
        return false;
    }
    info.id() == Some("debian") || info.id_like().contains(&"debian")
}

/// Minikube ISO images: everything is baked in, no package manager.
pub fn buildroot(driver: Arc<dyn Driver>) -> Box<dyn Provisioner> {
    Box::new(SystemdProvisioner::new(
        "buildroot",
        driver,
        is_buildroot,
        DockerUnitTemplate::buildroot(),
    ))
}

pub fn debian(driver: Arc<dyn Driver>) -> Box<dyn Provisioner> {
    Box::new(
        SystemdProvisioner::new("debian", driver, is_debian, DockerUnitTemplate::debian())
            .with_packages(Box::new(Apt::default()))
            .with_services(Box::new(Systemd)),
    )
}

pub fn ubuntu(driver: Arc<dyn Driver>) -> Box<dyn Provisioner> {
    Box::new(
        SystemdProvisioner::new("ubuntu", driver, is_ubuntu, DockerUnitTemplate::debian())
            .with_packages(Box::new(Apt::default()))
            .with_services(Box::new(Systemd)),
    )
}
