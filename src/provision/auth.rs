//! Server certificate issuance and distribution.
//!
//! A run copies the client material into the local store, signs a server
//! certificate whose SANs cover every name the daemon is reached by, and
//! installs CA + server certificate + key in the runtime's options directory
//! on the host.

use std::fs;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::{info, warn};

use super::options::AuthOptions;
use crate::asset::FileAsset;
use crate::driver::Driver;
use crate::error::ProvisionError;
use crate::runner::{Runner, remote_dir, run_checked, shell_quote};

/// Name every server certificate is valid for, whatever the host.
pub const PRODUCT_SAN: &str = "minikube";

/// Key algorithm used for server keys.
pub const KEY_ALGORITHM: &str = "ECDSA P-256 / SHA-256";

/// Mode for files copied into the local store.
const LOCAL_CERT_MODE: &str = "0644";

/// Mode for files installed on the host.
const REMOTE_CERT_MODE: &str = "0640";

/// Server certificates are valid for three years.
const SERVER_CERT_VALIDITY: Duration = Duration::from_secs(1080 * 24 * 60 * 60);

/// What to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRequest {
    pub hosts: Vec<String>,
    pub cert_file: Utf8PathBuf,
    pub key_file: Utf8PathBuf,
    pub ca_file: Utf8PathBuf,
    pub ca_key_file: Utf8PathBuf,
    pub org: String,
}

/// Signs server certificates with a local CA.
pub trait CertAuthority: Send + Sync {
    /// Writes a certificate and key for `request` to its cert/key paths.
    fn generate_server_cert(&self, request: &CertRequest) -> Result<()>;
}

impl<F> CertAuthority for F
where
    F: Fn(&CertRequest) -> Result<()> + Send + Sync,
{
    fn generate_server_cert(&self, request: &CertRequest) -> Result<()> {
        self(request)
    }
}

/// [`CertAuthority`] backed by `rcgen`, reading the CA from PEM files.
#[derive(Debug, Default, Clone, Copy)]
pub struct RcgenAuthority;

impl CertAuthority for RcgenAuthority {
    fn generate_server_cert(&self, request: &CertRequest) -> Result<()> {
        let ca_cert_pem = fs::read_to_string(&request.ca_file)
            .with_context(|| format!("failed to read CA certificate {}", request.ca_file))?;
        let ca_key_pem = fs::read_to_string(&request.ca_key_file)
            .with_context(|| format!("failed to read CA key {}", request.ca_key_file))?;

        let ca_key = KeyPair::from_pem(&ca_key_pem).context("failed to parse CA key")?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .context("failed to parse CA certificate")?;
        let ca = ca_params
            .self_signed(&ca_key)
            .context("failed to load CA for signing")?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .context("failed to create certificate params")?;
        params.distinguished_name.push(DnType::OrganizationName, request.org.as_str());
        params.subject_alt_names = request
            .hosts
            .iter()
            .map(|host| san_entry(host))
            .collect::<Result<_>>()?;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyAgreement,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + SERVER_CERT_VALIDITY).into();

        let key = KeyPair::generate().context("failed to generate server key")?;
        let cert = params
            .signed_by(&key, &ca, &ca_key)
            .context("failed to sign server certificate")?;

        write_pem(&request.cert_file, &cert.pem(), 0o644)?;
        write_pem(&request.key_file, &key.serialize_pem(), 0o600)?;
        Ok(())
    }
}

fn san_entry(host: &str) -> Result<SanType> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = host
        .to_string()
        .try_into()
        .with_context(|| format!("invalid DNS name for certificate: {:?}", host))?;
    Ok(SanType::DnsName(name))
}

fn write_pem(path: &Utf8Path, pem: &str, mode: u32) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_str().is_empty()
    {
        fs::create_dir_all(dir).with_context(|| format!("failed to create directory: {}", dir))?;
    }
    fs::write(path, pem).with_context(|| format!("failed to write {}", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set permissions on {}", path))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Builds the server certificate SAN list.
///
/// Caller SANs come first, then the driver IP, the SSH hostname,
/// `localhost`, `127.0.0.1`, [`PRODUCT_SAN`] and the machine name. The
/// list is de-duplicated keeping first occurrences; empty entries are
/// dropped.
pub fn server_cert_sans(
    extra: &[String],
    ip: &str,
    ssh_hostname: &str,
    machine_name: &str,
) -> Vec<String> {
    let fixed = [ip, ssh_hostname, "localhost", "127.0.0.1", PRODUCT_SAN, machine_name];
    let mut sans: Vec<String> = Vec::with_capacity(extra.len() + fixed.len());
    for entry in extra.iter().map(String::as_str).chain(fixed) {
        let entry = entry.trim();
        if entry.is_empty() || sans.iter().any(|s| s == entry) {
            continue;
        }
        sans.push(entry.to_string());
    }
    sans
}

/// Local user name, used in the certificate organisation.
fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Copies CA cert, client cert and client key into the local store.
pub fn copy_host_certs(local: &dyn Runner, auth: &AuthOptions) -> Result<(), ProvisionError> {
    info!("copying client certificates to {}", auth.store_path);

    let mkdir = format!("mkdir -p -m 0700 {}", shell_quote(auth.store_path.as_str()));
    if let Err(e) = run_checked(local, &mkdir) {
        warn!("failed to create store directory {}: {}", auth.store_path, e);
    }

    let host_certs = [
        (&auth.ca_cert, "ca.pem"),
        (&auth.client_cert, "cert.pem"),
        (&auth.client_key, "key.pem"),
    ];
    for (src, name) in host_certs {
        let dst = auth.store_path.join(name);
        let asset = FileAsset::new(src.clone(), auth.store_path.as_str(), name, LOCAL_CERT_MODE)
            .map_err(|source| ProvisionError::AuthCopy {
                path: src.to_string(),
                source,
            })?;
        local.copy(&asset).map_err(|source| ProvisionError::AuthCopy {
            path: dst.to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Installs CA cert, server cert and server key on the host.
pub fn copy_remote_certs(remote: &dyn Runner, auth: &AuthOptions) -> Result<(), ProvisionError> {
    info!("copying server certificates to the host");

    let remote_certs = [
        (&auth.ca_cert, auth.ca_cert_remote.as_str()),
        (&auth.server_cert, auth.server_cert_remote.as_str()),
        (&auth.server_key, auth.server_key_remote.as_str()),
    ];

    let mut dirs: Vec<&str> = Vec::new();
    for (_, dst) in &remote_certs {
        let dir = remote_dir(dst);
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    let mkdir = remote.privilege().wrap(&format!("mkdir -p {}", dirs.join(" ")));
    run_checked(remote, &mkdir).map_err(|e| ProvisionError::AuthCopy {
        path: dirs.join(" "),
        source: e.into(),
    })?;

    for (src, dst) in remote_certs {
        FileAsset::to_path(src.clone(), Utf8Path::new(dst), REMOTE_CERT_MODE)
            .and_then(|asset| remote.copy(&asset))
            .map_err(|source| ProvisionError::AuthCopy {
                path: dst.to_string(),
                source,
            })?;
    }
    Ok(())
}

/// Runs certificate provisioning end to end.
///
/// `auth` must already carry its remote paths. Nothing written before a
/// failure is removed; re-running overwrites it.
pub fn configure_auth(
    driver: &dyn Driver,
    local: &dyn Runner,
    authority: &dyn CertAuthority,
    auth: &AuthOptions,
) -> Result<(), ProvisionError> {
    info!("configureAuth start");
    let start = Instant::now();

    let result = (|| {
        let machine_name = driver.machine_name();
        let ip = driver
            .ip()
            .map_err(|source| ProvisionError::Driver { what: "ip", source })?;
        let ssh_hostname = driver
            .ssh_hostname()
            .map_err(|source| ProvisionError::Driver {
                what: "ssh hostname",
                source,
            })?;

        copy_host_certs(local, auth)?;

        let request = CertRequest {
            hosts: server_cert_sans(&auth.server_cert_sans, &ip, &ssh_hostname, machine_name),
            cert_file: auth.server_cert.clone(),
            key_file: auth.server_key.clone(),
            ca_file: auth.ca_cert.clone(),
            ca_key_file: auth.ca_key.clone(),
            org: format!("{}.{}", local_username(), machine_name),
        };
        info!(
            "generating server cert: {} ca-key={} org={} san={:?} alg={}",
            request.cert_file, request.ca_key_file, request.org, request.hosts, KEY_ALGORITHM
        );
        authority
            .generate_server_cert(&request)
            .map_err(ProvisionError::CertGeneration)?;

        copy_remote_certs(driver.runner(), auth)
    })();

    info!("duration metric: configureAuth took {:?}", start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sans_exact_membership() {
        let sans = server_cert_sans(&[], "192.168.49.2", "node-1.local", "node-1");
        assert_eq!(
            sans,
            vec!["192.168.49.2", "node-1.local", "localhost", "127.0.0.1", "minikube", "node-1"]
        );
    }

    #[test]
    fn test_sans_collapse_duplicate_ip_and_hostname() {
        let sans = server_cert_sans(&[], "10.0.0.5", "10.0.0.5", "node-1");
        assert_eq!(sans, vec!["10.0.0.5", "localhost", "127.0.0.1", "minikube", "node-1"]);
    }

    #[test]
    fn test_sans_caller_entries_first_and_blank_dropped() {
        let extra = vec!["api.example.com".to_string(), "".to_string(), "localhost".to_string()];
        let sans = server_cert_sans(&extra, "10.0.0.5", "", "node-1");
        assert_eq!(
            sans,
            vec!["api.example.com", "localhost", "10.0.0.5", "127.0.0.1", "minikube", "node-1"]
        );
    }

    #[test]
    fn test_san_entry_kinds() {
        assert!(matches!(san_entry("10.0.0.5").unwrap(), SanType::IpAddress(_)));
        assert!(matches!(san_entry("::1").unwrap(), SanType::IpAddress(_)));
        assert!(matches!(san_entry("localhost").unwrap(), SanType::DnsName(_)));
    }

    #[test]
    fn test_rcgen_authority_signs_with_ca() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.distinguished_name.push(DnType::CommonName, "test CA");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        fs::write(base.join("ca.pem"), ca_cert.pem()).unwrap();
        fs::write(base.join("ca-key.pem"), ca_key.serialize_pem()).unwrap();

        let request = CertRequest {
            hosts: server_cert_sans(&[], "10.0.0.5", "10.0.0.5", "node-1"),
            cert_file: base.join("out/server.pem"),
            key_file: base.join("out/server-key.pem"),
            ca_file: base.join("ca.pem"),
            ca_key_file: base.join("ca-key.pem"),
            org: "tester.node-1".to_string(),
        };
        RcgenAuthority.generate_server_cert(&request).unwrap();

        let cert = fs::read_to_string(&request.cert_file).unwrap();
        let key = fs::read_to_string(&request.key_file).unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_rcgen_authority_missing_ca() {
        let request = CertRequest {
            hosts: vec!["localhost".to_string()],
            cert_file: "/nonexistent/server.pem".into(),
            key_file: "/nonexistent/server-key.pem".into(),
            ca_file: "/nonexistent/ca.pem".into(),
            ca_key_file: "/nonexistent/ca-key.pem".into(),
            org: "x".to_string(),
        };
        let err = RcgenAuthority.generate_server_cert(&request).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to read CA certificate"));
    }
}
