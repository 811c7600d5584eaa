//! Option records carried through a provisioning run.

use camino::Utf8PathBuf;
use serde::Deserialize;

/// Port the docker daemon listens on for TLS connections.
pub const DEFAULT_DOCKER_PORT: u16 = 2376;

/// TLS material locations.
///
/// Local paths come from configuration; the three remote paths are always
/// derived from the runtime's options directory by
/// [`AuthOptions::with_remote_paths`] and are never read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthOptions {
    /// Local certificate store the client certificates are copied into.
    pub store_path: Utf8PathBuf,
    pub ca_cert: Utf8PathBuf,
    pub ca_key: Utf8PathBuf,
    pub client_cert: Utf8PathBuf,
    pub client_key: Utf8PathBuf,
    /// Where the generated server certificate is written locally.
    pub server_cert: Utf8PathBuf,
    pub server_key: Utf8PathBuf,
    /// Additional subject alternative names for the server certificate.
    #[serde(default)]
    pub server_cert_sans: Vec<String>,
    #[serde(skip)]
    pub ca_cert_remote: String,
    #[serde(skip)]
    pub server_cert_remote: String,
    #[serde(skip)]
    pub server_key_remote: String,
}

impl AuthOptions {
    /// Returns a copy whose remote paths live under `options_dir`.
    ///
    /// Paths are joined with `/` since they name files on a Linux host.
    #[must_use]
    pub fn with_remote_paths(&self, options_dir: &str) -> Self {
        let dir = options_dir.trim_end_matches('/');
        Self {
            ca_cert_remote: format!("{}/ca.pem", dir),
            server_cert_remote: format!("{}/server.pem", dir),
            server_key_remote: format!("{}/server-key.pem", dir),
            ..self.clone()
        }
    }
}

/// Container engine settings. Every list keeps its configured order because
/// the order carries into the generated daemon command line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineOptions {
    /// `KEY=VALUE` environment assignments for the daemon unit.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub insecure_registry: Vec<String>,
    #[serde(default)]
    pub registry_mirror: Vec<String>,
    /// Raw daemon flags, written as `--<flag>`.
    #[serde(default)]
    pub arbitrary_flags: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cluster profile the runtime selection is looked up under.
    #[serde(default)]
    pub engine_name: String,
}

fn default_port() -> u16 {
    DEFAULT_DOCKER_PORT
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            labels: Vec::new(),
            insecure_registry: Vec::new(),
            registry_mirror: Vec::new(),
            arbitrary_flags: Vec::new(),
            port: DEFAULT_DOCKER_PORT,
            engine_name: String::new(),
        }
    }
}

/// Swarm settings. Carried for callers that inspect the provisioner after
/// a run; provisioning does not act on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SwarmOptions {
    #[serde(default)]
    pub is_swarm: bool,
    #[serde(default)]
    pub master: bool,
    #[serde(default)]
    pub discovery: String,
    #[serde(default)]
    pub host: String,
}

/// A rendered daemon configuration and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerOptions {
    pub engine_options: String,
    pub engine_options_path: String,
}
