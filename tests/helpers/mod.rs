#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use hostprov::asset::Asset;
use hostprov::config::{Profile, load_profile};
use hostprov::driver::Driver;
use hostprov::executor::ExecutionResult;
use hostprov::provision::{AuthOptions, ClusterConfig, ConfigStore, ContainerRuntime};
use hostprov::runner::Runner;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

pub const BUILDROOT_OS_RELEASE: &str = "NAME=Buildroot\nVERSION=2023.02.9\nID=buildroot\n\
                                        VERSION_ID=2023.02.9\n\
                                        PRETTY_NAME=\"Buildroot 2023.02.9\"\n";
pub const DEBIAN_OS_RELEASE: &str = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n\
                                     NAME=\"Debian GNU/Linux\"\nVERSION_ID=\"12\"\nID=debian\n";
pub const UBUNTU_OS_RELEASE: &str =
    "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n";

/// Mutable state of a [`FakeHost`].
#[derive(Debug, Default)]
pub struct HostState {
    pub files: BTreeMap<String, String>,
    pub commands: Vec<String>,
    /// `systemctl` invocations as `"<action> <service>"`.
    pub services: Vec<String>,
    pub hostname: String,
    pub fstype: String,
    pub docker_installed: bool,
    /// Number of upcoming apt-get runs that report a busy lock.
    pub lock_busy: u32,
    /// Poll on which the docker port starts listening.
    pub listen_after: Option<u32>,
    pub socket_polls: u32,
    /// Commands containing any of these fail with exit status 1.
    pub fail_matching: Vec<String>,
    pub ssh_down: bool,
}

/// An in-memory host that understands the command vocabulary the
/// provisioner sends and records every command it receives.
pub struct FakeHost {
    name: String,
    ip: String,
    ssh_host: String,
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new(os_release: &str) -> Arc<Self> {
        Self::with_identity("node-1", "10.0.0.5", "10.0.0.5", os_release)
    }

    pub fn with_identity(name: &str, ip: &str, ssh_host: &str, os_release: &str) -> Arc<Self> {
        let mut state = HostState {
            hostname: "localhost".to_string(),
            fstype: "ext4".to_string(),
            ..Default::default()
        };
        state.files.insert("/etc/os-release".to_string(), os_release.to_string());
        state.files.insert("/etc/hosts".to_string(), "127.0.0.1 localhost\n".to_string());
        Arc::new(Self {
            name: name.to_string(),
            ip: ip.to_string(),
            ssh_host: ssh_host.to_string(),
            state: Mutex::new(state),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn count_commands(&self, needle: &str) -> usize {
        self.state().commands.iter().filter(|c| c.contains(needle)).count()
    }

    pub fn restarts(&self, service: &str) -> usize {
        let entry = format!("restart {}", service);
        self.state().services.iter().filter(|s| **s == entry).count()
    }

    pub fn fail_on(&self, needle: &str) {
        self.state().fail_matching.push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().fail_matching.clear();
    }
}

fn ok(out: impl Into<String>) -> ExecutionResult {
    ExecutionResult::ok(out)
}

fn fail(code: i32, err: impl Into<String>) -> ExecutionResult {
    ExecutionResult::new(code, "", err)
}

/// Splits a command line into words and the operators `&&`, `|`, `;`.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ' ' | '\t' | '\n' => {
                if in_word {
                    tokens.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                if in_word {
                    tokens.push(std::mem::take(&mut current));
                    in_word = false;
                }
                tokens.push("&&".to_string());
            }
            '|' | ';' => {
                if in_word {
                    tokens.push(std::mem::take(&mut current));
                    in_word = false;
                }
                tokens.push(c.to_string());
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        tokens.push(current);
    }
    tokens
}

fn strip_privilege(words: &[String]) -> &[String] {
    match words.first().map(String::as_str) {
        Some("sudo") | Some("doas") => &words[1..],
        _ => words,
    }
}

impl FakeHost {
    fn execute(&self, state: &mut HostState, line: &str) -> ExecutionResult {
        if state.fail_matching.iter().any(|needle| line.contains(needle.as_str())) {
            return fail(1, format!("injected failure: {}", line));
        }

        if line.starts_with("if ! grep -xq") {
            let entry = format!("127.0.1.1 {}", state.hostname);
            let hosts = state.files.entry("/etc/hosts".to_string()).or_default();
            if !hosts.lines().any(|l| l == entry) {
                let mut kept: Vec<String> = hosts
                    .lines()
                    .filter(|l| !l.starts_with("127.0.1.1"))
                    .map(str::to_string)
                    .collect();
                kept.push(entry);
                *hosts = kept.join("\n") + "\n";
            }
            return ok("");
        }
        if line.starts_with("if ! type netstat") {
            state.socket_polls += 1;
            let mut out = "Active Internet connections (only servers)\n\
                           Proto Recv-Q Send-Q Local Address   Foreign Address  State\n\
                           tcp        0      0 0.0.0.0:22      0.0.0.0:*        LISTEN\n"
                .to_string();
            if state.listen_after.is_some_and(|n| state.socket_polls >= n) {
                out.push_str("tcp6       0      0 :::2376         :::*             LISTEN\n");
            }
            return ok(out);
        }

        let tokens = tokenize(line);
        let mut last = ok("");
        for segment in tokens.split(|t| t == "&&") {
            last = self.run_pipeline(state, segment);
            if !last.success() {
                return last;
            }
        }
        last
    }

    fn run_pipeline(&self, state: &mut HostState, segment: &[String]) -> ExecutionResult {
        let stages: Vec<&[String]> = segment.split(|t| t == "|").collect();
        if stages.len() == 2 {
            let producer = strip_privilege(stages[0]);
            let consumer = strip_privilege(stages[1]);
            let content = match producer.first().map(String::as_str) {
                Some("printf") => producer.get(2).cloned().unwrap_or_default(),
                Some("echo") => format!("{}\n", producer[1..].join(" ")),
                Some("df") => return ok(format!("{}\n", state.fstype)),
                _ => return fail(127, format!("unsupported pipeline: {:?}", segment)),
            };
            if consumer.first().map(String::as_str) == Some("tail") {
                return ok(content);
            }
            if consumer.first().map(String::as_str) != Some("tee") {
                return fail(127, format!("unsupported consumer: {:?}", consumer));
            }
            let append = consumer.get(1).map(String::as_str) == Some("-a");
            let path = consumer
                .iter()
                .skip(1)
                .find(|w| !w.starts_with('-') && !w.starts_with('>'))
                .cloned()
                .unwrap_or_default();
            if path.starts_with("/etc/hostname") {
                state.hostname = content.trim().to_string();
            }
            let file = state.files.entry(path).or_default();
            if append {
                file.push_str(&content);
            } else {
                *file = content;
            }
            return ok("");
        }
        self.run_simple(state, segment)
    }

    fn run_simple(&self, state: &mut HostState, words: &[String]) -> ExecutionResult {
        let words = strip_privilege(words);
        let args: Vec<&str> = words
            .iter()
            .map(String::as_str)
            .filter(|w| !w.starts_with('>'))
            .collect();
        match args.as_slice() {
            ["exit", "0"] => {
                if state.ssh_down {
                    fail(255, "ssh: connect to host: Connection refused")
                } else {
                    ok("")
                }
            }
            ["cat", path] => match state.files.get(*path) {
                Some(content) => ok(content.clone()),
                None => fail(1, format!("cat: {}: No such file or directory", path)),
            },
            ["hostname"] => ok(format!("{}\n", state.hostname)),
            ["hostname", name] => {
                state.hostname = name.to_string();
                ok("")
            }
            ["mkdir", ..] | ["chmod", ..] => ok(""),
            ["diff", "-u", a, b] => match (state.files.get(*a), state.files.get(*b)) {
                (Some(x), Some(y)) if x == y => ok(""),
                (Some(_), Some(_)) => {
                    ExecutionResult::new(1, format!("--- {}\n+++ {}\n", a, b), "")
                }
                _ => fail(2, format!("diff: {}: No such file or directory", a)),
            },
            ["mv", from, to] => match state.files.remove(*from) {
                Some(content) => {
                    state.files.insert(to.to_string(), content);
                    ok("")
                }
                None => fail(1, format!("mv: cannot stat '{}'", from)),
            },
            ["cp", "-p", from, to] => match state.files.get(*from).cloned() {
                Some(content) => {
                    state.files.insert(to.to_string(), content);
                    ok("")
                }
                None => fail(1, format!("cp: cannot stat '{}'", from)),
            },
            ["rm", "-f", path] => {
                state.files.remove(*path);
                ok("")
            }
            ["systemctl", "-f", "daemon-reload"] => {
                state.services.push("daemon-reload".to_string());
                ok("")
            }
            ["systemctl", "-f", action, service] => {
                state.services.push(format!("{} {}", action, service));
                ok("")
            }
            ["type", "docker"] => {
                if state.docker_installed {
                    ok("docker is /usr/bin/docker\n")
                } else {
                    fail(1, "bash: type: docker: not found")
                }
            }
            ["docker", "--version"] => ok("Docker version 24.0.7, build afdd53b\n"),
            [first, rest @ ..] if *first == "apt-get" || first.starts_with("DEBIAN_FRONTEND=") => {
                if state.lock_busy > 0 {
                    state.lock_busy -= 1;
                    return fail(
                        100,
                        "E: Could not get lock /var/lib/dpkg/lock-frontend. \
                         It is held by process 1234",
                    );
                }
                if rest.contains(&"install") && rest.contains(&"docker.io") {
                    state.docker_installed = true;
                }
                ok("")
            }
            _ => fail(127, format!("command not found: {:?}", args)),
        }
    }
}

impl Runner for FakeHost {
    fn run(&self, command: &str) -> Result<ExecutionResult> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());
        Ok(self.execute(&mut state, command))
    }

    fn copy(&self, asset: &dyn Asset) -> Result<()> {
        let content = String::from_utf8(asset.contents()?)?;
        let mut state = self.state.lock().unwrap();
        let target = asset.target_path();
        if state.fail_matching.iter().any(|needle| target.contains(needle.as_str())) {
            anyhow::bail!("injected transfer failure: {}", target);
        }
        state.commands.push(format!("copy {} -> {}", asset.source(), target));
        state.files.insert(target, content);
        Ok(())
    }
}

impl Driver for FakeHost {
    fn driver_name(&self) -> &str {
        "fake"
    }

    fn machine_name(&self) -> &str {
        &self.name
    }

    fn ip(&self) -> Result<String> {
        Ok(self.ip.clone())
    }

    fn ssh_hostname(&self) -> Result<String> {
        Ok(self.ssh_host.clone())
    }

    fn wait_for_ssh(&self) -> Result<()> {
        if self.state().ssh_down {
            anyhow::bail!("ssh to {} never became available", self.ssh_host);
        }
        Ok(())
    }

    fn runner(&self) -> &dyn Runner {
        self
    }
}

/// Cluster configuration held in memory.
pub struct MemoryConfig(pub ClusterConfig);

impl MemoryConfig {
    pub fn runtime(runtime: ContainerRuntime) -> Self {
        Self(ClusterConfig {
            name: "minikube".to_string(),
            container_runtime: runtime,
        })
    }
}

impl ConfigStore for MemoryConfig {
    fn load(&self, _profile: &str) -> Result<ClusterConfig> {
        Ok(self.0.clone())
    }
}

/// Writes a fresh CA plus client certificate files under `dir` and returns
/// auth options pointing at them.
pub fn write_cert_fixtures(dir: &Utf8Path) -> AuthOptions {
    let certs = dir.join("certs");
    fs::create_dir_all(&certs).unwrap();

    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, "hostprov test CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key = KeyPair::generate().unwrap();
    let ca = params.self_signed(&key).unwrap();

    fs::write(certs.join("ca.pem"), ca.pem()).unwrap();
    fs::write(certs.join("ca-key.pem"), key.serialize_pem()).unwrap();
    fs::write(certs.join("cert.pem"), "client certificate\n").unwrap();
    fs::write(certs.join("key.pem"), "client key\n").unwrap();

    AuthOptions {
        store_path: dir.join("store"),
        ca_cert: certs.join("ca.pem"),
        ca_key: certs.join("ca-key.pem"),
        client_cert: certs.join("cert.pem"),
        client_key: certs.join("key.pem"),
        server_cert: dir.join("machine/server.pem"),
        server_key: dir.join("machine/server-key.pem"),
        ..Default::default()
    }
}

pub fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

/// Writes `yaml` to a temporary profile file and loads it.
pub fn load_profile_from_yaml(yaml: &str) -> Result<Profile> {
    let (dir, path) = utf8_tempdir();
    let file = path.join("profile.yaml");
    fs::write(&file, yaml)?;
    let profile = load_profile(&file);
    drop(dir);
    profile
}
