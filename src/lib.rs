pub mod asset;
pub mod cli;
pub mod config;
pub mod download;
pub mod driver;
pub mod error;
pub mod executor;
pub mod osrelease;
pub mod privilege;
pub mod provision;
pub mod runner;

pub use error::ProvisionError;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::driver::{Driver, GenericDriver};
use crate::executor::CommandExecutor;
use crate::provision::{Collaborators, Factory, Provisioner, RcgenAuthority, Registry, detect};
use crate::runner::{LocalRunner, SshRunner};

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

fn load_validated(file: &camino::Utf8Path) -> Result<config::Profile> {
    let profile = config::load_profile(file)
        .with_context(|| format!("failed to load profile from {}", file))?;
    profile.validate().context("profile validation failed")?;
    Ok(profile)
}

fn build_driver(profile: &config::Profile, executor: Arc<dyn CommandExecutor>) -> Arc<dyn Driver> {
    let target = profile.ssh_target();
    let ssh_host = target.host.clone();
    let runner = SshRunner::new(executor, target, profile.privilege);
    Arc::new(GenericDriver::new(
        profile.machine.name.clone(),
        profile.machine.ip.clone(),
        ssh_host,
        Box::new(runner),
    ))
}

fn named_factory(registry: &Registry, name: &str) -> Result<Factory> {
    registry.get(name).with_context(|| {
        format!("unknown provisioner {:?}, expected one of {:?}", name, registry.names())
    })
}

/// Resolves the provisioner: the one the profile names, otherwise detection.
fn select_provisioner(
    registry: &Registry,
    profile: &config::Profile,
    driver: Arc<dyn Driver>,
) -> Result<Box<dyn Provisioner>> {
    match profile.machine.provisioner.as_deref() {
        Some(name) => {
            let factory = named_factory(registry, name)?;
            driver.wait_for_ssh().map_err(ProvisionError::SshUnavailable)?;
            info!("using provisioner {} from profile", name);
            Ok(factory(driver))
        }
        None => Ok(detect(registry, driver)?),
    }
}

pub fn run_provision(opts: &cli::ProvisionArgs, executor: Arc<dyn CommandExecutor>) -> Result<()> {
    let mut profile = load_validated(&opts.file)?;
    if let Some(runtime) = opts.runtime {
        info!("container runtime overridden to {}", runtime);
        profile.cluster.container_runtime = runtime;
    }

    let registry = Registry::with_defaults();
    let driver = build_driver(&profile, Arc::clone(&executor));
    let request = profile.request(opts.wait);

    if opts.dry_run {
        // Commands only reach the dry-run executor; the host is never contacted.
        let name = profile
            .machine
            .provisioner
            .as_deref()
            .context("--dry-run needs machine.provisioner in the profile")?;
        let factory = named_factory(&registry, name)?;
        let mut provisioner = factory(driver);
        provisioner.set_options(&request);
        let options = provisioner.generate_docker_options(request.engine.port)?;
        info!(
            "dry run: {} would write {}:\n{}",
            provisioner, options.engine_options_path, options.engine_options
        );
        return Ok(());
    }

    let mut provisioner = select_provisioner(&registry, &profile, driver)?;
    info!("provisioning {} with {}", profile.machine.name, provisioner);

    let local = LocalRunner::new(executor, false);
    let collaborators = Collaborators::new(&profile, &RcgenAuthority, &local);
    provisioner
        .provision(request, &collaborators)
        .with_context(|| format!("failed to provision {}", profile.machine.name))?;

    info!("provisioning completed successfully");
    Ok(())
}

pub fn run_detect(opts: &cli::DetectArgs, executor: Arc<dyn CommandExecutor>) -> Result<()> {
    let profile = load_validated(&opts.file)?;
    let registry = Registry::with_defaults();
    let driver = build_driver(&profile, executor);
    let provisioner = detect(&registry, driver)?;
    let pretty = provisioner
        .os_release()
        .and_then(|info| info.pretty_name().or(info.id()))
        .unwrap_or("unknown");
    info!("detected {} ({})", provisioner, pretty);
    println!("{}", provisioner);
    Ok(())
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let profile = load_validated(&opts.file)?;
    info!("validation successful:\n{:#?}", profile);
    Ok(())
}

pub fn run_download(opts: &cli::DownloadArgs) -> Result<()> {
    let source = download::HttpRangeSource::new(&opts.url)?;
    let options = download::DownloadOptions {
        parts: opts.parts,
        retry_limit: opts.retry_limit,
        initial_backoff: Duration::from_secs(1),
    };
    let bytes = download::download(&source, &opts.output, &options)
        .with_context(|| format!("failed to download {}", opts.url))?;
    info!("saved {} bytes to {}", bytes, opts.output);
    Ok(())
}
