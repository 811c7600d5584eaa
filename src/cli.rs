use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::provision::ContainerRuntime;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision the machine described by the given profile
    Provision(ProvisionArgs),

    /// Detect which provisioner handles the machine
    Detect(DetectArgs),

    /// Validate the given YAML profile
    Validate(ValidateArgs),

    /// Download a file with parallel range requests
    Download(DownloadArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

impl Commands {
    /// Log level requested by the subcommand.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Provision(opts) => opts.log_level,
            Self::Detect(opts) => opts.log_level,
            Self::Validate(opts) => opts.log_level,
            Self::Download(opts) => opts.log_level,
            Self::Completions(_) => LogLevel::Warn,
        }
    }
}

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Path to the YAML file defining the profile
    #[arg(short, long, default_value = "profile.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,

    /// Wait for the docker daemon to listen after provisioning
    #[arg(long)]
    pub wait: bool,

    /// Override the container runtime from the profile
    #[arg(long, value_parser = ContainerRuntime::parse)]
    pub runtime: Option<ContainerRuntime>,
}

#[derive(Args, Debug)]
pub struct DetectArgs {
    /// Path to the YAML file defining the profile
    #[arg(short, long, default_value = "profile.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the YAML file to validate
    #[arg(short, long, default_value = "profile.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// URL of the file to download
    #[arg(long)]
    pub url: String,

    /// Destination path
    #[arg(short, long)]
    pub output: Utf8PathBuf,

    /// Number of ranges fetched in parallel
    #[arg(long, default_value_t = 4)]
    pub parts: usize,

    /// Retries per range after the first attempt
    #[arg(long, default_value_t = 3)]
    pub retry_limit: u32,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// Maps directly to the levels of the `tracing` crate. `--log-level debug`
/// shows every command sent to the host; `trace` also shows its output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
