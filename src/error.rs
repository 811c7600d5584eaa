//! Domain-specific error types for hostprov.
//!
//! This module defines `ProvisionError`, a `thiserror`-based enum that
//! provides typed error variants for every failure class of the
//! provisioning engine. Core functions return `Result<T, ProvisionError>`
//! for programmatic error handling, while collaborator traits (`Runner`,
//! `Driver`, `ConfigStore`, `CertAuthority`) continue to use `anyhow::Result`.
//!
//! `ProvisionError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at boundaries that return `anyhow::Result`.

use std::io;

use crate::provision::ProvisionStage;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// error kinds, falls back to including the OS-level error message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for hostprov.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// The OS descriptor contained no parseable `KEY=VALUE` line.
    #[error("failed to parse os-release: {0}")]
    Parse(String),

    /// The remote shell channel never became reachable.
    #[error("ssh is not available: {0:#}")]
    SshUnavailable(#[source] anyhow::Error),

    /// No registered provisioner reported compatibility with the host.
    #[error("no compatible provisioner found for host (ID={id:?})")]
    DetectionFailed {
        /// The `ID` field of the detected OS, if any.
        id: Option<String>,
    },

    /// A command ran but exited unsuccessfully.
    #[error("command execution failed: {command}: {status}")]
    Command {
        /// The command that was executed.
        command: String,
        /// Exit code plus whatever the command printed on failure.
        status: String,
    },

    /// The runner could not execute a command at all (spawn or channel failure).
    #[error("failed to run command: {command}: {source:#}")]
    Transport {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    /// The driver could not report a host fact (IP, SSH hostname).
    #[error("error getting {what} during provisioning: {source:#}")]
    Driver {
        what: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The certificate authority failed to produce a server certificate.
    #[error("error generating server cert: {0:#}")]
    CertGeneration(#[source] anyhow::Error),

    /// A certificate could not be copied to the local store or the host.
    #[error("failed to copy certificate {path}: {source:#}")]
    AuthCopy {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// Rendering, pushing, diffing or restarting a unit failed.
    #[error("failed to deploy unit {unit} to {path}: {reason}")]
    UnitDeploy {
        unit: String,
        path: String,
        reason: String,
    },

    /// The readiness probe exhausted its attempt budget.
    #[error("daemon is not listening on port {port} after {attempts} attempt(s)")]
    DaemonNotAvailable { port: u16, attempts: u32 },

    /// The remote package manager lock stayed busy past the retry budget.
    #[error("failed to obtain lock for {command:?} after {attempts} attempt(s)")]
    LockTimeout { command: String, attempts: u32 },

    /// A polling loop was cancelled by its caller.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A validation constraint was violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// A configuration file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// One or more download partitions failed.
    #[error("download failed for the following parts: {}", failures.join("; "))]
    Download { failures: Vec<String> },

    /// An orchestration stage failed; wraps the first failing step.
    #[error("provisioning failed at stage {stage}: {source}")]
    Stage {
        stage: ProvisionStage,
        #[source]
        source: Box<ProvisionError>,
    },

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred.
        context: String,
        /// Derived from [`io_error_kind_message`].
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Creates an `Io` variant with the `message` field automatically derived
    /// from the `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Wraps this error as the failure of orchestration stage `stage`.
    pub(crate) fn at_stage(self, stage: ProvisionStage) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, looking through `Stage` wrappers.
    pub fn root(&self) -> &ProvisionError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the orchestration stage that failed, if this error came from
    /// the provisioning sequence.
    pub fn stage(&self) -> Option<ProvisionStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
