//! Transferable file assets.
//!
//! An asset pairs a byte source with a destination (directory, file name,
//! octal permissions). Runners consume assets to place files locally or on
//! the remote host.

use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// A file to be placed somewhere by a [`Runner`](crate::runner::Runner).
pub trait Asset {
    /// Where the content comes from, for logs and errors.
    fn source(&self) -> &str;

    fn target_dir(&self) -> &str;

    fn target_name(&self) -> &str;

    /// Octal permission string such as `"0640"`.
    fn permissions(&self) -> &str;

    /// Reads the full content.
    fn contents(&self) -> Result<Vec<u8>>;

    /// Full target path. Joined with `/` regardless of the local platform
    /// because targets usually live on a Linux host.
    fn target_path(&self) -> String {
        let dir = self.target_dir().trim_end_matches('/');
        format!("{}/{}", dir, self.target_name())
    }
}

/// Parses an octal permission string (`"0640"`, `"755"`).
pub fn parse_mode(permissions: &str) -> Result<u32> {
    let mode = u32::from_str_radix(permissions, 8)
        .with_context(|| format!("invalid permission string: {:?}", permissions))?;
    if mode > 0o7777 {
        anyhow::bail!("permission out of range: {:?}", permissions);
    }
    Ok(mode)
}

/// An asset backed by a file on local disk.
#[derive(Debug, Clone)]
pub struct FileAsset {
    source: Utf8PathBuf,
    target_dir: String,
    target_name: String,
    permissions: String,
}

impl FileAsset {
    /// Creates a new file asset, failing if `source` is missing.
    pub fn new(
        source: impl Into<Utf8PathBuf>,
        target_dir: impl Into<String>,
        target_name: impl Into<String>,
        permissions: impl Into<String>,
    ) -> Result<Self> {
        let source = source.into();
        let metadata =
            fs::metadata(&source).with_context(|| format!("failed to stat asset {}", source))?;
        if metadata.len() == 0 {
            tracing::warn!("asset {} is an empty file", source);
        }
        let asset = Self {
            source,
            target_dir: target_dir.into(),
            target_name: target_name.into(),
            permissions: permissions.into(),
        };
        parse_mode(&asset.permissions)?;
        tracing::trace!("new file asset: {} -> {}", asset.source, asset.target_path());
        Ok(asset)
    }

    /// Builds an asset whose target is the full path `target`.
    pub fn to_path(
        source: impl Into<Utf8PathBuf>,
        target: &Utf8Path,
        permissions: impl Into<String>,
    ) -> Result<Self> {
        let dir = target.parent().map(Utf8Path::as_str).unwrap_or("/");
        let name = target
            .file_name()
            .with_context(|| format!("target path has no file name: {}", target))?;
        Self::new(source, dir, name, permissions)
    }

    pub fn source_path(&self) -> &Utf8Path {
        &self.source
    }
}

impl Asset for FileAsset {
    fn source(&self) -> &str {
        self.source.as_str()
    }

    fn target_dir(&self) -> &str {
        &self.target_dir
    }

    fn target_name(&self) -> &str {
        &self.target_name
    }

    fn permissions(&self) -> &str {
        &self.permissions
    }

    fn contents(&self) -> Result<Vec<u8>> {
        fs::read(&self.source).with_context(|| format!("failed to read asset {}", self.source))
    }
}

/// An asset whose content is held in memory.
#[derive(Debug, Clone)]
pub struct MemoryAsset {
    name: String,
    data: Vec<u8>,
    target_dir: String,
    target_name: String,
    permissions: String,
}

impl MemoryAsset {
    pub fn new(
        data: impl Into<Vec<u8>>,
        target_dir: impl Into<String>,
        target_name: impl Into<String>,
        permissions: impl Into<String>,
    ) -> Self {
        let target_dir = target_dir.into();
        let target_name = target_name.into();
        Self {
            name: format!("memory:{}", target_name),
            data: data.into(),
            target_dir,
            target_name,
            permissions: permissions.into(),
        }
    }
}

impl Asset for MemoryAsset {
    fn source(&self) -> &str {
        &self.name
    }

    fn target_dir(&self) -> &str {
        &self.target_dir
    }

    fn target_name(&self) -> &str {
        &self.target_name
    }

    fn permissions(&self) -> &str {
        &self.permissions
    }

    fn contents(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }
}
