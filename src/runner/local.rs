//! Runner for the machine hostprov itself runs on.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;

use super::Runner;
use crate::asset::{Asset, parse_mode};
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult};

/// Executes command lines with `sh -c` and copies assets with the
/// filesystem API.
pub struct LocalRunner {
    executor: Arc<dyn CommandExecutor>,
    dry_run: bool,
}

impl LocalRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>, dry_run: bool) -> Self {
        Self { executor, dry_run }
    }
}

impl Runner for LocalRunner {
    fn run(&self, command: &str) -> Result<ExecutionResult> {
        let spec = CommandSpec::new("sh", vec!["-c".to_string(), command.to_string()]);
        self.executor.execute(&spec)
    }

    fn copy(&self, asset: &dyn Asset) -> Result<()> {
        let target = asset.target_path();
        if self.dry_run {
            tracing::info!("dry run: copy {} -> {}", asset.source(), target);
            return Ok(());
        }

        let dir = Utf8Path::new(asset.target_dir());
        fs::create_dir_all(dir).with_context(|| format!("failed to create directory: {}", dir))?;

        let contents = asset.contents()?;
        fs::write(&target, contents).with_context(|| format!("failed to write {}", target))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = parse_mode(asset.permissions())?;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                .with_context(|| format!("failed to set permissions on {}", target))?;
        }
        #[cfg(not(unix))]
        parse_mode(asset.permissions())?;

        tracing::debug!("copied {} -> {} ({})", asset.source(), target, asset.permissions());
        Ok(())
    }
}
