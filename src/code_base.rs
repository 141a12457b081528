use crate::error::{Error, Result};
use crate::experiment_manager::ExperimentManager;
use crate::workdir::ExperimentDir;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SIMULATION_BINARIES_ARCHIVE: &str = "simulation_binaries.zip";
pub const DEFAULT_ATTEMPTS: u32 = 10;

/// Where a code base archive comes from.
#[async_trait]
pub trait CodeBaseSource: Send + Sync {
    /// Stores the code base archive in `dest` and returns its path.
    async fn fetch(&self, experiment_id: &str, dest: &Path) -> Result<PathBuf>;
}

#[async_trait]
impl CodeBaseSource for ExperimentManager {
    async fn fetch(&self, experiment_id: &str, dest: &Path) -> Result<PathBuf> {
        self.download_code_base(experiment_id, dest).await
    }
}

/// Downloads, extracts and prepares an experiment's code base.
#[derive(Debug, Clone)]
pub struct CodeBaseBootstrap {
    attempts: u32,
    cooldown: Duration,
}

impl CodeBaseBootstrap {
    pub fn new(attempts: u32, cooldown: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            cooldown,
        }
    }

    /// Installs the code base unless its directory already exists.
    ///
    /// A failed installation removes the directory so the next start retries
    /// from scratch.
    pub async fn ensure(
        &self,
        source: &dyn CodeBaseSource,
        experiment: &ExperimentDir,
        experiment_id: &str,
    ) -> Result<PathBuf> {
        let dir = experiment.code_base();
        if tokio::fs::metadata(&dir).await.is_ok() {
            debug!("Code base already present in {}", dir.display());
            return Ok(dir);
        }

        tokio::fs::create_dir_all(&dir).await?;

        match self.install(source, experiment_id, &dir).await {
            Ok(()) => Ok(dir),
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    warn!("Could not remove {}: {}", dir.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    async fn install(&self, source: &dyn CodeBaseSource, experiment_id: &str, dir: &Path) -> Result<()> {
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            info!("Getting code base ... (attempt {}/{})", attempt, self.attempts);

            match self.download_and_extract(source, experiment_id, dir).await {
                Ok(()) => return make_executable(dir).await,
                Err(e) => {
                    warn!("There was a problem while getting code base: {}", e);
                    last_error = e.to_string();
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.cooldown).await;
            }
        }

        Err(Error::CodeBase {
            experiment_id: experiment_id.to_string(),
            attempts: self.attempts,
            reason: last_error,
        })
    }

    async fn download_and_extract(
        &self,
        source: &dyn CodeBaseSource,
        experiment_id: &str,
        dir: &Path,
    ) -> Result<()> {
        let archive = source.fetch(experiment_id, dir).await?;
        extract(&archive, dir).await?;
        extract(&dir.join(SIMULATION_BINARIES_ARCHIVE), dir).await
    }
}

impl Default for CodeBaseBootstrap {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, Duration::from_secs(5))
    }
}

/// Extracts a zip archive into `dest`.
pub async fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive)?;
        let mut zip = zip::ZipArchive::new(file)?;
        zip.extract(&dest)?;
        debug!("Extracted {} into {}", archive.display(), dest.display());
        Ok(())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Adds execute permission for everyone to every top-level file in `dir`.
#[cfg(unix)]
pub async fn make_executable(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let permission_error =
        |e: std::io::Error| Error::Permissions(format!("{}: {e}", dir.display()));

    let mut entries = tokio::fs::read_dir(dir).await.map_err(permission_error)?;
    while let Some(entry) = entries.next_entry().await.map_err(permission_error)? {
        let metadata = entry.metadata().await.map_err(permission_error)?;
        if !metadata.is_file() {
            continue;
        }

        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        tokio::fs::set_permissions(entry.path(), permissions)
            .await
            .map_err(permission_error)?;
    }

    Ok(())
}

#[cfg(not(unix))]
pub async fn make_executable(_dir: &Path) -> Result<()> {
    Ok(())
}
