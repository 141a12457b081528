use crate::error::Result;
use std::path::{Path, PathBuf};

pub const CODE_BASE_DIR: &str = "code_base";
pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const INTERMEDIATE_RESULT_FILE: &str = "intermediate_result.json";
pub const OUTPUT_ARCHIVE: &str = "output.tar.gz";
pub const STDOUT_FILE: &str = "_stdout.txt";

/// Root under which every experiment directory is created.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn experiment(&self, experiment_id: &str) -> ExperimentDir {
        ExperimentDir {
            path: self.root.join(format!("experiment_{experiment_id}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentDir {
    path: PathBuf,
}

impl ExperimentDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn code_base(&self) -> PathBuf {
        self.path.join(CODE_BASE_DIR)
    }

    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    pub fn simulation(&self, simulation_index: u64) -> SimulationDir {
        SimulationDir {
            path: self.path.join(format!("simulation_{simulation_index}")),
        }
    }
}

/// Working directory of one simulation run; every script runs with it as cwd.
#[derive(Debug, Clone)]
pub struct SimulationDir {
    path: PathBuf,
}

impl SimulationDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input(&self) -> PathBuf {
        self.path.join(INPUT_FILE)
    }

    pub fn output(&self) -> PathBuf {
        self.path.join(OUTPUT_FILE)
    }

    pub fn intermediate_result(&self) -> PathBuf {
        self.path.join(INTERMEDIATE_RESULT_FILE)
    }

    pub fn output_archive(&self) -> PathBuf {
        self.path.join(OUTPUT_ARCHIVE)
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.path.join(STDOUT_FILE)
    }

    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
