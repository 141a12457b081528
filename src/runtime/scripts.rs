use crate::error::{Error, Result};
use crate::workdir::{SimulationDir, INPUT_FILE};
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Number of trailing stdout log lines surfaced when a script fails.
pub const LOG_TAIL_LINES: usize = 100;

/// Adapter programs shipped in an experiment's code base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    InputWriter,
    Executor,
    OutputReader,
    ProgressMonitor,
}

impl Script {
    pub fn file_name(&self) -> &'static str {
        match self {
            Script::InputWriter => "input_writer",
            Script::Executor => "executor",
            Script::OutputReader => "output_reader",
            Script::ProgressMonitor => "progress_monitor",
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Invokes code-base scripts inside a simulation directory, appending their
/// combined stdout/stderr to the directory's capture file.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    code_base: PathBuf,
}

impl ScriptRunner {
    pub fn new(code_base: impl Into<PathBuf>) -> Self {
        Self {
            code_base: code_base.into(),
        }
    }

    pub fn path(&self, script: Script) -> PathBuf {
        self.code_base.join(script.file_name())
    }

    pub async fn exists(&self, script: Script) -> bool {
        tokio::fs::metadata(self.path(script))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    fn command(&self, script: Script, dir: &SimulationDir, via_shell: bool) -> Result<Command> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.stdout_log())?;
        let log_err = log.try_clone()?;

        let mut cmd = if via_shell {
            let mut cmd = Command::new("sh");
            cmd.arg(self.path(script));
            cmd
        } else {
            Command::new(self.path(script))
        };

        if script == Script::InputWriter {
            cmd.arg(INPUT_FILE);
        }

        cmd.current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        Ok(cmd)
    }

    /// Starts `script` without waiting for it.
    pub async fn spawn(&self, script: Script, dir: &SimulationDir) -> Result<Child> {
        info!("Before {} ...", script);

        let spawned = match self.command(script, dir, false)?.spawn() {
            // Scripts without a shebang line are handed to the shell.
            Err(e) if e.raw_os_error() == Some(libc::ENOEXEC) => {
                debug!("{} is not directly executable, running it with sh", script);
                self.command(script, dir, true)?.spawn()
            }
            other => other,
        };

        match spawned {
            Ok(child) => {
                debug!("{} spawned with PID: {:?}", script, child.id());
                Ok(child)
            }
            Err(e) => Err(failure(script, dir, format!("could not start: {e}")).await),
        }
    }

    /// Runs `script` to completion; a non-zero exit is an error.
    pub async fn run(&self, script: Script, dir: &SimulationDir) -> Result<()> {
        let mut child = self.spawn(script, dir).await?;
        let status = child.wait().await?;
        self.check_exit(script, status, dir).await
    }

    pub async fn check_exit(
        &self,
        script: Script,
        status: ExitStatus,
        dir: &SimulationDir,
    ) -> Result<()> {
        if status.success() {
            info!("After {} ...", script);
            return Ok(());
        }

        warn!(
            "An error occurred during '{}' execution. Please check if '{}' executes correctly on the selected infrastructure.",
            script, script
        );
        Err(failure(script, dir, status.to_string()).await)
    }
}

async fn failure(script: Script, dir: &SimulationDir, reason: String) -> Error {
    Error::ScriptFailed {
        script: script.to_string(),
        reason,
        log_tail: log_tail(&dir.stdout_log(), LOG_TAIL_LINES).await,
    }
}

/// Last `lines` lines of a log file, or an empty string when it cannot be read.
pub async fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(contents) = tokio::fs::read(path).await else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&contents);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
