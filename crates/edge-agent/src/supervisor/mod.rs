use std::{
    io,
    path::{Path, PathBuf},
    process::Output,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::telemetry;

pub mod termination;

pub type DynProcessControl = Arc<dyn ProcessControl>;
pub type DynWorkerControl = Arc<dyn WorkerControl>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("read pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pid file {path} holds invalid pid {raw:?}")]
    InvalidPid { path: PathBuf, raw: String },
    #[error("probe pid {pid}: {source}")]
    Probe {
        pid: i32,
        #[source]
        source: Errno,
    },
    #[error("signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: Errno,
    },
    #[error("spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("{action} failed ({status}), output: {output}")]
    Command {
        action: &'static str,
        status: String,
        output: String,
    },
}

/// What the PID file says about the previously started worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NoPriorInstance,
    PriorInstanceAlive(i32),
    PriorInstanceDead(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited,
}

/// Signal-level access to processes.
pub trait ProcessControl: Send + Sync {
    /// Signal-0 probe; "no such process" maps to [`Liveness::Exited`].
    fn probe(&self, pid: i32) -> Result<Liveness, SupervisorError>;
    fn terminate(&self, pid: i32) -> Result<(), SupervisorError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProcessControl;

impl ProcessControl for SignalProcessControl {
    fn probe(&self, pid: i32) -> Result<Liveness, SupervisorError> {
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => Ok(Liveness::Alive),
            Err(Errno::ESRCH) => Ok(Liveness::Exited),
            Err(source) => Err(SupervisorError::Probe { pid, source }),
        }
    }

    fn terminate(&self, pid: i32) -> Result<(), SupervisorError> {
        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|source| SupervisorError::Signal { pid, source })
    }
}

/// The worker binary's command-line surface.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    async fn check(&self, config: &Path) -> Result<(), SupervisorError>;
    async fn start(&self, config: &Path, pid_file: &Path) -> Result<(), SupervisorError>;
    /// Starts a new worker that takes over listeners from `old_pid`.
    async fn reload(
        &self,
        config: &Path,
        pid_file: &Path,
        old_pid: i32,
    ) -> Result<(), SupervisorError>;
}

#[derive(Debug, Clone)]
pub struct HaproxyWorker {
    binary: String,
    extra_args: Vec<String>,
}

impl HaproxyWorker {
    pub fn new(binary: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args,
        }
    }

    async fn run(&self, action: &'static str, args: Vec<String>) -> Result<(), SupervisorError> {
        let output: Output = Command::new(&self.binary)
            .args(&self.extra_args)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;
        let result = if output.status.success() { "ok" } else { "error" };
        telemetry::record_worker_action(action, result);
        if output.status.success() {
            return Ok(());
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(SupervisorError::Command {
            action,
            status: output.status.to_string(),
            output: combined.trim().to_string(),
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl WorkerControl for HaproxyWorker {
    async fn check(&self, config: &Path) -> Result<(), SupervisorError> {
        self.run("check", vec!["-c".into(), "-f".into(), path_arg(config)])
            .await
    }

    async fn start(&self, config: &Path, pid_file: &Path) -> Result<(), SupervisorError> {
        self.run(
            "start",
            vec![
                "-D".into(),
                "-f".into(),
                path_arg(config),
                "-p".into(),
                path_arg(pid_file),
            ],
        )
        .await
    }

    async fn reload(
        &self,
        config: &Path,
        pid_file: &Path,
        old_pid: i32,
    ) -> Result<(), SupervisorError> {
        self.run(
            "reload",
            vec![
                "-D".into(),
                "-f".into(),
                path_arg(config),
                "-p".into(),
                path_arg(pid_file),
                "-sf".into(),
                old_pid.to_string(),
            ],
        )
        .await
    }
}

/// What [`Supervisor::reload`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadAction {
    Started,
    Restarted { dead_pid: i32 },
    Reloaded { superseded: i32 },
}

/// Drives validation, start and seamless reload of the worker process.
pub struct Supervisor {
    config_path: PathBuf,
    pid_file: PathBuf,
    worker: DynWorkerControl,
    process: DynProcessControl,
    termination_grace: Duration,
    termination_tick: Duration,
}

impl Supervisor {
    pub fn new(
        config_path: PathBuf,
        pid_file: PathBuf,
        worker: DynWorkerControl,
        process: DynProcessControl,
        termination_grace: Duration,
    ) -> Self {
        Self {
            config_path,
            pid_file,
            worker,
            process,
            termination_grace,
            termination_tick: termination::DEFAULT_TICK,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn process_state(&self) -> Result<ProcessState, SupervisorError> {
        let raw = match tokio::fs::read_to_string(&self.pid_file).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ProcessState::NoPriorInstance)
            }
            Err(source) => {
                return Err(SupervisorError::PidFile {
                    path: self.pid_file.clone(),
                    source,
                })
            }
        };
        let pid = parse_pid(&raw).ok_or_else(|| SupervisorError::InvalidPid {
            path: self.pid_file.clone(),
            raw: raw.clone(),
        })?;
        match self.process.probe(pid)? {
            Liveness::Alive => Ok(ProcessState::PriorInstanceAlive(pid)),
            Liveness::Exited => Ok(ProcessState::PriorInstanceDead(pid)),
        }
    }

    /// Runs the worker's check mode against the installed configuration.
    pub async fn validate(&self) -> Result<(), SupervisorError> {
        self.worker.check(&self.config_path).await
    }

    /// Starts a worker, or hands over from the running one and schedules its
    /// termination after the grace period.
    pub async fn reload(&self) -> Result<ReloadAction, SupervisorError> {
        match self.process_state().await? {
            ProcessState::NoPriorInstance => {
                info!(pid_file = %self.pid_file.display(), "no pid file, starting worker");
                self.worker.start(&self.config_path, &self.pid_file).await?;
                Ok(ReloadAction::Started)
            }
            ProcessState::PriorInstanceDead(pid) => {
                warn!(pid, "previous worker is gone, starting a new one");
                self.worker.start(&self.config_path, &self.pid_file).await?;
                Ok(ReloadAction::Restarted { dead_pid: pid })
            }
            ProcessState::PriorInstanceAlive(pid) => {
                self.worker
                    .reload(&self.config_path, &self.pid_file, pid)
                    .await?;
                info!(
                    pid,
                    grace_secs = self.termination_grace.as_secs(),
                    "worker reloaded, scheduling termination of previous instance"
                );
                termination::schedule(
                    self.process.clone(),
                    pid,
                    self.termination_grace,
                    self.termination_tick,
                );
                Ok(ReloadAction::Reloaded { superseded: pid })
            }
        }
    }
}

/// PIDs must be positive: signalling 0 or a negative PID targets process groups.
fn parse_pid(raw: &str) -> Option<i32> {
    raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}
