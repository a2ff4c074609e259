use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use common::api::{Application, Task};
use nix::errno::Errno;

use crate::config;
use crate::supervisor::{Liveness, ProcessControl, SupervisorError, WorkerControl};

pub(crate) fn base_config() -> config::AppConfig {
    config::AppConfig {
        coordinators: vec!["127.0.0.1:7676".into()],
        mode: config::AgentMode::Haproxy,
        connect_timeout_ms: 200,
        reconnect_backoff_max_ms: 50,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
        serve_metrics: false,
        haproxy: config::HaproxyConfig {
            pid_file: Some("/tmp/relay-test-haproxy.pid".into()),
            ..Default::default()
        },
        worker: config::WorkerConfig::default(),
        labels: config::LabelConfig::default(),
    }
}

pub(crate) fn task(id: &str, host: &str, ports: &[u16]) -> Task {
    Task {
        id: id.into(),
        host: host.into(),
        ports: ports.to_vec(),
        staged_at: "2024-05-01T10:00:00Z".into(),
        started_at: "2024-05-01T10:00:05Z".into(),
    }
}

pub(crate) fn app(name: &str, ports: &[u16], tasks: Vec<Task>) -> Application {
    Application {
        name: name.into(),
        ports: ports.to_vec(),
        tasks,
        ..Default::default()
    }
}

/// Adds the default opt-in label.
pub(crate) fn enabled(mut app: Application) -> Application {
    app.labels
        .insert("relay.haproxy.enabled".into(), "true".into());
    app
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WorkerCall {
    Check,
    Start,
    Reload(i32),
}

/// Records worker invocations; calls listed in `failures` fail with the given output.
#[derive(Default)]
pub(crate) struct MockWorker {
    calls: StdMutex<Vec<WorkerCall>>,
    failures: StdMutex<HashMap<WorkerCall, String>>,
}

impl MockWorker {
    pub(crate) fn calls(&self) -> Vec<WorkerCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn fail_on(&self, call: WorkerCall, output: &str) {
        self.failures
            .lock()
            .expect("failures lock")
            .insert(call, output.to_string());
    }

    pub(crate) fn clear_failures(&self) {
        self.failures.lock().expect("failures lock").clear();
    }

    fn record(&self, call: WorkerCall, action: &'static str) -> Result<(), SupervisorError> {
        self.calls.lock().expect("calls lock").push(call);
        match self.failures.lock().expect("failures lock").get(&call) {
            Some(output) => Err(SupervisorError::Command {
                action,
                status: "exit status: 1".into(),
                output: output.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WorkerControl for MockWorker {
    async fn check(&self, _config: &Path) -> Result<(), SupervisorError> {
        self.record(WorkerCall::Check, "check")
    }

    async fn start(&self, _config: &Path, _pid_file: &Path) -> Result<(), SupervisorError> {
        self.record(WorkerCall::Start, "start")
    }

    async fn reload(
        &self,
        _config: &Path,
        _pid_file: &Path,
        old_pid: i32,
    ) -> Result<(), SupervisorError> {
        self.record(WorkerCall::Reload(old_pid), "reload")
    }
}

/// Scripted liveness per PID; unknown PIDs have exited.
#[derive(Default)]
pub(crate) struct MockProcess {
    liveness: StdMutex<HashMap<i32, Result<Liveness, Errno>>>,
    terminated: StdMutex<Vec<i32>>,
}

impl MockProcess {
    pub(crate) fn set(&self, pid: i32, liveness: Result<Liveness, Errno>) {
        self.liveness
            .lock()
            .expect("liveness lock")
            .insert(pid, liveness);
    }

    pub(crate) fn terminated(&self) -> Vec<i32> {
        self.terminated.lock().expect("terminated lock").clone()
    }
}

impl ProcessControl for MockProcess {
    fn probe(&self, pid: i32) -> Result<Liveness, SupervisorError> {
        match self.liveness.lock().expect("liveness lock").get(&pid) {
            Some(Ok(liveness)) => Ok(*liveness),
            Some(Err(source)) => Err(SupervisorError::Probe {
                pid,
                source: *source,
            }),
            None => Ok(Liveness::Exited),
        }
    }

    fn terminate(&self, pid: i32) -> Result<(), SupervisorError> {
        self.terminated.lock().expect("terminated lock").push(pid);
        Ok(())
    }
}
