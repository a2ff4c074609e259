use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use common::api::{Application, Snapshot, Task};

use crate::source::SnapshotSource;

/// Single-app snapshot on port 8080 with one task per `(host, port)`.
pub(crate) fn snapshot_with(app: &str, tasks: &[(&str, u16)]) -> Snapshot {
    let tasks = tasks
        .iter()
        .enumerate()
        .map(|(idx, (host, port))| Task {
            id: format!("{app}.{idx}"),
            host: host.to_string(),
            ports: vec![*port],
            staged_at: "2024-05-01T10:00:00Z".into(),
            started_at: "2024-05-01T10:00:05Z".into(),
        })
        .collect();
    std::iter::once(Application {
        name: app.into(),
        ports: vec![8080],
        tasks,
        ..Default::default()
    })
    .collect()
}

/// Returns scripted results in order, repeating the last one once exhausted.
pub(crate) struct ScriptedSource {
    script: StdMutex<VecDeque<Result<Snapshot, String>>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new(script: Vec<Result<Snapshot, String>>) -> Self {
        Self {
            script: StdMutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self) -> anyhow::Result<Snapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().expect("script lock");
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        match next {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Err(anyhow::anyhow!("no snapshot scripted")),
        }
    }
}
