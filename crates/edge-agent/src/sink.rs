use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use common::api::Snapshot;
use tokio::{
    io::{self, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::configurator::Configurator;

/// Configurator that only records what it receives, one
/// `<timestamp>: <json>` line per snapshot.
pub struct StateLogger<W> {
    out: Mutex<W>,
}

impl StateLogger<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> StateLogger<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Configurator for StateLogger<W> {
    async fn update(&self, snapshot: Snapshot) -> anyhow::Result<bool> {
        let json = serde_json::to_string(&snapshot).context("encode snapshot")?;
        let line = format!(
            "{}: {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true),
            json
        );
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes())
            .await
            .context("write state log")?;
        out.flush().await.context("flush state log")?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app, task};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn writes_one_timestamped_line_per_snapshot() {
        let logger = StateLogger::new(Vec::new());
        let snapshot: Snapshot = vec![app("web", &[80], vec![task("t1", "h1", &[31000])])]
            .into_iter()
            .collect();

        assert!(!logger.update(snapshot.clone()).await.expect("first"));
        assert!(!logger.update(Snapshot::new()).await.expect("second"));

        let written = String::from_utf8(logger.into_inner()).expect("utf8");
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);

        let (stamp, json) = lines[0].split_once(": ").expect("separator");
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok(), "{stamp}");
        let decoded: Snapshot = serde_json::from_str(json).expect("json");
        assert_eq!(decoded, snapshot);
        assert!(lines[1].ends_with(": {}"), "{}", lines[1]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn slow_reader_does_not_stall_the_runtime() {
        // A pipe far smaller than one line: the write only finishes while
        // the reader below keeps draining on the same thread.
        let (writer, mut reader) = tokio::io::duplex(8);
        let logger = std::sync::Arc::new(StateLogger::new(writer));
        let snapshot: Snapshot = vec![app("web", &[80], vec![task("t1", "h1", &[31000])])]
            .into_iter()
            .collect();

        let update = tokio::spawn({
            let logger = logger.clone();
            async move { logger.update(snapshot).await }
        });

        let mut line = Vec::new();
        while !line.ends_with(b"\n") {
            let mut chunk = [0u8; 8];
            let read = reader.read(&mut chunk).await.expect("read");
            assert!(read > 0, "writer closed early");
            line.extend_from_slice(&chunk[..read]);
        }

        assert!(!update.await.expect("join").expect("update"));
        let line = String::from_utf8(line).expect("utf8");
        assert!(line.contains("\"h1\""), "{line}");
    }
}
