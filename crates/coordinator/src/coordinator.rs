use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::api::Snapshot;
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinSet,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{registry::SubscriberRegistry, source::DynSnapshotSource, telemetry};

pub type SharedCoordinator = Arc<Coordinator>;

/// Owns the authoritative snapshot and distributes changes to subscribers.
pub struct Coordinator {
    source: DynSnapshotSource,
    current: RwLock<Option<Arc<Snapshot>>>,
    // Serializes swap + fan-out so subscribers observe snapshots in order.
    distribute: Mutex<()>,
    registry: SubscriberRegistry,
    fanout_deadline: Duration,
    delivery_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Distributed(FanOutReport),
    SourceError(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub evicted: Vec<String>,
}

impl Coordinator {
    pub fn new(
        source: DynSnapshotSource,
        registry: SubscriberRegistry,
        fanout_deadline: Duration,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            source,
            current: RwLock::new(None),
            distribute: Mutex::new(()),
            registry,
            fanout_deadline,
            delivery_timeout,
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    /// The authoritative snapshot, if one was ever fetched.
    pub async fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().await.clone()
    }

    /// Registers `name` and returns the snapshot it has to start from.
    ///
    /// Runs under the distribution lock, so every value later queued on the
    /// receiver is newer than the returned snapshot.
    pub async fn subscribe(
        &self,
        name: &str,
    ) -> (Uuid, mpsc::Receiver<Arc<Snapshot>>, Option<Arc<Snapshot>>) {
        let _ordered = self.distribute.lock().await;
        let (session_id, updates) = self.registry.register(name).await;
        let current = self.current().await;
        (session_id, updates, current)
    }

    /// Fetches from the source once and distributes the result if it changed.
    ///
    /// A source error keeps the previous snapshot.
    pub async fn poll(&self) -> PollOutcome {
        let snapshot = match self.source.fetch().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                telemetry::record_poll("source_error");
                warn!(error = ?err, "failed to fetch placement snapshot");
                return PollOutcome::SourceError(err.to_string());
            }
        };

        match self.update(snapshot).await {
            Some(report) => {
                telemetry::record_poll("changed");
                PollOutcome::Distributed(report)
            }
            None => {
                telemetry::record_poll("unchanged");
                PollOutcome::Unchanged
            }
        }
    }

    /// Installs `snapshot` as authoritative and fans it out, unless it equals
    /// the current one. Returns `None` for the no-op case.
    pub async fn update(&self, snapshot: Snapshot) -> Option<FanOutReport> {
        let _ordered = self.distribute.lock().await;
        let snapshot = Arc::new(snapshot);
        {
            let mut current = self.current.write().await;
            if current.as_deref() == Some(snapshot.as_ref()) {
                debug!("snapshot unchanged, skipping fan-out");
                return None;
            }
            *current = Some(snapshot.clone());
        }

        info!(
            apps = snapshot.len(),
            tasks = snapshot.task_count(),
            "placement snapshot changed"
        );
        Some(self.fan_out(snapshot).await)
    }

    /// Offers `snapshot` to every registered subscriber concurrently.
    ///
    /// A subscriber that does not accept the value within the fan-out
    /// deadline, or whose session is already gone, is removed and its channel
    /// closed. Returns once every attempt has resolved.
    pub async fn fan_out(&self, snapshot: Arc<Snapshot>) -> FanOutReport {
        let started = Instant::now();
        let subscribers = self.registry.snapshot().await;
        let deadline = self.fanout_deadline;

        let mut attempts = JoinSet::new();
        for (name, subscriber) in subscribers {
            let snapshot = snapshot.clone();
            attempts.spawn(async move {
                let outcome = match time::timeout(deadline, subscriber.sender.send(snapshot)).await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(_)) => Some("closed"),
                    Err(_) => Some("timeout"),
                };
                (name, subscriber.session_id, outcome)
            });
        }

        let mut report = FanOutReport::default();
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((_, _, None)) => {
                    report.delivered += 1;
                    telemetry::record_fanout("delivered");
                }
                Ok((name, session_id, Some(reason))) => {
                    warn!(agent = %name, reason, "evicting subscriber");
                    telemetry::record_fanout(reason);
                    self.registry.remove(&name, session_id, reason).await;
                    report.evicted.push(name);
                }
                Err(err) => {
                    error!(?err, "fan-out attempt panicked");
                }
            }
        }

        let elapsed = started.elapsed();
        telemetry::record_fanout_duration(elapsed);
        info!(
            delivered = report.delivered,
            evicted = report.evicted.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "snapshot fan-out finished"
        );
        report
    }
}

/// Polls the source on a fixed interval until shutdown.
pub async fn poll_loop(
    coordinator: SharedCoordinator,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                coordinator.poll().await;
            }
        }
    }

    Ok(())
}
