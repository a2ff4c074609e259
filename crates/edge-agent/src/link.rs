use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::BytesMut;
use common::wire::{self, Frame};
use rand::{seq::SliceRandom, Rng};
use tokio::{net::TcpStream, sync::watch, time};
use tracing::{debug, info, warn};

use crate::{configurator::DynConfigurator, telemetry};

/// Agent side of the distribution protocol: keeps one connection to some
/// coordinator and feeds every pushed snapshot to the configurator.
pub struct AgentLink {
    coordinators: Vec<String>,
    connect_timeout: Duration,
    backoff_max: Duration,
    configurator: DynConfigurator,
}

impl AgentLink {
    pub fn new(
        coordinators: Vec<String>,
        connect_timeout: Duration,
        backoff_max: Duration,
        configurator: DynConfigurator,
    ) -> Self {
        Self {
            coordinators,
            connect_timeout,
            backoff_max,
            configurator,
        }
    }

    /// Connects, serves and reconnects until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                connected = self.connect() => connected,
            };

            match connected {
                Some((stream, addr)) => {
                    info!(%addr, "connected to coordinator");
                    match self.serve(stream, &mut shutdown).await {
                        Ok(()) => info!(%addr, "coordinator connection closed"),
                        Err(err) => warn!(%addr, error = ?err, "coordinator connection failed"),
                    }
                }
                None => {
                    let pause = random_backoff(self.backoff_max);
                    warn!(
                        candidates = self.coordinators.len(),
                        backoff_ms = pause.as_millis() as u64,
                        "no coordinator reachable, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = time::sleep(pause) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Dials the candidates in random order; the first that answers wins.
    pub async fn connect(&self) -> Option<(TcpStream, String)> {
        let mut candidates = self.coordinators.clone();
        candidates.shuffle(&mut rand::rng());

        for addr in candidates {
            match time::timeout(self.connect_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => {
                    telemetry::record_connect("ok");
                    return Some((stream, addr));
                }
                Ok(Err(err)) => {
                    telemetry::record_connect("error");
                    debug!(%addr, error = %err, "coordinator dial failed");
                }
                Err(_) => {
                    telemetry::record_connect("timeout");
                    debug!(%addr, "coordinator dial timed out");
                }
            }
        }
        None
    }

    /// Handles push calls one at a time until the peer hangs up.
    pub async fn serve(
        &self,
        mut stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                frame = wire::read_frame(&mut stream, &mut buffer) => {
                    frame.context("read frame from coordinator")?
                }
            };

            let (call_id, snapshot) = match frame {
                None => return Ok(()),
                Some(Frame::Push { call_id, snapshot }) => (call_id, snapshot),
                Some(other) => anyhow::bail!("unexpected frame from coordinator: {other:?}"),
            };

            debug!(%call_id, apps = snapshot.len(), "snapshot received");
            let started = Instant::now();
            let reply = match self.configurator.update(snapshot).await {
                Ok(reloaded) => {
                    debug!(
                        %call_id,
                        reloaded,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "update finished"
                    );
                    Frame::PushResult {
                        call_id,
                        reloaded,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(%call_id, error = ?err, "update failed");
                    Frame::PushResult {
                        call_id,
                        reloaded: false,
                        error: Some(format!("{err:#}")),
                    }
                }
            };
            wire::write_frame(&mut stream, &reply)
                .await
                .context("write push result")?;
        }
    }
}

/// Uniform in `[0, max]`.
pub fn random_backoff(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
