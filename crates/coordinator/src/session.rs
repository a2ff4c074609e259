use std::{net::SocketAddr, time::Duration};

use bytes::BytesMut;
use common::{
    api::Snapshot,
    wire::{self, Frame, WireError},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::watch,
    time,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{coordinator::SharedCoordinator, telemetry};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),
    #[error("agent failed to apply snapshot: {0}")]
    Remote(String),
    #[error("agent closed the connection")]
    Closed,
    #[error("unexpected frame from agent: {0}")]
    Protocol(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl DeliveryError {
    fn metric_label(&self) -> &'static str {
        match self {
            DeliveryError::Timeout(_) => "timeout",
            DeliveryError::Remote(_) => "remote_error",
            DeliveryError::Closed => "closed",
            DeliveryError::Protocol(_) => "protocol_error",
            DeliveryError::Wire(_) => "io_error",
        }
    }
}

/// Request/response channel to one connected agent.
pub struct AgentConnection<S> {
    stream: S,
    buffer: BytesMut,
    call_timeout: Duration,
}

impl<S> AgentConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, call_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            call_timeout,
        }
    }

    /// Delivers one snapshot and waits for the agent's answer.
    ///
    /// Returns whether the agent reloaded its worker.
    pub async fn push(&mut self, snapshot: &Snapshot) -> Result<bool, DeliveryError> {
        let call_id = Uuid::new_v4().to_string();
        let frame = Frame::Push {
            call_id: call_id.clone(),
            snapshot: snapshot.clone(),
        };
        let timeout = self.call_timeout;
        let result = time::timeout(timeout, self.call(&call_id, &frame))
            .await
            .unwrap_or(Err(DeliveryError::Timeout(timeout)));
        telemetry::record_delivery(match &result {
            Ok(_) => "ok",
            Err(err) => err.metric_label(),
        });
        result
    }

    async fn call(&mut self, call_id: &str, frame: &Frame) -> Result<bool, DeliveryError> {
        wire::write_frame(&mut self.stream, frame).await?;
        match wire::read_frame(&mut self.stream, &mut self.buffer).await? {
            None => Err(DeliveryError::Closed),
            Some(Frame::PushResult {
                call_id: answered,
                reloaded,
                error,
            }) => {
                if answered != call_id {
                    return Err(DeliveryError::Protocol(format!(
                        "result for call {answered}, expected {call_id}"
                    )));
                }
                match error {
                    Some(message) => Err(DeliveryError::Remote(message)),
                    None => Ok(reloaded),
                }
            }
            Some(Frame::Push { .. }) => Err(DeliveryError::Protocol("push".into())),
        }
    }
}

/// Accepts agent connections until shutdown, one session task per agent.
pub async fn accept_connections(
    listener: TcpListener,
    coordinator: SharedCoordinator,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "accepting agent connections");
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, ?err, "failed to set TCP_NODELAY");
                    }
                    let coordinator = coordinator.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_agent(stream, peer, coordinator, shutdown).await {
                            warn!(agent = %peer, error = %err, "agent session ended with error");
                        }
                    });
                }
                Err(err) => {
                    warn!(?err, "failed to accept agent connection");
                    time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    Ok(())
}

/// Runs one agent session: current snapshot first, then every queued change.
///
/// An agent that fails to apply a snapshot stays subscribed and only sees
/// the next change.
pub async fn serve_agent<S>(
    stream: S,
    peer: SocketAddr,
    coordinator: SharedCoordinator,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DeliveryError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = peer.to_string();
    let registry = coordinator.registry().clone();
    let (session_id, mut updates, current) = coordinator.subscribe(&name).await;
    info!(agent = %name, "agent connected");

    let mut connection = AgentConnection::new(stream, coordinator.delivery_timeout());
    let result: Result<(), DeliveryError> = async {
        if let Some(current) = current {
            deliver(&mut connection, &name, &current).await?;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = updates.recv() => match next {
                    Some(snapshot) => deliver(&mut connection, &name, &snapshot).await?,
                    None => {
                        debug!(agent = %name, "delivery channel closed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    let reason = if result.is_ok() { "disconnect" } else { "delivery_error" };
    registry.remove(&name, session_id, reason).await;
    info!(agent = %name, "agent disconnected");
    result
}

async fn deliver<S>(
    connection: &mut AgentConnection<S>,
    name: &str,
    snapshot: &Snapshot,
) -> Result<(), DeliveryError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match connection.push(snapshot).await {
        Ok(true) => info!(agent = %name, "agent reloaded configuration"),
        Ok(false) => info!(agent = %name, "agent configuration unchanged"),
        Err(DeliveryError::Remote(message)) => {
            warn!(agent = %name, error = %message, "agent failed to apply snapshot");
        }
        Err(err) => return Err(err),
    }
    Ok(())
}
