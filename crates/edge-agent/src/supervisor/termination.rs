use std::time::Duration;

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use super::{DynProcessControl, Liveness};
use crate::telemetry;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The superseded instance exited on its own.
    Exited,
    /// It was still alive at the deadline and received SIGTERM.
    Terminated,
    SignalFailed,
    ProbeFailed,
}

impl TerminationOutcome {
    fn metric_label(self) -> &'static str {
        match self {
            TerminationOutcome::Exited => "exited",
            TerminationOutcome::Terminated => "terminated",
            TerminationOutcome::SignalFailed => "signal_failed",
            TerminationOutcome::ProbeFailed => "probe_failed",
        }
    }
}

/// Watches `pid` once per `tick` and sends it a single SIGTERM if it is still
/// alive after `grace`.
pub fn schedule(
    process: DynProcessControl,
    pid: i32,
    grace: Duration,
    tick: Duration,
) -> JoinHandle<TerminationOutcome> {
    tokio::spawn(async move {
        let outcome = watch(process, pid, grace, tick).await;
        telemetry::record_termination(outcome.metric_label());
        outcome
    })
}

async fn watch(
    process: DynProcessControl,
    pid: i32,
    grace: Duration,
    tick: Duration,
) -> TerminationOutcome {
    let deadline = Instant::now() + grace;
    loop {
        tokio::time::sleep(tick).await;
        match process.probe(pid) {
            Ok(Liveness::Exited) => {
                debug!(pid, "superseded worker exited");
                return TerminationOutcome::Exited;
            }
            Ok(Liveness::Alive) => {}
            Err(err) => {
                warn!(pid, error = %err, "cannot probe superseded worker, giving up");
                return TerminationOutcome::ProbeFailed;
            }
        }
        if Instant::now() >= deadline {
            return match process.terminate(pid) {
                Ok(()) => {
                    info!(pid, "superseded worker outlived its grace period, sent SIGTERM");
                    TerminationOutcome::Terminated
                }
                Err(err) => {
                    warn!(pid, error = %err, "failed to terminate superseded worker");
                    TerminationOutcome::SignalFailed
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nix::errno::Errno;

    use super::*;
    use crate::test_support::MockProcess;

    #[tokio::test(start_paused = true)]
    async fn lingering_worker_gets_exactly_one_sigterm() {
        let process = Arc::new(MockProcess::default());
        process.set(10, Ok(Liveness::Alive));

        let outcome = schedule(
            process.clone(),
            10,
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .expect("join");

        assert_eq!(outcome, TerminationOutcome::Terminated);
        assert_eq!(process.terminated(), vec![10]);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_exiting_before_deadline_is_left_alone() {
        let process = Arc::new(MockProcess::default());
        process.set(11, Ok(Liveness::Alive));

        let handle = schedule(
            process.clone(),
            11,
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        process.set(11, Ok(Liveness::Exited));

        assert_eq!(handle.await.expect("join"), TerminationOutcome::Exited);
        assert!(process.terminated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_stops_watching() {
        let process = Arc::new(MockProcess::default());
        process.set(12, Err(Errno::EPERM));

        let outcome = schedule(
            process.clone(),
            12,
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .expect("join");

        assert_eq!(outcome, TerminationOutcome::ProbeFailed);
        assert!(process.terminated().is_empty());
    }
}
