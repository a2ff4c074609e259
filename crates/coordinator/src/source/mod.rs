use std::sync::Arc;

use async_trait::async_trait;
use common::api::Snapshot;

pub mod marathon;

pub use marathon::MarathonSource;

pub type DynSnapshotSource = Arc<dyn SnapshotSource>;

/// Something that can be polled for the current placement snapshot.
///
/// Implementations return only started, healthy tasks and never include an
/// application without tasks.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<Snapshot>;
}
