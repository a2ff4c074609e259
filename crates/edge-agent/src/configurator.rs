use std::sync::Arc;

use async_trait::async_trait;
use common::api::Snapshot;

pub type DynConfigurator = Arc<dyn Configurator>;

/// Consumer of delivered snapshots.
#[async_trait]
pub trait Configurator: Send + Sync {
    /// Applies `snapshot`; returns whether the worker was (re)loaded.
    async fn update(&self, snapshot: Snapshot) -> anyhow::Result<bool>;
}
