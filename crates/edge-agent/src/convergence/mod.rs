//! Snapshot → worker configuration convergence.
//!
//! An update rearranges port-range tasks against the last applied snapshot,
//! derives the listener model and stops early when the model is unchanged.
//! Otherwise the artifact is rendered, installed, validated and the worker
//! reloaded. Failures leave the stored state as it was.

use std::{path::PathBuf, time::Instant};

use anyhow::Context;
use async_trait::async_trait;
use common::api::Snapshot;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{configurator::Configurator, supervisor::Supervisor, telemetry};

pub mod model;
pub mod rearrange;
pub mod render;

pub use model::{build_model, ConfigModel, LabelPolicy, Listener, Server};
pub use render::{ConfigRenderer, DynRenderer, HaproxyRenderer, RenderContext, TemplateRenderer};

#[derive(Debug, Default)]
struct AppliedState {
    model: Option<ConfigModel>,
    snapshot: Option<Snapshot>,
}

pub struct HaproxyConfigurator {
    state: Mutex<AppliedState>,
    renderer: DynRenderer,
    supervisor: Supervisor,
    bind_address: String,
    policy: LabelPolicy,
}

impl HaproxyConfigurator {
    pub fn new(
        renderer: DynRenderer,
        supervisor: Supervisor,
        bind_address: impl Into<String>,
        policy: LabelPolicy,
    ) -> Self {
        Self {
            state: Mutex::new(AppliedState::default()),
            renderer,
            supervisor,
            bind_address: bind_address.into(),
            policy,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.supervisor.config_path().to_path_buf()
    }

    async fn apply(&self, model: &ConfigModel) -> anyhow::Result<()> {
        let rendered = self
            .renderer
            .render(&RenderContext {
                bind_address: &self.bind_address,
                listeners: model,
            })
            .context("render configuration")?;

        let config_path = self.config_path();
        render::install(&config_path, &rendered)
            .await
            .context("install configuration")?;

        self.supervisor
            .validate()
            .await
            .with_context(|| format!("validate {}", config_path.display()))?;

        let action = self.supervisor.reload().await.context("reload worker")?;
        info!(
            ?action,
            listeners = model.len(),
            config = %config_path.display(),
            "worker configuration applied"
        );
        Ok(())
    }
}

#[async_trait]
impl Configurator for HaproxyConfigurator {
    async fn update(&self, snapshot: Snapshot) -> anyhow::Result<bool> {
        let started = Instant::now();
        let mut state = self.state.lock().await;

        let arranged = rearrange::rearrange(state.snapshot.as_ref(), &snapshot, &self.policy);
        let model = build_model(&arranged, &self.policy);

        if state.model.as_ref() == Some(&model) {
            // Task ids may differ behind an equal model; keep slots keyed on the latest ones.
            state.snapshot = Some(arranged);
            debug!(listeners = model.len(), "configuration unchanged");
            telemetry::record_update("unchanged");
            telemetry::record_update_duration("unchanged", started.elapsed());
            return Ok(false);
        }

        if let Err(err) = self.apply(&model).await {
            telemetry::record_update("error");
            telemetry::record_update_duration("error", started.elapsed());
            return Err(err);
        }

        state.model = Some(model);
        state.snapshot = Some(arranged);
        telemetry::record_update("applied");
        telemetry::record_update_duration("applied", started.elapsed());
        Ok(true)
    }
}
