//! Snapshot to listener model transform.
//!
//! Each declared port slot of an eligible application becomes one listener
//! that balances across every task's host port for that slot. Applications in
//! port-range mode instead get one listener per task on consecutive ports
//! starting at the declared slot.

use std::collections::BTreeMap;

use common::api::{Application, Snapshot};
use serde::Serialize;
use tracing::warn;

/// Listening port → listener.
pub type ConfigModel = BTreeMap<u16, Listener>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub port: u16,
    /// Application the listener was derived from.
    pub app: String,
    pub servers: Vec<Server>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

/// Which applications take part and how their labels are read.
#[derive(Debug, Clone)]
pub struct LabelPolicy {
    enabled_label: Option<String>,
    port_range_label: Option<String>,
    truthy_values: Vec<String>,
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self::new(
            Some("relay.haproxy.enabled".into()),
            Some("relay.haproxy.port_range".into()),
            vec!["true".into(), "1".into()],
        )
    }
}

impl LabelPolicy {
    pub fn new(
        enabled_label: Option<String>,
        port_range_label: Option<String>,
        truthy_values: Vec<String>,
    ) -> Self {
        Self {
            enabled_label,
            port_range_label,
            truthy_values,
        }
    }

    pub fn enabled_label(&self) -> Option<&str> {
        self.enabled_label.as_deref()
    }

    fn is_truthy(&self, value: &str) -> bool {
        self.truthy_values.iter().any(|truthy| truthy == value)
    }

    /// Without an opt-in label every application is eligible.
    pub fn is_enabled(&self, app: &Application) -> bool {
        match &self.enabled_label {
            Some(label) => app.label(label).is_some_and(|value| self.is_truthy(value)),
            None => true,
        }
    }

    pub fn is_port_range(&self, app: &Application) -> bool {
        self.port_range_label
            .as_deref()
            .and_then(|label| app.label(label))
            .is_some_and(|value| self.is_truthy(value))
    }
}

/// Derives the listener model for `snapshot`.
///
/// Applications are visited in name order; when two claim the same listening
/// port the later one wins and a warning is logged. Tasks lacking a host port
/// for a slot are skipped for that slot.
pub fn build_model(snapshot: &Snapshot, policy: &LabelPolicy) -> ConfigModel {
    let mut model = ConfigModel::new();
    for app in snapshot.apps() {
        if !policy.is_enabled(app) {
            continue;
        }
        let listeners = if policy.is_port_range(app) {
            port_range_listeners(app)
        } else {
            slot_listeners(app)
        };
        for listener in listeners {
            if let Some(previous) = model.insert(listener.port, listener) {
                warn!(
                    port = previous.port,
                    replaced = %previous.app,
                    app = %app.name,
                    "listening port claimed twice, keeping the later application"
                );
            }
        }
    }
    model
}

fn slot_listeners(app: &Application) -> Vec<Listener> {
    app.ports
        .iter()
        .enumerate()
        .map(|(slot, port)| Listener {
            port: *port,
            app: app.name.clone(),
            servers: app
                .tasks
                .iter()
                .filter_map(|task| match task.ports.get(slot) {
                    Some(host_port) => Some(Server {
                        host: task.host.clone(),
                        port: *host_port,
                    }),
                    None => {
                        warn!(app = %app.name, task = %task.id, slot, "task has no port for slot");
                        None
                    }
                })
                .collect(),
            labels: app.labels.clone(),
        })
        .collect()
}

fn port_range_listeners(app: &Application) -> Vec<Listener> {
    let mut listeners = Vec::new();
    for (slot, base) in app.ports.iter().enumerate() {
        for (offset, task) in app.tasks.iter().enumerate() {
            let Some(host_port) = task.ports.get(slot) else {
                warn!(app = %app.name, task = %task.id, slot, "task has no port for slot");
                continue;
            };
            let Some(port) = u16::try_from(offset)
                .ok()
                .and_then(|offset| base.checked_add(offset))
            else {
                warn!(app = %app.name, base, offset, "port range exceeds 65535, truncating");
                break;
            };
            listeners.push(Listener {
                port,
                app: app.name.clone(),
                servers: vec![Server {
                    host: task.host.clone(),
                    port: *host_port,
                }],
                labels: app.labels.clone(),
            });
        }
    }
    listeners
}
