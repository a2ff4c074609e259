//! Placement snapshot DTOs shared by the coordinator and edge agents.

use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};

/// Point-in-time view of every application with at least one usable task.
///
/// Keys are application names. A `BTreeMap` keeps iteration order, equality
/// and the serialized form deterministic, so two snapshots describing the same
/// placement always compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    apps: BTreeMap<String, Application>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an application keyed by its name, replacing any previous entry.
    pub fn insert(&mut self, app: Application) -> Option<Application> {
        self.apps.insert(app.name.clone(), app)
    }

    /// Looks up an application by name.
    pub fn get(&self, name: &str) -> Option<&Application> {
        self.apps.get(name)
    }

    /// Number of applications in the snapshot.
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    /// Returns true when no application is present.
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Iterates applications in name order.
    pub fn apps(&self) -> btree_map::Values<'_, String, Application> {
        self.apps.values()
    }

    /// Total number of tasks across all applications.
    pub fn task_count(&self) -> usize {
        self.apps.values().map(|app| app.tasks.len()).sum()
    }
}

impl FromIterator<Application> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Application>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for app in iter {
            snapshot.insert(app);
        }
        snapshot
    }
}

impl IntoIterator for Snapshot {
    type Item = Application;
    type IntoIter = btree_map::IntoValues<String, Application>;

    fn into_iter(self) -> Self::IntoIter {
        self.apps.into_values()
    }
}

/// A deployed application and its running tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Unique application name.
    pub name: String,
    /// Free-form labels used by agents to opt in to load balancing.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Declared service port slots.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Running tasks, each binding one host port per declared slot.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Application {
    /// Returns the label value for `key`, if present.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// One running instance of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier, unique within its application.
    pub id: String,
    /// Host the task runs on.
    pub host: String,
    /// Host ports, indexed by the application's port slots.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// ISO-8601 staging time.
    #[serde(default)]
    pub staged_at: String,
    /// ISO-8601 start time; empty when the task has not started.
    #[serde(default)]
    pub started_at: String,
}

impl Task {
    /// Returns true once the task reported a start time.
    pub fn is_started(&self) -> bool {
        !self.started_at.is_empty()
    }
}
