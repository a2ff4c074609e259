use std::{collections::BTreeMap, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use common::api::{Application, Snapshot, Task};
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, warn};

use super::SnapshotSource;
use crate::telemetry;

const APPS_PATH: &str = "/v2/apps?embed=apps.tasks";

/// Reads applications and their tasks from one of several Marathon masters.
#[derive(Clone)]
pub struct MarathonSource {
    endpoints: Vec<String>,
    client: reqwest::Client,
}

impl MarathonSource {
    pub fn new(endpoints: Vec<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        if endpoints.is_empty() {
            anyhow::bail!("marathon source needs at least one endpoint");
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build marathon http client")?;
        Ok(Self { endpoints, client })
    }

    async fn fetch_apps(&self) -> anyhow::Result<AppsResponse> {
        let mut order: Vec<&String> = self.endpoints.iter().collect();
        order.shuffle(&mut rand::rng());

        for endpoint in order {
            let url = format!("{endpoint}{APPS_PATH}");
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(err) => {
                    telemetry::record_source_request(endpoint, "error");
                    warn!(%endpoint, error = %err, "failed to fetch marathon apps");
                    continue;
                }
            };
            if !response.status().is_success() {
                telemetry::record_source_request(endpoint, "http_error");
                warn!(%endpoint, status = %response.status(), "marathon returned error status");
                continue;
            }
            let body = response
                .json::<AppsResponse>()
                .await
                .with_context(|| format!("decode marathon apps from {endpoint}"));
            let result = if body.is_ok() { "ok" } else { "decode_error" };
            telemetry::record_source_request(endpoint, result);
            return body;
        }

        anyhow::bail!("app list fetching failed on all marathon endpoints")
    }
}

#[async_trait]
impl SnapshotSource for MarathonSource {
    async fn fetch(&self) -> anyhow::Result<Snapshot> {
        let apps = self.fetch_apps().await?;
        Ok(snapshot_from_response(apps))
    }
}

#[derive(Debug, Deserialize)]
pub struct AppsResponse {
    #[serde(default)]
    apps: Vec<MarathonApp>,
}

#[derive(Debug, Deserialize)]
struct MarathonApp {
    id: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    ports: Option<Vec<i64>>,
    #[serde(default)]
    tasks: Option<Vec<MarathonTask>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarathonTask {
    id: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    ports: Option<Vec<i64>>,
    #[serde(default)]
    staged_at: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    health_check_results: Option<Vec<Option<HealthCheckResult>>>,
}

#[derive(Debug, Deserialize)]
struct HealthCheckResult {
    #[serde(default)]
    alive: bool,
}

impl MarathonTask {
    fn is_healthy(&self) -> bool {
        self.health_check_results
            .iter()
            .flatten()
            .flatten()
            .all(|result| result.alive)
    }
}

fn to_ports(raw: &[i64]) -> Option<Vec<u16>> {
    raw.iter().map(|port| u16::try_from(*port).ok()).collect()
}

/// Builds a snapshot of started, healthy tasks.
///
/// Apps and tasks are sorted by id. Apps without ports, with an unassigned
/// (zero) port, or left without tasks are dropped.
pub fn snapshot_from_response(response: AppsResponse) -> Snapshot {
    let mut apps = response.apps;
    apps.sort_by(|a, b| a.id.cmp(&b.id));

    let mut snapshot = Snapshot::new();
    for app in apps {
        let Some(ports) = app.ports.as_deref().and_then(to_ports) else {
            debug!(app = %app.id, "skipping app with invalid ports");
            continue;
        };
        if ports.is_empty() || ports.contains(&0) {
            continue;
        }

        let mut tasks = app.tasks.unwrap_or_default();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let tasks: Vec<Task> = tasks
            .into_iter()
            .filter(|task| task.is_healthy())
            .filter_map(|task| {
                let Some(ports) = task.ports.as_deref().map(to_ports).unwrap_or(Some(Vec::new()))
                else {
                    warn!(task = %task.id, "skipping task with out of range port");
                    return None;
                };
                Some(Task {
                    id: task.id,
                    host: task.host,
                    ports,
                    staged_at: task.staged_at.unwrap_or_default(),
                    started_at: task.started_at.unwrap_or_default(),
                })
            })
            .filter(Task::is_started)
            .collect();

        if tasks.is_empty() {
            continue;
        }

        snapshot.insert(Application {
            name: app.id,
            labels: app.labels.unwrap_or_default(),
            ports,
            tasks,
        });
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};

    fn parse(body: &str) -> Snapshot {
        let response: AppsResponse = serde_json::from_str(body).expect("valid fixture");
        snapshot_from_response(response)
    }

    fn whatever_tasks(snapshot: &Snapshot) -> usize {
        snapshot
            .get("/whatever")
            .map(|app| app.tasks.len())
            .unwrap_or(0)
    }

    #[test]
    fn app_without_health_checks_keeps_started_task() {
        let snapshot = parse(include_str!("../../tests/fixtures/marathon/no_health_checks.json"));
        assert_eq!(whatever_tasks(&snapshot), 1);
        let app = snapshot.get("/whatever").expect("app");
        assert_eq!(app.ports, vec![1234]);
        assert_eq!(app.tasks[0].host, "web33");
        assert_eq!(app.tasks[0].ports, vec![31005]);
    }

    #[test]
    fn app_with_good_health_checks_keeps_task() {
        let snapshot = parse(include_str!("../../tests/fixtures/marathon/good_health_checks.json"));
        assert_eq!(whatever_tasks(&snapshot), 1);
    }

    #[test]
    fn failed_health_check_drops_task_and_empty_app() {
        let snapshot = parse(include_str!("../../tests/fixtures/marathon/bad_health_checks.json"));
        assert_eq!(whatever_tasks(&snapshot), 0);
        assert!(snapshot.get("/whatever").is_none());
    }

    #[test]
    fn null_health_check_entries_do_not_exclude() {
        let snapshot = parse(include_str!("../../tests/fixtures/marathon/null_health_checks.json"));
        assert_eq!(whatever_tasks(&snapshot), 1);
    }

    #[test]
    fn unstarted_tasks_and_unassigned_ports_are_filtered() {
        let snapshot = parse(
            r#"{"apps": [
                {"id": "/zero", "ports": [0], "tasks": [
                    {"id": "z.1", "host": "h", "ports": [1], "startedAt": "2015-01-01T00:00:00Z"}
                ]},
                {"id": "/noports", "ports": [], "tasks": [
                    {"id": "n.1", "host": "h", "ports": [], "startedAt": "2015-01-01T00:00:00Z"}
                ]},
                {"id": "/web", "ports": [80], "tasks": [
                    {"id": "w.2", "host": "h2", "ports": [31002], "startedAt": "2015-01-01T00:00:00Z"},
                    {"id": "w.1", "host": "h1", "ports": [31001], "startedAt": "2015-01-01T00:00:00Z"},
                    {"id": "w.3", "host": "h3", "ports": [31003], "startedAt": ""},
                    {"id": "w.4", "host": "h4", "ports": [31004]}
                ]}
            ]}"#,
        );
        assert_eq!(snapshot.len(), 1);
        let web = snapshot.get("/web").expect("web");
        let ids: Vec<_> = web.tasks.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["w.1", "w.2"]);
    }

    #[tokio::test]
    async fn fetch_fails_over_to_healthy_endpoint() {
        let healthy = MockServer::start();
        let mock = healthy.mock(|when, then| {
            when.method(GET)
                .path("/v2/apps")
                .query_param("embed", "apps.tasks");
            then.status(200)
                .header("content-type", "application/json")
                .body(include_str!("../../tests/fixtures/marathon/no_health_checks.json"));
        });
        let broken = MockServer::start();
        let broken_mock = broken.mock(|when, then| {
            when.method(GET).path("/v2/apps");
            then.status(503);
        });

        let source = MarathonSource::new(
            vec![broken.base_url(), healthy.base_url()],
            Duration::from_secs(2),
        )
        .expect("source");

        for _ in 0..3 {
            let snapshot = source.fetch().await.expect("fetch");
            assert_eq!(whatever_tasks(&snapshot), 1);
        }
        assert_eq!(mock.hits(), 3);
        assert!(broken_mock.hits() <= 3);
    }

    #[tokio::test]
    async fn fetch_errors_when_every_endpoint_fails() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/apps");
            then.status(500);
        });

        let source =
            MarathonSource::new(vec![server.base_url()], Duration::from_secs(2)).expect("source");
        let err = source.fetch().await.expect_err("all endpoints down");
        assert!(err.to_string().contains("all marathon endpoints"), "{err}");
    }
}
