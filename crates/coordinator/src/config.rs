use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "RELAY_COORD";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Address agents connect to.
    pub listen_addr: String,
    pub poll_interval_ms: u64,
    /// How long a subscriber may take to accept a snapshot before eviction.
    pub fanout_deadline_ms: u64,
    /// Upper bound on one push/result exchange with an agent.
    pub delivery_timeout_secs: u64,
    pub metrics_host: String,
    pub metrics_port: u16,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Marathon base URLs, tried in random order.
    pub endpoints: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![default_endpoint()],
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SourceConfig {
    fn normalize(&mut self) {
        self.endpoints = self
            .endpoints
            .iter()
            .map(|endpoint| endpoint.trim().trim_end_matches('/').to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("source.endpoints must list at least one endpoint");
        }
        for endpoint in &self.endpoints {
            let url = reqwest::Url::parse(endpoint)
                .map_err(|err| anyhow::anyhow!("invalid source endpoint {endpoint}: {err}"))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("source endpoint {endpoint} must use http or https");
            }
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("source.request_timeout_secs must be > 0");
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid listen_addr {}: {}", self.listen_addr, err))
    }

    pub fn metrics_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.metrics_host, self.metrics_port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fanout_deadline(&self) -> Duration {
        Duration::from_millis(self.fanout_deadline_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        self.metrics_addr()?;
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be > 0");
        }
        if self.fanout_deadline_ms == 0 {
            anyhow::bail!("fanout_deadline_ms must be > 0");
        }
        if self.delivery_timeout_secs == 0 {
            anyhow::bail!("delivery_timeout_secs must be > 0");
        }
        self.source.validate()
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080".into()
}

fn default_request_timeout_secs() -> u64 {
    10
}

enum EnvKind {
    String,
    List,
}

// (ENV_NAME, config_key, kind)
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    ("RELAY_COORD_LISTEN_ADDR", "listen_addr", EnvKind::String),
    (
        "RELAY_COORD_POLL_INTERVAL_MS",
        "poll_interval_ms",
        EnvKind::String,
    ),
    (
        "RELAY_COORD_FANOUT_DEADLINE_MS",
        "fanout_deadline_ms",
        EnvKind::String,
    ),
    (
        "RELAY_COORD_DELIVERY_TIMEOUT_SECS",
        "delivery_timeout_secs",
        EnvKind::String,
    ),
    ("RELAY_COORD_METRICS_HOST", "metrics_host", EnvKind::String),
    ("RELAY_COORD_METRICS_PORT", "metrics_port", EnvKind::String),
    (
        "RELAY_COORD_SOURCE_ENDPOINTS",
        "source.endpoints",
        EnvKind::List,
    ),
    (
        "RELAY_COORD_SOURCE_REQUEST_TIMEOUT_SECS",
        "source.request_timeout_secs",
        EnvKind::String,
    ),
];

pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .set_default("listen_addr", "0.0.0.0:7676")?
        .set_default("poll_interval_ms", 1_000)?
        .set_default("fanout_deadline_ms", 10_000)?
        .set_default("delivery_timeout_secs", 60)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9190)?
        .set_default("source.endpoints", vec![default_endpoint()])?
        .set_default("source.request_timeout_secs", default_request_timeout_secs())?;

    for (env_key, cfg_key, kind) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            match kind {
                EnvKind::List => {
                    let entries: Vec<String> = value
                        .split(',')
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                    builder = builder.set_override(cfg_key, entries)?;
                }
                EnvKind::String => {
                    builder = builder.set_override(cfg_key, value)?;
                }
            }
        }
    }

    let mut app: AppConfig = builder.build()?.try_deserialize()?;
    app.listen_addr = app.listen_addr.trim().to_string();
    app.source.normalize();
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{panic, sync::Mutex};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_coordinator_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        let prefix = format!("{}_", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();
        for (key, _) in &existing {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }

        let result = panic::catch_unwind(test);

        for (key, _) in vars {
            env::remove_var(key);
        }
        for (key, value) in existing {
            env::set_var(key, value);
        }

        result.unwrap();
    }

    #[test]
    fn defaults_match_documented_values() {
        with_coordinator_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.listen_addr, "0.0.0.0:7676");
            assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
            assert_eq!(cfg.fanout_deadline(), Duration::from_secs(10));
            assert_eq!(cfg.delivery_timeout(), Duration::from_secs(60));
            assert_eq!(cfg.source.endpoints, vec!["http://127.0.0.1:8080"]);
        });
    }

    #[test]
    fn env_overrides_split_endpoint_lists() {
        with_coordinator_env(
            &[
                (
                    "RELAY_COORD_SOURCE_ENDPOINTS",
                    "http://m1:8080/, http://m2:8080,,",
                ),
                ("RELAY_COORD_FANOUT_DEADLINE_MS", "250"),
                ("RELAY_COORD_POLL_INTERVAL_MS", "5000"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(cfg.source.endpoints, vec!["http://m1:8080", "http://m2:8080"]);
                assert_eq!(cfg.fanout_deadline_ms, 250);
                assert_eq!(cfg.poll_interval_ms, 5_000);
            },
        );
    }

    #[test]
    fn rejects_zero_poll_interval() {
        with_coordinator_env(&[("RELAY_COORD_POLL_INTERVAL_MS", "0")], || {
            let err = load().expect_err("zero interval");
            assert!(err.to_string().contains("poll_interval_ms"), "{err}");
        });
    }

    #[test]
    fn rejects_non_http_endpoint() {
        with_coordinator_env(&[("RELAY_COORD_SOURCE_ENDPOINTS", "ftp://m1")], || {
            let err = load().expect_err("bad scheme");
            assert!(err.to_string().contains("http or https"), "{err}");
        });
    }
}
