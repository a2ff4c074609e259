use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::convergence::model::LabelPolicy;

pub const ENV_PREFIX: &str = "RELAY_AGENT";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Coordinator addresses (`host:port`), dialed in random order.
    pub coordinators: Vec<String>,
    pub mode: AgentMode,
    pub connect_timeout_ms: u64,
    /// Upper bound of the random pause after every coordinator refused.
    pub reconnect_backoff_max_ms: u64,
    pub metrics_host: String,
    pub metrics_port: u16,
    #[serde(default = "default_serve_metrics")]
    pub serve_metrics: bool,
    #[serde(default)]
    pub haproxy: HaproxyConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub labels: LabelConfig,
}

/// Which configurator receives delivered snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Render and reload a local HAProxy.
    Haproxy,
    /// Print every snapshot to stdout.
    Log,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaproxyConfig {
    pub config_path: String,
    /// Required in haproxy mode.
    #[serde(default)]
    pub pid_file: Option<String>,
    /// Address every generated listener binds to.
    pub bind_address: String,
    /// Optional file holding the `global`/`defaults` sections.
    #[serde(default)]
    pub preamble_path: Option<String>,
    /// Template producing the whole configuration; replaces the built-in
    /// layout and the preamble when set.
    #[serde(default)]
    pub template_path: Option<String>,
    /// How long a superseded HAProxy may drain before SIGTERM.
    pub termination_grace_secs: u64,
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            pid_file: None,
            bind_address: default_bind_address(),
            preamble_path: None,
            template_path: None,
            termination_grace_secs: default_termination_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub binary: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: "haproxy".into(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelConfig {
    /// Apps must carry this label with a truthy value. Empty disables the gate.
    pub enabled_label: String,
    pub port_range_label: String,
    pub mode_label: String,
    pub truthy_values: Vec<String>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            enabled_label: default_enabled_label(),
            port_range_label: default_port_range_label(),
            mode_label: default_mode_label(),
            truthy_values: default_truthy_values(),
        }
    }
}

impl LabelConfig {
    pub fn policy(&self) -> LabelPolicy {
        LabelPolicy::new(
            non_empty(&self.enabled_label),
            non_empty(&self.port_range_label),
            self.truthy_values.clone(),
        )
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl AppConfig {
    pub fn metrics_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.metrics_host, self.metrics_port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.haproxy.termination_grace_secs)
    }

    /// PID file path; only meaningful after [`AppConfig::validate`] in haproxy mode.
    pub fn pid_file(&self) -> anyhow::Result<PathBuf> {
        self.haproxy
            .pid_file
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("haproxy.pid_file is required in haproxy mode"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.coordinators.is_empty() {
            anyhow::bail!("coordinators must list at least one address");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be > 0");
        }
        if self.serve_metrics {
            self.metrics_addr()?;
        }
        if self.mode == AgentMode::Haproxy {
            if self.pid_file().is_err() {
                anyhow::bail!("haproxy.pid_file is required in haproxy mode");
            }
            if self.haproxy.config_path.trim().is_empty() {
                anyhow::bail!("haproxy.config_path cannot be empty");
            }
            if self.haproxy.bind_address.trim().is_empty() {
                anyhow::bail!("haproxy.bind_address cannot be empty");
            }
            if self.worker.binary.trim().is_empty() {
                anyhow::bail!("worker.binary cannot be empty");
            }
        }
        if self.labels.truthy_values.is_empty() {
            anyhow::bail!("labels.truthy_values must not be empty");
        }
        Ok(())
    }
}

fn default_serve_metrics() -> bool {
    true
}

fn default_config_path() -> String {
    "/etc/haproxy/haproxy.cfg".into()
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_termination_grace_secs() -> u64 {
    300
}

fn default_enabled_label() -> String {
    "relay.haproxy.enabled".into()
}

fn default_port_range_label() -> String {
    "relay.haproxy.port_range".into()
}

fn default_mode_label() -> String {
    "relay.haproxy.mode".into()
}

fn default_truthy_values() -> Vec<String> {
    vec!["true".into(), "1".into()]
}

enum EnvKind {
    String,
    List,
}

// (ENV_NAME, config_key, kind)
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    ("RELAY_AGENT_COORDINATORS", "coordinators", EnvKind::List),
    ("RELAY_AGENT_MODE", "mode", EnvKind::String),
    (
        "RELAY_AGENT_CONNECT_TIMEOUT_MS",
        "connect_timeout_ms",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_RECONNECT_BACKOFF_MAX_MS",
        "reconnect_backoff_max_ms",
        EnvKind::String,
    ),
    ("RELAY_AGENT_METRICS_HOST", "metrics_host", EnvKind::String),
    ("RELAY_AGENT_METRICS_PORT", "metrics_port", EnvKind::String),
    ("RELAY_AGENT_SERVE_METRICS", "serve_metrics", EnvKind::String),
    (
        "RELAY_AGENT_HAPROXY_CONFIG_PATH",
        "haproxy.config_path",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_HAPROXY_PID_FILE",
        "haproxy.pid_file",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_HAPROXY_BIND_ADDRESS",
        "haproxy.bind_address",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_HAPROXY_PREAMBLE_PATH",
        "haproxy.preamble_path",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_HAPROXY_TEMPLATE_PATH",
        "haproxy.template_path",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_HAPROXY_TERMINATION_GRACE_SECS",
        "haproxy.termination_grace_secs",
        EnvKind::String,
    ),
    ("RELAY_AGENT_WORKER_BINARY", "worker.binary", EnvKind::String),
    (
        "RELAY_AGENT_WORKER_EXTRA_ARGS",
        "worker.extra_args",
        EnvKind::List,
    ),
    (
        "RELAY_AGENT_LABELS_ENABLED_LABEL",
        "labels.enabled_label",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_LABELS_PORT_RANGE_LABEL",
        "labels.port_range_label",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_LABELS_MODE_LABEL",
        "labels.mode_label",
        EnvKind::String,
    ),
    (
        "RELAY_AGENT_LABELS_TRUTHY_VALUES",
        "labels.truthy_values",
        EnvKind::List,
    ),
];

pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .set_default("coordinators", vec!["127.0.0.1:7676"])?
        .set_default("mode", "haproxy")?
        .set_default("connect_timeout_ms", 3_000)?
        .set_default("reconnect_backoff_max_ms", 10_000)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9191)?
        .set_default("serve_metrics", default_serve_metrics())?
        .set_default("haproxy.config_path", default_config_path())?
        .set_default("haproxy.pid_file", Option::<String>::None)?
        .set_default("haproxy.bind_address", default_bind_address())?
        .set_default("haproxy.preamble_path", Option::<String>::None)?
        .set_default("haproxy.template_path", Option::<String>::None)?
        .set_default(
            "haproxy.termination_grace_secs",
            default_termination_grace_secs(),
        )?
        .set_default("worker.binary", "haproxy")?
        .set_default("worker.extra_args", Vec::<String>::new())?
        .set_default("labels.enabled_label", default_enabled_label())?
        .set_default("labels.port_range_label", default_port_range_label())?
        .set_default("labels.mode_label", default_mode_label())?
        .set_default("labels.truthy_values", default_truthy_values())?;

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
    app.coordinators = app
        .coordinators
        .iter()
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .collect();
    app.haproxy.pid_file = app.haproxy.pid_file.as_deref().and_then(non_empty);
    app.haproxy.preamble_path = app.haproxy.preamble_path.as_deref().and_then(non_empty);
    app.haproxy.template_path = app.haproxy.template_path.as_deref().and_then(non_empty);
    app.validate()?;
    Ok(app)
}
