use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use minijinja::{context, Environment, UndefinedBehavior};
use tokio::io::AsyncWriteExt;

use super::model::{ConfigModel, Listener};

pub type DynRenderer = Arc<dyn ConfigRenderer>;

/// Values available while producing the configuration artifact.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub bind_address: &'a str,
    pub listeners: &'a ConfigModel,
}

/// Turns a listener model into the worker's configuration text.
pub trait ConfigRenderer: Send + Sync {
    fn render(&self, ctx: &RenderContext<'_>) -> anyhow::Result<String>;
}

const DEFAULT_PREAMBLE: &str = "\
global
    daemon
    maxconn 4096

defaults
    timeout connect 5s
    timeout client 1m
    timeout server 1m
";

/// Built-in HAProxy renderer: preamble followed by one `listen` section per port.
#[derive(Debug, Clone)]
pub struct HaproxyRenderer {
    preamble_path: Option<PathBuf>,
    mode_label: String,
}

impl HaproxyRenderer {
    pub fn new(preamble_path: Option<PathBuf>, mode_label: impl Into<String>) -> Self {
        Self {
            preamble_path,
            mode_label: mode_label.into(),
        }
    }

    fn preamble(&self) -> anyhow::Result<String> {
        match &self.preamble_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("read haproxy preamble {}", path.display())),
            None => Ok(DEFAULT_PREAMBLE.to_string()),
        }
    }

    fn mode<'a>(&self, listener: &'a Listener) -> &'a str {
        match listener.labels.get(&self.mode_label).map(String::as_str) {
            Some("http") => "http",
            _ => "tcp",
        }
    }
}

impl ConfigRenderer for HaproxyRenderer {
    fn render(&self, ctx: &RenderContext<'_>) -> anyhow::Result<String> {
        let mut out = self.preamble()?;
        if !out.ends_with('\n') {
            out.push('\n');
        }

        for listener in ctx.listeners.values() {
            let name = section_name(&listener.app);
            writeln!(out)?;
            writeln!(out, "listen {name}-{}", listener.port)?;
            writeln!(out, "    bind {}:{}", ctx.bind_address, listener.port)?;
            writeln!(out, "    mode {}", self.mode(listener))?;
            writeln!(out, "    balance roundrobin")?;
            for (idx, server) in listener.servers.iter().enumerate() {
                writeln!(
                    out,
                    "    server {name}-{idx} {}:{} check",
                    server.host, server.port
                )?;
            }
        }
        Ok(out)
    }
}

/// Operator-supplied template rendered against `bind_address` and
/// `listeners` (ordered by port, each with `port`, `app`, `servers` and
/// `labels`). Undefined variables are errors. The `section_name` filter
/// turns an application name into a valid HAProxy section name.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    path: PathBuf,
    source: String,
}

impl TemplateRenderer {
    /// Reads and compiles the template once so syntax errors surface at startup.
    pub fn from_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("read haproxy template {}", path.display()))?;
        let renderer = Self { path, source };
        let env = Self::environment();
        env.template_from_str(&renderer.source)
            .with_context(|| format!("compile haproxy template {}", renderer.path.display()))?;
        Ok(renderer)
    }

    fn environment<'source>() -> Environment<'source> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("section_name", |app: String| section_name(&app));
        env
    }
}

impl ConfigRenderer for TemplateRenderer {
    fn render(&self, ctx: &RenderContext<'_>) -> anyhow::Result<String> {
        let listeners: Vec<&Listener> = ctx.listeners.values().collect();
        Self::environment()
            .render_str(
                &self.source,
                context! {
                    bind_address => ctx.bind_address,
                    listeners => listeners,
                },
            )
            .with_context(|| format!("execute haproxy template {}", self.path.display()))
    }
}

/// HAProxy section names allow only a restricted character set.
fn section_name(app: &str) -> String {
    let name: String = app
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = name.trim_matches('_');
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<target>.next` next to the target, so the final rename stays on one filesystem.
pub fn staging_path(target: &Path) -> PathBuf {
    let mut staging = target.as_os_str().to_owned();
    staging.push(".next");
    PathBuf::from(staging)
}

/// Writes `contents` to the staging path, flushes it and renames it over `target`.
pub async fn install(target: &Path, contents: &str) -> anyhow::Result<()> {
    let staging = staging_path(target);
    let mut file = tokio::fs::File::create(&staging)
        .await
        .with_context(|| format!("create {}", staging.display()))?;
    file.write_all(contents.as_bytes())
        .await
        .with_context(|| format!("write {}", staging.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("sync {}", staging.display()))?;
    drop(file);
    tokio::fs::rename(&staging, target)
        .await
        .with_context(|| format!("rename {} to {}", staging.display(), target.display()))?;
    Ok(())
}
