use std::str::FromStr;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// timestamp LEVEL target - message
    #[default]
    Compact,
    /// JSON lines
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" | "jsonl" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".to_string(), format: LogFormat::Compact }
    }
}

const NOISY_TARGETS: &[(&str, &str)] = &[
    ("actix_server", "warn"),
    ("actix_web", "warn"),
    ("wasmtime", "warn"),
    ("cranelift", "warn"),
    ("cranelift_codegen", "warn"),
];

/// Base level plus quieter defaults for chatty dependencies.
fn build_env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let mut directives = vec![level.to_string()];
    for (target, lvl) in NOISY_TARGETS {
        directives.push(format!("{target}={lvl}"));
    }
    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str).map_err(|e| anyhow::anyhow!("invalid tracing filter '{filter_str}': {e}"))
}

/// Install the global subscriber. `RUST_LOG`, when set, replaces the
/// configured level entirely.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_env_filter(&config.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);
    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::debug!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(())
}
