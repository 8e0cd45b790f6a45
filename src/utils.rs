use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::logging::{LogConfig, LogFormat};
use crate::requests_queue::QueueConfig;
use crate::scheduler::PoolConfig;

pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Zero disables local execution.
    pub num_workers: usize,
    pub pin_cores: bool,
    pub job_ttl_secs: u64,
    pub max_queue_size: usize,
    pub max_execution_secs: u64,
    pub cleanup_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub engine_module: PathBuf,
    pub engine_entry_point: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Problems met while loading, reported once logging is up.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            num_workers: 2,
            pin_cores: false,
            job_ttl_secs: 3600,
            max_queue_size: 100,
            max_execution_secs: 300,
            cleanup_interval_secs: 60,
            shutdown_grace_secs: 30,
            engine_module: PathBuf::from("wasm-modules/engine.wasm"),
            engine_entry_point: "process".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            warnings: Vec::new(),
        }
    }
}

/// Load `config.yaml` from the working directory, then apply environment
/// overrides (`.env` is read first). Never fails: anything unusable falls
/// back to its default and leaves a note in `warnings`.
pub fn load_config() -> Config {
    let dotenv_warning = match dotenvy::dotenv() {
        Err(e) if !e.not_found() => Some(format!("failed to read .env: {e}")),
        _ => None,
    };
    let mut config = load_config_from(Path::new(CONFIG_FILE), |key| std::env::var(key).ok());
    config.warnings.extend(dotenv_warning);
    config
}

pub fn load_config_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Config {
    let mut config = match std::fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<Config>(&content) {
            Ok(config) => config,
            Err(e) => Config {
                warnings: vec![format!("failed to parse {}: {e}, using defaults", path.display())],
                ..Config::default()
            },
        },
        Err(_) => Config::default(),
    };
    config.apply_env(env);
    config
}

impl Config {
    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let mut warnings = Vec::new();
        let var = |key: &str| -> Option<String> { env(key).filter(|v| !v.trim().is_empty()) };

        if let Some(host) = var("JOB_DISPATCH_HOST") {
            self.host = host;
        }
        override_parsed(&mut self.port, "JOB_DISPATCH_PORT", var("JOB_DISPATCH_PORT"), &mut warnings);
        override_parsed(&mut self.num_workers, "MAX_WORKERS", var("MAX_WORKERS"), &mut warnings);
        override_parsed(&mut self.pin_cores, "PIN_CORES", var("PIN_CORES"), &mut warnings);
        override_parsed(&mut self.job_ttl_secs, "JOB_TTL_SECS", var("JOB_TTL_SECS"), &mut warnings);
        override_parsed(&mut self.max_queue_size, "MAX_QUEUE_SIZE", var("MAX_QUEUE_SIZE"), &mut warnings);
        override_parsed(&mut self.max_execution_secs, "MAX_EXECUTION_SECS", var("MAX_EXECUTION_SECS"), &mut warnings);
        override_parsed(
            &mut self.cleanup_interval_secs,
            "CLEANUP_INTERVAL_SECS",
            var("CLEANUP_INTERVAL_SECS"),
            &mut warnings,
        );
        override_parsed(&mut self.shutdown_grace_secs, "SHUTDOWN_GRACE_SECS", var("SHUTDOWN_GRACE_SECS"), &mut warnings);
        if let Some(module) = var("ENGINE_MODULE") {
            self.engine_module = PathBuf::from(module);
        }
        if let Some(entry_point) = var("ENGINE_ENTRY_POINT") {
            self.engine_entry_point = entry_point;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        override_parsed(&mut self.log_format, "LOG_FORMAT", var("LOG_FORMAT"), &mut warnings);

        if self.cleanup_interval_secs == 0 {
            warnings.push("cleanup_interval_secs must be positive, using 60".to_string());
            self.cleanup_interval_secs = 60;
        }
        self.warnings.append(&mut warnings);
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.num_workers,
            max_queue_size: self.max_queue_size,
            job_ttl: Duration::from_secs(self.job_ttl_secs),
            max_execution_time: Duration::from_secs(self.max_execution_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            ..QueueConfig::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.num_workers,
            pin_cores: self.pin_cores,
            shutdown_grace: self.shutdown_grace(),
            queue: self.queue_config(),
            ..PoolConfig::default()
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig { level: self.log_level.clone(), format: self.log_format }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn bind_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

fn override_parsed<T>(field: &mut T, key: &str, value: Option<String>, warnings: &mut Vec<String>)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = value else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *field = parsed,
        Err(e) => warnings.push(format!("ignoring {key}={raw}: {e}")),
    }
}
