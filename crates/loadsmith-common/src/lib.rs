use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub session: SessionConfig,
    pub pool: PoolConfig,
    pub flood: FloodConfig,
    pub weights: WeightsConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TargetConfig {
    /// `host:port` or a base URL such as `http://host:port`.
    pub address: String,
    pub probe_path: String,
    pub read_endpoints: Vec<String>,
    pub write_endpoints: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8080".to_string(),
            probe_path: "/auth/health".to_string(),
            read_endpoints: vec![
                "/auth/health".to_string(),
                "/api/passwords".to_string(),
                "/api/notes".to_string(),
                "/api/backup/export".to_string(),
            ],
            write_endpoints: vec![
                "/auth/register".to_string(),
                "/auth/login".to_string(),
                "/auth/sync-setup".to_string(),
                "/auth/verify-otp".to_string(),
                "/auth/cloud-login".to_string(),
                "/api/passwords".to_string(),
                "/api/notes".to_string(),
                "/api/backup/import".to_string(),
            ],
        }
    }
}

/// Bounds and pacing of one session.
/// At least one of `duration_secs` / `requests_per_worker` must be set.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub workers: usize,
    pub duration_secs: Option<u64>,
    pub requests_per_worker: Option<u64>,
    /// Jittered pause between strategy slices, `[min, max]` in milliseconds.
    pub slice_pause_ms: (u64, u64),
    /// How long to wait for workers after the running signal clears.
    pub drain_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: 15,
            duration_secs: Some(300),
            requests_per_worker: None,
            slice_pause_ms: (1000, 5000),
            drain_timeout_secs: 10,
        }
    }
}

/// Connection-hold pool tuning.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    /// Desired steady-state number of held connections.
    pub target_size: usize,
    pub connect_timeout_ms: u64,
    /// Interval between header fragments on one slot, `[min, max]` in milliseconds.
    pub fragment_interval_ms: (u64, u64),
    /// How long one hold slice keeps its slots streaming.
    pub hold_window_secs: u64,
    /// Random delay before each connect attempt, `[min, max]` in milliseconds.
    pub replenish_delay_ms: (u64, u64),
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 200,
            connect_timeout_ms: 3000,
            fragment_interval_ms: (5000, 15000),
            hold_window_secs: 60,
            replenish_delay_ms: (100, 300),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FloodConfig {
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_delay_ms: (u64, u64),
    pub write_delay_ms: (u64, u64),
    /// Chance that a read request carries `page`/`size`/`search` query parameters.
    pub query_probability: f64,
    /// Chance that a write body is inflated with bulk data.
    pub bulk_probability: f64,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5000,
            write_timeout_ms: 10000,
            read_delay_ms: (10, 100),
            write_delay_ms: (50, 200),
            query_probability: 0.3,
            bulk_probability: 0.4,
        }
    }
}

/// Initial per-strategy weights; the probe rescales them once per session.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WeightsConfig {
    pub http_flood: f64,
    pub post_flood: f64,
    pub connection_hold: f64,
    pub hybrid: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            http_flood: 0.25,
            post_flood: 0.25,
            connection_hold: 0.25,
            hybrid: 0.25,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus counters on `port`.
    pub enabled: bool,
    pub port: u16,
    /// Directory the final snapshot is written into.
    pub export_path: String,
    pub export_format: ExportFormat,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
            export_path: "metrics".to_string(),
            export_format: ExportFormat::Csv,
        }
    }
}

impl Config {
    pub fn from_yaml_str(data: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.address.trim().is_empty() {
            return Err(invalid("target.address is empty"));
        }
        if self.target.read_endpoints.is_empty() || self.target.write_endpoints.is_empty() {
            return Err(invalid("target endpoint sets must not be empty"));
        }
        if self.session.workers == 0 {
            return Err(invalid("session.workers must be at least 1"));
        }
        if self.session.duration_secs.is_none() && self.session.requests_per_worker.is_none() {
            return Err(invalid(
                "session needs duration_secs or requests_per_worker",
            ));
        }
        check_range("session.slice_pause_ms", self.session.slice_pause_ms)?;
        check_range("pool.fragment_interval_ms", self.pool.fragment_interval_ms)?;
        check_range("pool.replenish_delay_ms", self.pool.replenish_delay_ms)?;
        check_range("flood.read_delay_ms", self.flood.read_delay_ms)?;
        check_range("flood.write_delay_ms", self.flood.write_delay_ms)?;
        for (name, p) in [
            ("flood.query_probability", self.flood.query_probability),
            ("flood.bulk_probability", self.flood.bulk_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(invalid(format!("{} must be within [0, 1]", name)));
            }
        }

        let w = &self.weights;
        let all = [w.http_flood, w.post_flood, w.connection_hold, w.hybrid];
        if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid("weights must be finite and non-negative"));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(invalid("at least one strategy weight must be positive"));
        }
        if w.connection_hold > 0.0 && self.pool.target_size == 0 {
            return Err(invalid(
                "pool.target_size must be positive when connection_hold is weighted",
            ));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn check_range(name: &str, (min, max): (u64, u64)) -> Result<(), ConfigError> {
    if min > max {
        return Err(invalid(format!("{} has min {} above max {}", name, min, max)));
    }
    Ok(())
}
