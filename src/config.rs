use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, Result};

pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";

/// Source tag stamped on every snapshot taken from the Gamma REST poll.
pub const SNAPSHOT_SOURCE: &str = "gamma";

/// Environment variable prefix. Keys follow `POLY_ORACLE_<SECTION>_<KEY>`,
/// e.g. `POLY_ORACLE_MONITOR_SENSITIVITY=0.7`.
pub const ENV_PREFIX: &str = "POLY_ORACLE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub gamma_api_url: String,
    pub monitor: MonitorConfig,
    pub filter: FilterConfig,
    pub store: StoreConfig,
    pub telegram: TelegramConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Cycle cadence in seconds.
    pub poll_interval_secs: u64,
    /// The detection window spans (detection_intervals + 1) poll intervals.
    pub detection_intervals: u64,
    /// Quality-bar knob in [0,1]; min composite score = sensitivity² × 0.05.
    pub sensitivity: f64,
    pub min_abs_change: f64,
    pub min_base_prob: f64,
    /// Normalizes volumes in the log-volume weight.
    pub reference_volume: f64,
    /// Max event groups notified per cycle.
    pub top_k: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// Tag slugs; an event is admitted iff any of its tag slugs matches.
    pub categories: Vec<String>,
    pub min_volume_24hr: f64,
    pub min_volume_1wk: f64,
    pub min_volume_1mo: f64,
    /// true = any volume threshold admits (OR); false = all must hold (AND).
    pub volume_filter_or: bool,
    /// Target number of markets after filtering; the API is asked for 3×.
    pub fetch_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub max_snapshots_per_market: usize,
    pub max_markets: usize,
    /// JSON state file; empty string disables persistence.
    pub persist_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelegramConfig {
    /// Empty token disables the Telegram sink (a no-op sink is used).
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Retry attempts after the first try, for fetch and dispatch alike.
    pub retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            gamma_api_url: GAMMA_API_URL.to_string(),
            monitor: MonitorConfig::default(),
            filter: FilterConfig::default(),
            store: StoreConfig::default(),
            telegram: TelegramConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 900,
            detection_intervals: 4,
            sensitivity: 0.5,
            min_abs_change: 0.03,
            min_base_prob: 0.05,
            reference_volume: 25_000.0,
            top_k: 5,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            min_volume_24hr: 10_000.0,
            min_volume_1wk: 0.0,
            min_volume_1mo: 0.0,
            volume_filter_or: true,
            fetch_limit: 50,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_snapshots_per_market: 96,
            max_markets: 1000,
            persist_path: String::new(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retries: 3,
            backoff_base_ms: 500,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// `(detection_intervals + 1) × poll_interval`. The +1 absorbs per-cycle
    /// processing latency so a snapshot stamped N intervals ago is still
    /// inside the window when detection runs shortly after the tick.
    pub fn detection_window(&self) -> Duration {
        Duration::from_secs((self.detection_intervals + 1) * self.poll_interval_secs)
    }

    /// Quality bar derived from the sensitivity knob.
    pub fn min_score(&self) -> f64 {
        self.sensitivity * self.sensitivity * 0.05
    }
}

impl Config {
    /// Load from a YAML file (or defaults when no path is given), then apply
    /// `POLY_ORACLE_*` environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    AppError::Config(format!("cannot read config file {}: {e}", p.display()))
                })?;
                serde_yaml::from_str(&raw)
                    .map_err(|e| AppError::Config(format!("invalid config file: {e}")))?
            }
            None => Config::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        override_string(&mut self.log_level, "LOG_LEVEL");
        override_string(&mut self.gamma_api_url, "GAMMA_API_URL");

        override_u64(&mut self.monitor.poll_interval_secs, "MONITOR_POLL_INTERVAL_SECS")?;
        override_u64(&mut self.monitor.detection_intervals, "MONITOR_DETECTION_INTERVALS")?;
        override_f64(&mut self.monitor.sensitivity, "MONITOR_SENSITIVITY")?;
        override_f64(&mut self.monitor.min_abs_change, "MONITOR_MIN_ABS_CHANGE")?;
        override_f64(&mut self.monitor.min_base_prob, "MONITOR_MIN_BASE_PROB")?;
        override_f64(&mut self.monitor.reference_volume, "MONITOR_REFERENCE_VOLUME")?;
        override_usize(&mut self.monitor.top_k, "MONITOR_TOP_K")?;

        override_list(&mut self.filter.categories, "FILTER_CATEGORIES");
        override_f64(&mut self.filter.min_volume_24hr, "FILTER_MIN_VOLUME_24HR")?;
        override_f64(&mut self.filter.min_volume_1wk, "FILTER_MIN_VOLUME_1WK")?;
        override_f64(&mut self.filter.min_volume_1mo, "FILTER_MIN_VOLUME_1MO")?;
        override_bool(&mut self.filter.volume_filter_or, "FILTER_VOLUME_FILTER_OR")?;
        override_usize(&mut self.filter.fetch_limit, "FILTER_FETCH_LIMIT")?;

        override_usize(&mut self.store.max_snapshots_per_market, "STORE_MAX_SNAPSHOTS_PER_MARKET")?;
        override_usize(&mut self.store.max_markets, "STORE_MAX_MARKETS")?;
        override_string(&mut self.store.persist_path, "STORE_PERSIST_PATH");

        override_string(&mut self.telegram.bot_token, "TELEGRAM_BOT_TOKEN");
        override_string(&mut self.telegram.chat_id, "TELEGRAM_CHAT_ID");

        override_u64(&mut self.http.timeout_secs, "HTTP_TIMEOUT_SECS")?;
        override_u32(&mut self.http.retries, "HTTP_RETRIES")?;
        override_u64(&mut self.http.backoff_base_ms, "HTTP_BACKOFF_BASE_MS")?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval_secs == 0 {
            return Err(AppError::Config("monitor.poll_interval_secs must be > 0".to_string()));
        }
        if self.monitor.detection_intervals == 0 {
            return Err(AppError::Config("monitor.detection_intervals must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.monitor.sensitivity) {
            return Err(AppError::Config("monitor.sensitivity must be in [0,1]".to_string()));
        }
        if self.monitor.top_k == 0 {
            return Err(AppError::Config("monitor.top_k must be >= 1".to_string()));
        }
        if self.store.max_snapshots_per_market < 2 {
            return Err(AppError::Config(
                "store.max_snapshots_per_market must be >= 2 (detection needs two points)".to_string(),
            ));
        }
        if self.store.max_markets == 0 {
            return Err(AppError::Config("store.max_markets must be >= 1".to_string()));
        }
        if self.filter.fetch_limit == 0 {
            return Err(AppError::Config("filter.fetch_limit must be >= 1".to_string()));
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{key}")).ok()
}

fn override_string(target: &mut String, key: &str) {
    if let Some(v) = env_var(key) {
        *target = v;
    }
}

fn override_list(target: &mut Vec<String>, key: &str) {
    if let Some(v) = env_var(key) {
        *target = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

fn override_f64(target: &mut f64, key: &str) -> Result<()> {
    if let Some(v) = env_var(key) {
        *target = v
            .parse()
            .map_err(|_| AppError::Config(format!("{ENV_PREFIX}_{key} must be a number")))?;
    }
    Ok(())
}

fn override_u64(target: &mut u64, key: &str) -> Result<()> {
    if let Some(v) = env_var(key) {
        *target = v
            .parse()
            .map_err(|_| AppError::Config(format!("{ENV_PREFIX}_{key} must be an integer")))?;
    }
    Ok(())
}

fn override_u32(target: &mut u32, key: &str) -> Result<()> {
    if let Some(v) = env_var(key) {
        *target = v
            .parse()
            .map_err(|_| AppError::Config(format!("{ENV_PREFIX}_{key} must be an integer")))?;
    }
    Ok(())
}

fn override_usize(target: &mut usize, key: &str) -> Result<()> {
    if let Some(v) = env_var(key) {
        *target = v
            .parse()
            .map_err(|_| AppError::Config(format!("{ENV_PREFIX}_{key} must be an integer")))?;
    }
    Ok(())
}

fn override_bool(target: &mut bool, key: &str) -> Result<()> {
    if let Some(v) = env_var(key) {
        *target = match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                return Err(AppError::Config(format!(
                    "{ENV_PREFIX}_{key} must be true or false"
                )))
            }
        };
    }
    Ok(())
}
