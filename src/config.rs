//! Configuration types for bullet-engine

use crate::data::Frequency;
use crate::error::{EngineError, Result};
use crate::execution::OrderCost;
use crate::telemetry::LogFormat;
use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub run: RunConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Strategy parameter overrides written into `g` after `initialize`
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Run window and account setup
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub data_source: DataSource,
    /// Root under which one directory per run is created
    #[serde(default)]
    pub result_dir: Option<PathBuf>,
    /// Benchmark code; its bars define the trading calendar when set
    #[serde(default)]
    pub benchmark: Option<String>,
    #[serde(default)]
    pub universe: Vec<String>,
    /// Registered strategy name, resolved by the host through a `StrategyRegistry`
    #[serde(default)]
    pub strategy: Option<String>,
}

fn default_initial_cash() -> Decimal {
    Decimal::new(100_000, 0)
}

/// Market data source selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Primary remote vendor
    #[default]
    Primary,
    /// Quotes exported by the local trading terminal
    Terminal,
    /// Alternate remote vendor
    Alternate,
}

/// Exchange session clock times
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_before_open", deserialize_with = "de_clock")]
    pub before_open: NaiveTime,
    #[serde(default = "default_open", deserialize_with = "de_clock")]
    pub open: NaiveTime,
    #[serde(default = "default_close", deserialize_with = "de_clock")]
    pub close: NaiveTime,
    #[serde(default = "default_after_close", deserialize_with = "de_clock")]
    pub after_close: NaiveTime,
    /// Wall-clock tick interval for live runs
    #[serde(default = "default_clock_interval_ms")]
    pub clock_interval_ms: u64,
}

fn default_before_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
}
fn default_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default()
}
fn default_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 0, 0).unwrap_or_default()
}
fn default_after_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default()
}
fn default_clock_interval_ms() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            before_open: default_before_open(),
            open: default_open(),
            close: default_close(),
            after_close: default_after_close(),
            clock_interval_ms: default_clock_interval_ms(),
        }
    }
}

/// Parse "HH:MM" or "HH:MM:SS"
pub(crate) fn parse_clock(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

fn de_clock<'de, D>(deserializer: D) -> std::result::Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_clock(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid clock time '{raw}'")))
}

/// Commission, tax and slippage
#[derive(Debug, Clone, Deserialize)]
pub struct CostConfig {
    #[serde(default = "default_commission")]
    pub open_commission: Decimal,
    #[serde(default = "default_commission")]
    pub close_commission: Decimal,
    #[serde(default = "default_close_tax")]
    pub close_tax: Decimal,
    #[serde(default = "default_min_commission")]
    pub min_commission: Decimal,
    /// Adverse price fraction applied to market fills
    #[serde(default)]
    pub slippage: Decimal,
}

fn default_commission() -> Decimal {
    Decimal::new(3, 4) // 0.0003
}
fn default_close_tax() -> Decimal {
    Decimal::new(1, 3) // 0.001
}
fn default_min_commission() -> Decimal {
    Decimal::new(5, 0)
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            open_commission: default_commission(),
            close_commission: default_commission(),
            close_tax: default_close_tax(),
            min_commission: default_min_commission(),
            slippage: Decimal::ZERO,
        }
    }
}

impl CostConfig {
    /// Zero commission, zero tax, zero slippage
    pub fn free() -> Self {
        Self {
            open_commission: Decimal::ZERO,
            close_commission: Decimal::ZERO,
            close_tax: Decimal::ZERO,
            min_commission: Decimal::ZERO,
            slippage: Decimal::ZERO,
        }
    }

    /// Commission model described by this section
    pub fn order_cost(&self) -> OrderCost {
        OrderCost {
            open_commission: self.open_commission,
            close_commission: self.close_commission,
            close_tax: self.close_tax,
            min_commission: self.min_commission,
        }
    }
}

/// Trading policy switches
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicyConfig {
    /// Allow sells beyond the held quantity
    #[serde(default)]
    pub allow_short: bool,
    /// Maximum fraction of a bar's volume one order may take
    #[serde(default)]
    pub max_volume_ratio: Option<Decimal>,
}

/// Data provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Wrap the provider in the in-memory range cache
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// Directory of terminal-exported CSV files
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,
    /// Calendar days of history loaded ahead of the start date
    #[serde(default = "default_warmup_days")]
    pub warmup_days: u32,
    #[serde(default)]
    pub primary: Option<VendorConfig>,
    #[serde(default)]
    pub alternate: Option<VendorConfig>,
}

fn default_true() -> bool {
    true
}
fn default_csv_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_warmup_days() -> u32 {
    60
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            csv_dir: default_csv_dir(),
            warmup_days: default_warmup_days(),
            primary: None,
            alternate: None,
        }
    }
}

/// Remote data vendor endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API token
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Live broker selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process simulated venue
    #[default]
    Simulator,
    /// Remote trading-service session
    Remote,
}

/// Live broker adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    /// Websocket endpoint for order traffic (remote kind)
    #[serde(default)]
    pub ws_url: Option<String>,
    /// REST endpoint for account snapshots (remote kind)
    #[serde(default)]
    pub http_url: Option<String>,
    /// Name of the environment variable holding the session token
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconcile_timeout_ms")]
    pub reconcile_timeout_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Reconnect attempts before giving up (0 = infinite)
    #[serde(default)]
    pub max_reconnects: u32,
    /// Depth of the order submission queue
    #[serde(default = "default_order_queue")]
    pub order_queue: usize,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_reconcile_timeout_ms() -> u64 {
    5_000
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_order_queue() -> usize {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Simulator,
            ws_url: None,
            http_url: None,
            token_env: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconcile_timeout_ms: default_reconcile_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_reconnects: 0,
            order_queue: default_order_queue(),
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Serve Prometheus metrics on this port when set
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

impl RunConfig {
    /// Run window with default cash, frequency and source
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
            initial_cash: default_initial_cash(),
            frequency: Frequency::Day,
            data_source: DataSource::Primary,
            result_dir: None,
            benchmark: None,
            universe: vec![],
            strategy: None,
        }
    }

    /// Check the session window
    pub fn validate(&self) -> Result<()> {
        if self.start_date > self.end_date {
            return Err(EngineError::InvalidConfig(format!(
                "start date {} is after end date {}",
                self.start_date, self.end_date
            )));
        }
        if self.initial_cash <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "initial cash must be positive".into(),
            ));
        }
        if let Some(dir) = &self.result_dir {
            if dir.as_os_str().is_empty() {
                return Err(EngineError::InvalidConfig("result_dir is empty".into()));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Configuration with default sections around a run window
    pub fn new(run: RunConfig) -> Self {
        Self {
            run,
            session: SessionConfig::default(),
            cost: CostConfig::default(),
            policy: PolicyConfig::default(),
            data: DataConfig::default(),
            broker: BrokerConfig::default(),
            telemetry: TelemetryConfig::default(),
            params: BTreeMap::new(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.run.validate()?;

        let s = &self.session;
        if !(s.before_open <= s.open && s.open < s.close && s.close <= s.after_close) {
            return Err(EngineError::InvalidConfig(
                "session times must satisfy before_open <= open < close <= after_close".into(),
            ));
        }

        let c = &self.cost;
        let rates = [
            c.open_commission,
            c.close_commission,
            c.close_tax,
            c.min_commission,
            c.slippage,
        ];
        if rates.iter().any(|r| r.is_sign_negative()) {
            return Err(EngineError::InvalidConfig(
                "cost settings must be non-negative".into(),
            ));
        }

        if let Some(ratio) = self.policy.max_volume_ratio {
            if ratio <= Decimal::ZERO || ratio > Decimal::ONE {
                return Err(EngineError::InvalidConfig(
                    "max_volume_ratio must be in (0, 1]".into(),
                ));
            }
        }

        let b = &self.broker;
        if b.initial_backoff_ms > b.max_backoff_ms {
            return Err(EngineError::InvalidConfig(
                "initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        if b.order_queue == 0 {
            return Err(EngineError::InvalidConfig("order_queue must be > 0".into()));
        }

        Ok(())
    }
}

/// Opaque secret handed to an adapter at construction.
///
/// The engine never inspects the value; only adapters read it when
/// authenticating.
#[derive(Clone)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Resolve a secret from the named environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        std::env::var(var)
            .map(Self)
            .map_err(|_| EngineError::InvalidConfig(format!("environment variable {var} not set")))
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_config_deserialize_minimal() {
        let toml = r#"
            [run]
            start_date = "2024-01-02"
            end_date = "2024-03-29"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.run.initial_cash, dec!(100000));
        assert_eq!(config.run.frequency, Frequency::Day);
        assert_eq!(config.run.data_source, DataSource::Primary);
        assert_eq!(config.session.open, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(config.cost.min_commission, dec!(5));
        assert!(!config.policy.allow_short);
        assert!(config.data.cache_enabled);
        assert_eq!(config.broker.kind, BrokerKind::Simulator);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialize_full() {
        let toml = r#"
            [run]
            start_date = "2024-01-02"
            end_date = "2024-01-31"
            initial_cash = 500000.0
            frequency = "minute"
            data_source = "terminal"
            result_dir = "./runs"
            benchmark = "000300.XSHG"
            universe = ["600000.XSHG", "000001.XSHE"]
            strategy = "ma_cross"

            [session]
            open = "09:30"
            close = "15:00:00"

            [cost]
            open_commission = 0.0002
            close_commission = 0.0002
            close_tax = 0.001
            min_commission = 0
            slippage = 0.001

            [policy]
            allow_short = true
            max_volume_ratio = 0.25

            [data]
            csv_dir = "/srv/quotes"
            primary = { base_url = "https://vendor.example/api", token_env = "VENDOR_TOKEN" }

            [broker]
            kind = "remote"
            ws_url = "wss://broker.example/ws"
            http_url = "https://broker.example"
            token_env = "BROKER_TOKEN"
            max_reconnects = 5

            [telemetry]
            log_level = "debug"
            log_format = "json"
            metrics_port = 9090

            [params]
            fast = 5
            slow = 20
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.run.frequency, Frequency::Minute);
        assert_eq!(config.run.data_source, DataSource::Terminal);
        assert_eq!(config.run.universe.len(), 2);
        assert_eq!(config.cost.slippage, dec!(0.001));
        assert_eq!(config.policy.max_volume_ratio, Some(dec!(0.25)));
        assert_eq!(
            config.data.primary.as_ref().unwrap().token_env.as_deref(),
            Some("VENDOR_TOKEN")
        );
        assert_eq!(config.broker.kind, BrokerKind::Remote);
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
        assert_eq!(config.telemetry.metrics_port, Some(9090));
        assert_eq!(config.params["slow"], serde_json::json!(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_start_after_end_rejected() {
        let run = RunConfig::new(date(2024, 2, 1), date(2024, 1, 1));
        assert!(matches!(run.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_single_day_window_is_valid() {
        let run = RunConfig::new(date(2024, 1, 2), date(2024, 1, 2));
        assert!(run.validate().is_ok());
    }

    #[test]
    fn test_non_positive_cash_rejected() {
        let mut run = RunConfig::new(date(2024, 1, 2), date(2024, 1, 5));
        run.initial_cash = Decimal::ZERO;
        assert!(run.validate().is_err());
    }

    #[test]
    fn test_invalid_volume_ratio_rejected() {
        let mut config = Config::new(RunConfig::new(date(2024, 1, 2), date(2024, 1, 5)));
        config.policy.max_volume_ratio = Some(dec!(1.5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_clock_time_rejected() {
        let toml = r#"
            [run]
            start_date = "2024-01-02"
            end_date = "2024-01-05"

            [session]
            open = "half past nine"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("10:00"), NaiveTime::from_hms_opt(10, 0, 0));
        assert_eq!(parse_clock("14:55:30"), NaiveTime::from_hms_opt(14, 55, 30));
        assert_eq!(parse_clock("25:00"), None);
    }

    #[test]
    fn test_cost_order_cost() {
        let cost = CostConfig::default().order_cost();
        assert_eq!(cost.open_commission, dec!(0.0003));
        assert_eq!(cost.close_tax, dec!(0.001));
        assert_eq!(CostConfig::free().order_cost().min_commission, Decimal::ZERO);
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = Credentials::new("super-secret");
        assert_eq!(format!("{:?}", creds), "Credentials(***)");
        assert_eq!(creds.expose(), "super-secret");
    }

    #[test]
    fn test_credentials_missing_env() {
        let result = Credentials::from_env("BULLET_ENGINE_TEST_UNSET_VAR");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(result.is_err());
    }
}
