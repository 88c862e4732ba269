// src/config.rs

use crate::error::ConfigValidationError;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Upper bound for `execution.verify_tolerance`.
pub const MAX_VERIFY_TOLERANCE: f64 = 0.1;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StrategyConfig {
    /// |premium| >= prem_entry to open
    pub prem_entry: f64,
    /// |funding| >= fund_entry to open
    pub fund_entry: f64,
    /// |premium| <= prem_exit closes
    pub prem_exit: f64,
    /// |funding| <= fund_exit closes
    pub fund_exit: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            prem_entry: 0.000300,
            fund_entry: 0.000006,
            prem_exit: 0.000200,
            fund_exit: 0.000005,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub horizon_hours: f64,
    pub fee_open: f64,
    pub fee_close: f64,
    /// Запас поверх комиссий на ошибку оценки фандинга
    pub multiplier: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            horizon_hours: 24.0,
            fee_open: 0.00045,
            fee_close: 0.00045,
            multiplier: 1.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RotationConfig {
    /// Allow closing a healthy position to move into a better market.
    pub enabled: bool,
    pub ratio: f64,
    pub abs_delta: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ratio: 1.25,
            abs_delta: 0.000050,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// false = plan only, nothing is sent to the broker
    pub live: bool,
    pub notional_usd: Decimal,
    /// Hard cap for real-money runs
    pub max_notional_usd: Decimal,
    pub spot_quote: String,
    pub cooldown_seconds: u64,
    pub dedup_bucket_ms: i64,
    /// Allowed shortfall of an observed fill against the intended size (0.02 = 2%)
    pub verify_tolerance: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            live: false,
            notional_usd: Decimal::from(100),
            max_notional_usd: Decimal::from(100),
            spot_quote: "USDC".to_string(),
            cooldown_seconds: 120,
            dedup_bucket_ms: 60_000,
            verify_tolerance: 0.02,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FundingMismatchPolicy {
    Warn,
    ForceClose,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FundingCheckConfig {
    pub enabled: bool,
    /// Hyperliquid settles funding hourly
    pub interval_ms: i64,
    pub delay_ms: i64,
    pub policy: FundingMismatchPolicy,
}

impl Default for FundingCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 3_600_000,
            delay_ms: 120_000,
            policy: FundingMismatchPolicy::Warn,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub base_url: String,
    pub timeout_seconds: f64,
    pub retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub jitter: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.hyperliquid.xyz".to_string(),
            timeout_seconds: 6.0,
            retry_attempts: 4,
            backoff_base_ms: 600,
            backoff_cap_ms: 8_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// None = console only
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: Some("logs".to_string()),
            file_prefix: "the_carry.log".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PaperConfig {
    pub quote_balance: Decimal,
    pub spot_borrow: bool,
    pub size_decimals: u32,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            quote_balance: Decimal::from(1_000),
            spot_borrow: false,
            size_decimals: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub coins: Vec<String>,
    pub state_file: String,
    pub poll_seconds: u64,
    pub lookback_hours: u32,
    pub strategy: StrategyConfig,
    pub gate: GateConfig,
    pub rotation: RotationConfig,
    pub execution: ExecutionConfig,
    pub funding_check: FundingCheckConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
    pub paper: PaperConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            coins: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
            state_file: "configs/state.json".to_string(),
            poll_seconds: 10,
            lookback_hours: 24,
            strategy: StrategyConfig::default(),
            gate: GateConfig::default(),
            rotation: RotationConfig::default(),
            execution: ExecutionConfig::default(),
            funding_check: FundingCheckConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

impl AppConfig {
    /// Settings.toml (если есть), затем переменные APP__SECTION__KEY.
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("coins"),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let s = &self.strategy;
        if s.prem_exit >= s.prem_entry {
            return Err(ConfigValidationError::Hysteresis {
                field: "strategy.prem_exit",
                entry: s.prem_entry,
                exit: s.prem_exit,
            });
        }
        if s.fund_exit >= s.fund_entry {
            return Err(ConfigValidationError::Hysteresis {
                field: "strategy.fund_exit",
                entry: s.fund_entry,
                exit: s.fund_exit,
            });
        }
        if s.prem_exit < 0.0 || s.fund_exit < 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "strategy",
                reason: "exit thresholds must be non-negative".to_string(),
            });
        }
        if self.gate.multiplier < 1.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "gate.multiplier",
                reason: format!("{} is below 1.0", self.gate.multiplier),
            });
        }
        if self.gate.horizon_hours <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "gate.horizon_hours",
                reason: "must be positive".to_string(),
            });
        }
        if self.rotation.ratio < 1.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "rotation.ratio",
                reason: format!("{} is below 1.0", self.rotation.ratio),
            });
        }
        let e = &self.execution;
        if e.notional_usd <= Decimal::ZERO {
            return Err(ConfigValidationError::InvalidValue {
                field: "execution.notional_usd",
                reason: "must be positive".to_string(),
            });
        }
        if e.notional_usd > e.max_notional_usd {
            return Err(ConfigValidationError::InvalidValue {
                field: "execution.notional_usd",
                reason: format!("{} exceeds cap {}", e.notional_usd, e.max_notional_usd),
            });
        }
        if !(0.0..=MAX_VERIFY_TOLERANCE).contains(&e.verify_tolerance) {
            return Err(ConfigValidationError::InvalidValue {
                field: "execution.verify_tolerance",
                reason: format!("{} is outside [0, {}]", e.verify_tolerance, MAX_VERIFY_TOLERANCE),
            });
        }
        if e.dedup_bucket_ms <= 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "execution.dedup_bucket_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.funding_check.interval_ms <= 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "funding_check.interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.network.retry_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "network.retry_attempts",
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.coins.is_empty() {
            return Err(ConfigValidationError::InvalidValue {
                field: "coins",
                reason: "no markets to track".to_string(),
            });
        }
        Ok(())
    }
}
