//! Process configuration (spec.md §6.4): a closed set of named options
//! consumed once at startup, the way `models::Config::from_env` reads them
//! in the teacher repo this crate is descended from.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSizeMode {
    Cap,
    Maximize,
}

#[derive(Debug, Clone)]
pub struct EmergencyConfig {
    pub wait_short_secs: u64,
    pub wait_medium_secs: u64,
    pub wait_long_secs: u64,
    pub fallback_floor: Decimal,
    pub hold_if_winning: bool,
    pub min_profit_cents: Decimal,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            wait_short_secs: 5,
            wait_medium_secs: 8,
            wait_long_secs: 10,
            fallback_floor: dec!(0.01),
            hold_if_winning: true,
            min_profit_cents: dec!(0.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreSettlementConfig {
    pub enable: bool,
    pub min_confidence: f64,
    pub start_sec: i64,
    pub stop_sec: i64,
    pub interval_sec: i64,
}

impl Default for PreSettlementConfig {
    fn default() -> Self {
        Self {
            enable: true,
            min_confidence: 0.80,
            start_sec: 180,
            stop_sec: 45,
            interval_sec: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub wallet_private_key: String,
    pub symbols: Vec<String>,
    pub min_edge: f64,
    pub bet_percent: Decimal,
    pub scaling_factor: f64,
    pub max_size: Decimal,
    pub max_size_mode: MaxSizeMode,
    pub combined_cap: Decimal,
    pub fill_timeout_sec: u64,
    pub poll_interval_sec: u64,
    pub max_post_only_attempts: u32,
    pub pre_settlement: PreSettlementConfig,
    pub emergency: EmergencyConfig,
    pub max_portfolio_exposure: Decimal,
    pub min_order_size: Decimal,
    pub database_path: String,
    pub settle_delay_sec: u64,
    pub crossing_retry_budget: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wallet_private_key: String::new(),
            symbols: vec!["BTC".to_string()],
            min_edge: 0.35,
            bet_percent: dec!(0.05),
            scaling_factor: 1.0,
            max_size: dec!(100),
            max_size_mode: MaxSizeMode::Cap,
            combined_cap: dec!(0.99),
            fill_timeout_sec: 120,
            poll_interval_sec: 5,
            max_post_only_attempts: 3,
            pre_settlement: PreSettlementConfig::default(),
            emergency: EmergencyConfig::default(),
            max_portfolio_exposure: dec!(0.50),
            min_order_size: dec!(5.0),
            database_path: "./trade_engine.db".to_string(),
            settle_delay_sec: 2,
            crossing_retry_budget: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut cfg = Self::default();

        cfg.wallet_private_key = std::env::var("WALLET_PRIVATE_KEY").unwrap_or_default();

        if let Ok(v) = std::env::var("SYMBOLS") {
            cfg.symbols = v.split(',').map(|s| s.trim().to_string()).collect();
        }

        read_f64_env("MIN_EDGE", &mut cfg.min_edge);
        read_decimal_env("BET_PERCENT", &mut cfg.bet_percent)?;
        read_f64_env("SCALING_FACTOR", &mut cfg.scaling_factor);
        read_decimal_env("MAX_SIZE", &mut cfg.max_size)?;

        if let Ok(v) = std::env::var("MAX_SIZE_MODE") {
            cfg.max_size_mode = match v.to_uppercase().as_str() {
                "MAXIMIZE" => MaxSizeMode::Maximize,
                _ => MaxSizeMode::Cap,
            };
        }

        read_decimal_env("COMBINED_CAP", &mut cfg.combined_cap)?;
        read_u64_env("FILL_TIMEOUT_SEC", &mut cfg.fill_timeout_sec);
        read_u64_env("POLL_INTERVAL_SEC", &mut cfg.poll_interval_sec);
        read_u32_env("MAX_POST_ONLY_ATTEMPTS", &mut cfg.max_post_only_attempts);
        read_decimal_env("MAX_PORTFOLIO_EXPOSURE", &mut cfg.max_portfolio_exposure)?;
        read_decimal_env("MIN_ORDER_SIZE", &mut cfg.min_order_size)?;

        if let Ok(v) = std::env::var("DATABASE_PATH") {
            cfg.database_path = v;
        }

        read_bool_env("PRE_SETTLEMENT_ENABLE", &mut cfg.pre_settlement.enable);
        read_f64_env(
            "PRE_SETTLEMENT_MIN_CONFIDENCE",
            &mut cfg.pre_settlement.min_confidence,
        );
        read_i64_env("PRE_SETTLEMENT_START_SEC", &mut cfg.pre_settlement.start_sec);
        read_i64_env("PRE_SETTLEMENT_STOP_SEC", &mut cfg.pre_settlement.stop_sec);
        read_i64_env(
            "PRE_SETTLEMENT_INTERVAL_SEC",
            &mut cfg.pre_settlement.interval_sec,
        );

        read_u64_env("EMERGENCY_WAIT_SHORT", &mut cfg.emergency.wait_short_secs);
        read_u64_env("EMERGENCY_WAIT_MEDIUM", &mut cfg.emergency.wait_medium_secs);
        read_u64_env("EMERGENCY_WAIT_LONG", &mut cfg.emergency.wait_long_secs);
        read_decimal_env("EMERGENCY_FALLBACK_PRICE", &mut cfg.emergency.fallback_floor)?;
        read_bool_env("EMERGENCY_HOLD_IF_WINNING", &mut cfg.emergency.hold_if_winning);
        read_decimal_env(
            "EMERGENCY_MIN_PROFIT_CENTS",
            &mut cfg.emergency.min_profit_cents,
        )?;

        Ok(cfg)
    }
}

fn read_f64_env(key: &str, slot: &mut f64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}

fn read_i64_env(key: &str, slot: &mut i64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}

fn read_u64_env(key: &str, slot: &mut u64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}

fn read_u32_env(key: &str, slot: &mut u32) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}

fn read_bool_env(key: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}

fn read_decimal_env(key: &str, slot: &mut Decimal) -> Result<()> {
    if let Ok(v) = std::env::var(key) {
        *slot = v
            .parse()
            .with_context(|| format!("invalid decimal for {key}: {v}"))?;
    }
    Ok(())
}
