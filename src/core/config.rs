use anyhow::{bail, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Global risk parameters. These are hard limits shared by every strategy;
/// per-strategy overrides live in `risk::RiskProfile`.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub risk_per_trade_pct: f64,        // Max loss per trade as fraction of equity
    pub max_global_leverage: f64,       // Total notional / equity hard ceiling
    pub max_drawdown_limit: f64,        // Per-strategy drawdown circuit breaker
    pub min_stop_distance_pct: f64,     // Floor on |entry - stop| as fraction of entry
    pub max_single_symbol_exposure: f64, // Per-symbol notional / equity ceiling
    pub default_stop_loss_pct: f64,     // Fallback stop distance when none is given
    pub warning_leverage_threshold: f64, // Log-only warning level (< global cap)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: 0.01,        // 1% rule
            max_global_leverage: 3.0,        // 3x real leverage
            max_drawdown_limit: 0.15,        // 15%
            min_stop_distance_pct: 0.001,    // 0.1%
            max_single_symbol_exposure: 20.0,
            default_stop_loss_pct: 0.02,     // 2%
            warning_leverage_threshold: 2.0,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.risk_per_trade_pct <= 0.0 || self.risk_per_trade_pct >= 0.1 {
            bail!(
                "risk_per_trade_pct must be within (0, 10%): {}",
                self.risk_per_trade_pct
            );
        }
        if self.max_global_leverage <= 0.0 || self.max_global_leverage >= 20.0 {
            bail!(
                "max_global_leverage must be within (0, 20): {}",
                self.max_global_leverage
            );
        }
        if self.max_drawdown_limit <= 0.0 || self.max_drawdown_limit >= 1.0 {
            bail!(
                "max_drawdown_limit must be within (0, 100%): {}",
                self.max_drawdown_limit
            );
        }
        if self.min_stop_distance_pct <= 0.0 {
            bail!(
                "min_stop_distance_pct must be positive: {}",
                self.min_stop_distance_pct
            );
        }
        if self.warning_leverage_threshold >= self.max_global_leverage {
            bail!(
                "warning_leverage_threshold ({}) must be below max_global_leverage ({})",
                self.warning_leverage_threshold,
                self.max_global_leverage
            );
        }
        Ok(())
    }
}

/// Engine-level tunables. Every safety parameter (retry budgets, backoff
/// schedule, sync thresholds) is configurable rather than baked in.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub total_capital: f64,
    pub symbols: Vec<String>,

    // Pre-trade limits
    pub max_order_amount: f64,
    pub max_order_frequency: usize,
    pub frequency_window_secs: f64,

    // Hard stop-loss protocol
    pub stop_loss_retry_attempts: u32,
    pub stop_loss_retry_delay_ms: u64,

    // Position reconciliation
    pub position_sync_interval_secs: u64,
    pub sync_backoff_base_secs: u64,
    pub sync_backoff_max_secs: u64,
    pub sync_threshold_pct: f64,
    pub sync_cooldown_secs: u64,

    pub event_queue_capacity: usize,
    pub log_level: String,

    pub risk: RiskConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            total_capital: 10_000.0,
            symbols: vec!["BTC-USDT-SWAP".to_string()],
            max_order_amount: 2_000.0,
            max_order_frequency: 5,
            frequency_window_secs: 1.0,
            stop_loss_retry_attempts: 3,
            stop_loss_retry_delay_ms: 500,
            position_sync_interval_secs: 30,
            sync_backoff_base_secs: 1,
            sync_backoff_max_secs: 60,
            sync_threshold_pct: 0.10,
            sync_cooldown_secs: 60,
            event_queue_capacity: 10_000,
            log_level: "info".to_string(),
            risk: RiskConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = EngineConfig::default();
        let risk_defaults = RiskConfig::default();

        let config = EngineConfig {
            total_capital: env_or("TOTAL_CAPITAL", defaults.total_capital),
            symbols: env::var("TRADE_SYMBOLS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.symbols),
            max_order_amount: env_or("MAX_ORDER_AMOUNT", defaults.max_order_amount),
            max_order_frequency: env_or("MAX_ORDER_FREQUENCY", defaults.max_order_frequency),
            frequency_window_secs: env_or("FREQUENCY_WINDOW_SECS", defaults.frequency_window_secs),
            stop_loss_retry_attempts: env_or(
                "STOP_LOSS_RETRY_ATTEMPTS",
                defaults.stop_loss_retry_attempts,
            ),
            stop_loss_retry_delay_ms: env_or(
                "STOP_LOSS_RETRY_DELAY_MS",
                defaults.stop_loss_retry_delay_ms,
            ),
            position_sync_interval_secs: env_or(
                "POSITION_SYNC_INTERVAL",
                defaults.position_sync_interval_secs,
            ),
            sync_backoff_base_secs: env_or("SYNC_BACKOFF_BASE", defaults.sync_backoff_base_secs),
            sync_backoff_max_secs: env_or("SYNC_BACKOFF_MAX", defaults.sync_backoff_max_secs),
            sync_threshold_pct: env_or("SYNC_THRESHOLD_PCT", defaults.sync_threshold_pct),
            sync_cooldown_secs: env_or("SYNC_COOLDOWN_SECS", defaults.sync_cooldown_secs),
            event_queue_capacity: env_or("EVENT_QUEUE_CAPACITY", defaults.event_queue_capacity),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            risk: RiskConfig {
                risk_per_trade_pct: env_or("RISK_PER_TRADE_PCT", risk_defaults.risk_per_trade_pct),
                max_global_leverage: env_or(
                    "MAX_GLOBAL_LEVERAGE",
                    risk_defaults.max_global_leverage,
                ),
                max_drawdown_limit: env_or("MAX_DRAWDOWN_LIMIT", risk_defaults.max_drawdown_limit),
                min_stop_distance_pct: env_or(
                    "MIN_STOP_DISTANCE_PCT",
                    risk_defaults.min_stop_distance_pct,
                ),
                max_single_symbol_exposure: env_or(
                    "MAX_SINGLE_SYMBOL_EXPOSURE",
                    risk_defaults.max_single_symbol_exposure,
                ),
                default_stop_loss_pct: env_or(
                    "DEFAULT_STOP_LOSS_PCT",
                    risk_defaults.default_stop_loss_pct,
                ),
                warning_leverage_threshold: env_or(
                    "WARNING_LEVERAGE_THRESHOLD",
                    risk_defaults.warning_leverage_threshold,
                ),
            },
        };

        config.risk.validate()?;

        Ok(config)
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_risk_config_is_valid() {
        assert!(RiskConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_warning_threshold() {
        let config = RiskConfig {
            warning_leverage_threshold: 5.0,
            max_global_leverage: 3.0,
            ..RiskConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_risk_per_trade() {
        let config = RiskConfig {
            risk_per_trade_pct: 0.5,
            ..RiskConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
