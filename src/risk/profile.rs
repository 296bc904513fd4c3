use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// How a strategy's downside is protected once an entry fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossKind {
    /// Server-side stop order placed immediately after the entry fill.
    HardPrice,
    /// Flatten after a maximum holding time (scalper style).
    TimeBased,
    /// Stop follows price in the profitable direction (trend style).
    Trailing,
}

/// Per-strategy risk limits. Strategies that never registered a profile get
/// [`RiskProfile::conservative`], so an unknown strategy can never trade
/// with elevated limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskProfile {
    pub strategy_id: String,
    pub max_leverage: f64,           // Strategy notional / allocated capital cap
    pub max_order_size_usdt: f64,    // Single-order notional cap
    pub single_loss_cap_pct: f64,    // Per-trade loss cap (1% rule)
    pub stop_loss_kind: StopLossKind,
    pub time_limit_seconds: u64,     // 0 = unlimited (only used by TimeBased)
    pub max_daily_loss_pct: f64,     // Daily cumulative loss breaker
}

impl RiskProfile {
    pub fn conservative(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            max_leverage: 10.0,
            max_order_size_usdt: 1_000.0,
            single_loss_cap_pct: 0.01,
            stop_loss_kind: StopLossKind::HardPrice,
            time_limit_seconds: 0,
            max_daily_loss_pct: 0.05,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_leverage <= 0.0 {
            bail!("max_leverage must be positive: {}", self.max_leverage);
        }
        if self.max_order_size_usdt <= 0.0 {
            bail!(
                "max_order_size_usdt must be positive: {}",
                self.max_order_size_usdt
            );
        }
        if self.single_loss_cap_pct <= 0.0 || self.single_loss_cap_pct >= 0.1 {
            bail!(
                "single_loss_cap_pct must be within (0, 10%): {}",
                self.single_loss_cap_pct
            );
        }
        if self.max_daily_loss_pct <= 0.0 || self.max_daily_loss_pct >= 1.0 {
            bail!(
                "max_daily_loss_pct must be within (0, 100%): {}",
                self.max_daily_loss_pct
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservative_profile_is_valid() {
        assert!(RiskProfile::conservative("any").validate().is_ok());
    }

    #[test]
    fn rejects_nonpositive_leverage() {
        let profile = RiskProfile {
            max_leverage: 0.0,
            ..RiskProfile::conservative("scalper")
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn rejects_oversized_loss_cap() {
        let profile = RiskProfile {
            single_loss_cap_pct: 0.2,
            ..RiskProfile::conservative("scalper")
        };
        assert!(profile.validate().is_err());
    }
}
