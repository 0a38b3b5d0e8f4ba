use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configurable risk limits.
///
/// `notional_per_lot` and `point_value` are placeholder heuristics for
/// instruments without supplied contract specifications; they deliberately do
/// not model per-symbol pip values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Maximum concurrently open positions.
    pub max_positions: usize,
    /// Maximum daily loss as a fraction of balance.
    pub max_daily_loss: Decimal,
    /// Maximum total exposure as a fraction of balance.
    pub max_exposure: Decimal,
    /// Maximum risk per trade as a fraction of balance.
    pub max_risk_per_trade: Decimal,
    /// Exposure contributed by one lot of volume.
    pub notional_per_lot: Decimal,
    /// Per-contract-unit risk used for the per-trade check.
    pub point_value: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_positions: 10,
            max_daily_loss: dec!(0.05),
            max_exposure: dec!(0.30),
            max_risk_per_trade: dec!(0.02),
            notional_per_lot: dec!(10),
            point_value: dec!(0.0001),
        }
    }
}

impl RiskLimits {
    /// Tighter limits for small or evaluation accounts.
    pub fn conservative() -> Self {
        Self {
            max_positions: 3,
            max_daily_loss: dec!(0.02),
            max_exposure: dec!(0.10),
            max_risk_per_trade: dec!(0.01),
            ..Self::default()
        }
    }
}
