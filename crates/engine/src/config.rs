use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use algotrade_core::RETCODE_DONE;

/// Engine configuration: background loop cadence and shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Position reconciliation interval in seconds.
    pub position_sync_interval_secs: u64,
    /// Pending-order check interval in seconds.
    pub pending_check_interval_secs: u64,
    /// Risk metrics recompute interval in seconds.
    pub metrics_interval_secs: u64,
    /// Fixed reconnect retry interval in seconds.
    pub reconnect_interval_secs: u64,
    /// Flatten all positions during `stop()`.
    pub close_positions_on_stop: bool,
    /// Broker retcode that confirms a close request.
    pub close_success_retcode: u32,
    /// Order volume used when a signal suggests none.
    pub default_volume: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            position_sync_interval_secs: 5,
            pending_check_interval_secs: 10,
            metrics_interval_secs: 15,
            reconnect_interval_secs: 5,
            close_positions_on_stop: false,
            close_success_retcode: RETCODE_DONE,
            default_volume: dec!(0.01),
        }
    }
}
