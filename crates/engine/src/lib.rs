pub mod config;
pub mod engine;
pub mod enrich;
pub mod orders;
pub mod positions;

pub use config::EngineConfig;
pub use engine::{EngineError, EngineState, SignalError, TradingEngine};
pub use enrich::{SessionEnricher, SignalEnricher};
pub use orders::{OrderError, OrderManager};
pub use positions::{CloseAllReport, PositionError, PositionManager, SyncReport};
