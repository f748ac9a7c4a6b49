//! Grid engine core: ladder construction, per-level lifecycle, order
//! tracking, and the per-account control loop.

pub mod config;
pub mod errors;
pub mod executor;
pub mod ladder;
pub mod level;
pub mod order;
pub mod types;

pub use config::GridExecutorConfig;
pub use errors::{GridError, GridResult};
pub use executor::{ExecutorStatus, GridExecutor};
pub use ladder::{build_ladder, Ladder};
pub use level::{GridLevel, GridLevelState};
pub use order::{OrderStatus, OrderUpdate, RestOrderSnapshot, StreamOrderUpdate, TrackedOrder};
pub use types::{
    Balance, OrderCandidate, OrderType, PlacedOrder, PositionAction, RunnableStatus, TradeType,
    TradingRules,
};
