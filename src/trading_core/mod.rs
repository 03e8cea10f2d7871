//! Trading Core - per-instrument decision logic and the live loop
//!
//! - Bar aggregation from ticks with absolute bar numbering
//! - Tick-rule volume imbalance
//! - Pivot breakout confirmation state machine and pre-entry filters
//! - Position sizing, exit ladders, trailing and daily risk guards
//! - The trading engine tying it all to an execution venue

pub mod trades;
pub mod bars;
pub mod imbalance;
pub mod indicators;
pub mod market_state;
pub mod levels;
pub mod filters;
pub mod breakout;
pub mod exits;
pub mod position;
pub mod attempts;
pub mod trader;

// Re-export commonly used types
pub use trades::{Side, Tick};
pub use bars::{Bar, BarAggregator, BarSeq, BarWindow, Slot, WindowError};
pub use imbalance::{ImbalanceBias, ImbalanceConfig, ImbalanceSignal, TickRuleClassifier, VolumeImbalance};
pub use market_state::{MarketState, MarketStateConfig};
pub use levels::{Direction, PivotKey, PivotKind, PivotLevel};
pub use filters::{FilterConfig, FilterKind, Rejection};
pub use breakout::{BreakoutConfig, BreakoutMachine, BreakoutState, ConfirmPath, Decision, EntryContext, EntrySignal, Phase};
pub use exits::{LadderConfig, LadderLevel, StuckConfig};
pub use position::{DailyPnL, ExitAction, ExitReason, Position, PositionManager, RiskConfig, StopReason, SyncOutcome, VenueView};
pub use attempts::{AttemptLedger, AttemptRecord};
pub use trader::{Clock, EngineEvent, SessionBook, TradingEngine};
