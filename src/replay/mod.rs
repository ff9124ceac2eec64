//! Replay Coordination
//!
//! Runs an asynchronous, multi-threaded market-data pipeline against a
//! recorded stream as fast as possible, while timeout-driven logic
//! downstream still sees believable elapsed time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       ReplayScheduler                           │
//! │  read_next -> jump or wait -> forward_next, until exhausted     │
//! └─────────────────────────────────────────────────────────────────┘
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//! │ StreamSource│        │ ClockHolder │        │ Quiescence  │
//! │ (recording) │        │ (virtual)   │◀───────│ Registry    │
//! └──────┬──────┘        └─────────────┘ all-   └─────────────┘
//!        │ publish               ▲        ready          ▲
//!        ▼                       │                       │ busy/ready
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          EventBus                               │
//! │  one FIFO queue + delivery thread per subscription              │
//! └─────────────────────────────────────────────────────────────────┘
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//!   consumers read time through the clock holder and bracket their
//!   work with busy/ready on the registry
//! ```
//!
//! # Guarantees
//!
//! - **Ordering**: delivery within one subscription is publish order
//! - **Shutdown**: bus shutdown drains every queue before returning
//! - **Time**: the virtual clock never moves backwards; jumps are taken
//!   only after every unit was seen idle, and always land on the earliest
//!   instant some thread is waiting for
//! - **Forwarding**: an event is never forwarded before the clock reaches
//!   its timestamp

pub mod bus;
pub mod clock;
pub mod config;
pub mod context;
pub mod events;
pub mod feed;
pub mod interval_timer;
pub mod quiescence;
pub mod recording;
pub mod scheduler;

pub use bus::{BusError, EventBus, Publisher, SubscriptionHandle};
pub use clock::{
    millis_to_datetime, ClockHolder, ElapsedTimeMeter, SystemTimeProvider, TimePoint,
    TimeProvider, VirtualTimeProvider, WaitOutcome, MILLIS_PER_SEC,
};
pub use config::ReplayConfig;
pub use context::ReplayContext;
pub use events::{
    AnalyzerStreamEvent, Level, MarketStreamEvent, MarketStreamKind, MessageQueue, OrderBook,
    OrderBookStreamEvent, OrderPlanInfo, Trade,
};
pub use feed::{StreamSource, VecStreamSource};
pub use interval_timer::IntervalTimer;
pub use quiescence::{BusyGuard, BusyUnits, InFlightCounter, QuiescenceRegistry, UnitId, UnitState};
pub use recording::{
    MarketDataRecord, RecordedStreamSource, RecordingError, RecordingWriter, StreamPrinter,
    StreamRecorder,
};
pub use scheduler::{ReplayScheduler, ReplayState, ReplayStats, StopHandle};
