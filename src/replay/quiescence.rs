//! Quiescence Registry
//!
//! Readiness barrier over a fixed set of units. Every unit that produces
//! work marks itself busy for the duration of one synchronous unit of work;
//! when the last busy unit turns ready, the registered callback fires once.
//!
//! The replay scheduler relies on this to decide whether it may jump the
//! virtual clock: jumping is only safe while nothing is mid-computation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Units whose busy/ready state is tracked. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UnitId {
    /// Strategy analyzer
    Analyzer = 0,
    /// Recorded or live stream forwarder
    StreamForwarder = 1,
    /// Order-book maintainer (diff merge / snapshot provider)
    OrderBookSnapshotProvider = 2,
    /// Matching emulator
    RealMarketEmulator = 3,
    /// Order-plan executor
    OrderPlanManager = 4,
    /// Order manager
    OrderManager = 5,
    /// Event bus transport (events in flight)
    Transport = 6,
}

impl UnitId {
    pub const ALL: [UnitId; 7] = [
        UnitId::Analyzer,
        UnitId::StreamForwarder,
        UnitId::OrderBookSnapshotProvider,
        UnitId::RealMarketEmulator,
        UnitId::OrderPlanManager,
        UnitId::OrderManager,
        UnitId::Transport,
    ];

    #[inline]
    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitId::Analyzer => "analyzer",
            UnitId::StreamForwarder => "stream_forwarder",
            UnitId::OrderBookSnapshotProvider => "order_book_snapshot_provider",
            UnitId::RealMarketEmulator => "real_market_emulator",
            UnitId::OrderPlanManager => "order_plan_manager",
            UnitId::OrderManager => "order_manager",
            UnitId::Transport => "transport",
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of busy units, in unit order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusyUnits(pub Vec<UnitId>);

impl BusyUnits {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, unit: UnitId) -> bool {
        self.0.contains(&unit)
    }
}

impl fmt::Display for BusyUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, unit) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", unit)?;
        }
        write!(f, "]")
    }
}

type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

struct RegistryState {
    busy: u8,
    in_flight: [i64; UnitId::ALL.len()],
    idle_transitions: u64,
    callback: Option<ReadyCallback>,
}

impl RegistryState {
    /// Clear `unit`'s bit, returning the callback to run if that emptied the set.
    fn clear(&mut self, unit: UnitId) -> Option<ReadyCallback> {
        let was_busy = self.busy != 0;
        self.busy &= !unit.bit();
        if was_busy && self.busy == 0 {
            self.idle_transitions += 1;
            self.callback.clone()
        } else {
            None
        }
    }
}

/// Busy bitset, per-unit in-flight counts and a single all-ready callback
/// slot, under one mutex.
///
/// The callback is cloned out and invoked after the lock is released, so it
/// may call back into the registry (including `unsubscribe`) or publish.
pub struct QuiescenceRegistry {
    state: Mutex<RegistryState>,
}

impl QuiescenceRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                busy: 0,
                in_flight: [0; UnitId::ALL.len()],
                idle_transitions: 0,
                callback: None,
            }),
        }
    }

    pub fn set_busy(&self, unit: UnitId) {
        self.state.lock().busy |= unit.bit();
    }

    /// Clear `unit`'s bit. Fires the callback when this call takes the set
    /// from some-busy to all-idle. Clearing an already clear bit is a no-op.
    pub fn set_ready(&self, unit: UnitId) {
        let callback = self.state.lock().clear(unit);
        Self::notify(unit, callback);
    }

    /// Count one more in-flight item for `unit`; the first marks it busy.
    pub fn enter(&self, unit: UnitId) {
        let mut state = self.state.lock();
        let slot = unit as usize;
        state.in_flight[slot] += 1;
        if state.in_flight[slot] == 1 {
            state.busy |= unit.bit();
        }
    }

    /// Count one in-flight item for `unit` as finished; the last marks it ready.
    ///
    /// Aborts the process if the count goes negative.
    pub fn leave(&self, unit: UnitId) {
        let (remaining, callback) = {
            let mut state = self.state.lock();
            let slot = unit as usize;
            state.in_flight[slot] -= 1;
            let remaining = state.in_flight[slot];
            let callback = if remaining == 0 { state.clear(unit) } else { None };
            (remaining, callback)
        };
        if remaining < 0 {
            error!(count = remaining, unit = %unit, "in-flight event count went negative");
            std::process::abort();
        }
        Self::notify(unit, callback);
    }

    /// Items currently in flight for `unit`.
    pub fn in_flight(&self, unit: UnitId) -> i64 {
        self.state.lock().in_flight[unit as usize]
    }

    /// Number of some-busy to all-idle transitions seen so far.
    pub fn idle_transitions(&self) -> u64 {
        self.state.lock().idle_transitions
    }

    fn notify(unit: UnitId, callback: Option<ReadyCallback>) {
        if let Some(cb) = callback {
            debug!(unit = %unit, "all_units_ready");
            cb();
        }
    }

    /// Install the all-ready callback, replacing any previous one.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.lock().callback = Some(Arc::new(callback));
    }

    /// Clear the callback slot. No-op when empty.
    pub fn unsubscribe(&self) {
        self.state.lock().callback = None;
    }

    pub fn has_subscriber(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    pub fn busy_units(&self) -> BusyUnits {
        let busy = self.state.lock().busy;
        BusyUnits(
            UnitId::ALL
                .into_iter()
                .filter(|unit| busy & unit.bit() != 0)
                .collect(),
        )
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().busy == 0
    }

    /// Handle bound to one unit.
    pub fn unit(self: &Arc<Self>, unit: UnitId) -> UnitState {
        UnitState {
            registry: Arc::clone(self),
            unit,
        }
    }

    /// Guard that keeps `unit` busy until dropped.
    pub fn scoped(&self, unit: UnitId) -> BusyGuard<'_> {
        BusyGuard::new(self, unit)
    }

    /// Run `work` with `unit` marked busy; ready is restored on every exit
    /// path, including unwinding.
    pub fn run_busy<R>(&self, unit: UnitId, work: impl FnOnce() -> R) -> R {
        let _guard = self.scoped(unit);
        work()
    }
}

impl Default for QuiescenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QuiescenceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuiescenceRegistry")
            .field("busy", &self.busy_units().to_string())
            .field("subscribed", &self.has_subscriber())
            .finish()
    }
}

// =============================================================================
// UNIT HANDLES
// =============================================================================

/// Busy/ready handle for one unit, cheap to clone and hand to a component.
#[derive(Clone)]
pub struct UnitState {
    registry: Arc<QuiescenceRegistry>,
    unit: UnitId,
}

impl UnitState {
    pub fn id(&self) -> UnitId {
        self.unit
    }

    pub fn set_busy(&self) {
        self.registry.set_busy(self.unit);
    }

    pub fn set_ready(&self) {
        self.registry.set_ready(self.unit);
    }

    pub fn scoped(&self) -> BusyGuard<'_> {
        BusyGuard::new(&self.registry, self.unit)
    }

    pub fn run_busy<R>(&self, work: impl FnOnce() -> R) -> R {
        self.registry.run_busy(self.unit, work)
    }
}

impl fmt::Debug for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UnitState").field(&self.unit).finish()
    }
}

/// Marks a unit busy on creation and ready on drop.
#[must_use = "the unit turns ready as soon as the guard is dropped"]
pub struct BusyGuard<'a> {
    registry: &'a QuiescenceRegistry,
    unit: UnitId,
}

impl<'a> BusyGuard<'a> {
    fn new(registry: &'a QuiescenceRegistry, unit: UnitId) -> Self {
        registry.set_busy(unit);
        Self { registry, unit }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.registry.set_ready(self.unit);
    }
}

// =============================================================================
// IN-FLIGHT COUNTER
// =============================================================================

/// Counts events between enqueue and end of delivery, reporting the first
/// increment as busy and the return to zero as ready.
///
/// The count lives in the registry next to the busy bit, so count changes
/// and busy/ready transitions are applied together under the registry lock.
/// Counters built for the same unit share one count.
pub struct InFlightCounter {
    unit: UnitState,
}

impl InFlightCounter {
    pub fn new(unit: UnitState) -> Self {
        Self { unit }
    }

    pub fn add_one(&self) {
        self.unit.registry.enter(self.unit.unit);
    }

    pub fn remove_one(&self) {
        self.unit.registry.leave(self.unit.unit);
    }

    pub fn in_flight(&self) -> i64 {
        self.unit.registry.in_flight(self.unit.unit)
    }
}

impl fmt::Debug for InFlightCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightCounter")
            .field("unit", &self.unit.id())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
