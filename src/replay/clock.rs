//! Replay Clock
//!
//! Pluggable source of "now" with a blocking wait-until.
//!
//! Two providers exist:
//! - [`SystemTimeProvider`]: wall-clock time, waits sleep for real.
//! - [`VirtualTimeProvider`]: time runs at wall speed from a rebased start
//!   point and can be jumped forward instantly, waking any waiter whose
//!   target has been reached.
//!
//! Components never read the system clock directly; they go through a
//! [`ClockHolder`] so the same code runs live or replayed.

use arc_swap::ArcSwap;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Milliseconds since an arbitrary epoch (Unix epoch for the system provider).
pub type TimePoint = u64;

/// Conversion constants
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Upper bound for one blocking slice inside a wait, unless configured.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(50);

/// How a blocking wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Logical time reached the target.
    Reached,
    /// The cancel flag was observed before the target was reached.
    Cancelled,
}

/// Source of logical time.
pub trait TimeProvider: Send + Sync {
    /// Current logical time.
    fn now(&self) -> TimePoint;

    /// Block until logical time reaches `target` or `cancel` is set.
    ///
    /// The flag is polled at least once per wait slice, so a stop request is
    /// observed promptly even during a long wait.
    fn wait_until_or_cancelled(&self, target: TimePoint, cancel: &AtomicBool) -> WaitOutcome;

    /// Block until logical time reaches `target`.
    fn wait_until(&self, target: TimePoint) {
        let never = AtomicBool::new(false);
        self.wait_until_or_cancelled(target, &never);
    }

    /// Earliest target some thread is blocked on, if the provider tracks
    /// waiters.
    fn earliest_pending(&self) -> Option<TimePoint> {
        None
    }

    /// Provider identifier for logging/diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }
}

// =============================================================================
// ELAPSED TIME METER
// =============================================================================

/// Monotonic wall-time meter.
#[derive(Debug, Clone, Copy)]
pub struct ElapsedTimeMeter {
    start: quanta::Instant,
}

impl ElapsedTimeMeter {
    pub fn new() -> Self {
        Self {
            start: quanta::Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        quanta::Instant::now().duration_since(self.start)
    }

    #[inline]
    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}

impl Default for ElapsedTimeMeter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SYSTEM PROVIDER
// =============================================================================

/// Wall-clock provider. `now()` is Unix epoch milliseconds.
#[derive(Debug, Clone)]
pub struct SystemTimeProvider {
    wait_slice: Duration,
}

impl SystemTimeProvider {
    pub fn new() -> Self {
        Self::with_wait_slice(DEFAULT_WAIT_SLICE)
    }

    pub fn with_wait_slice(wait_slice: Duration) -> Self {
        Self {
            wait_slice: wait_slice.max(Duration::from_millis(1)),
        }
    }
}

impl Default for SystemTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> TimePoint {
        chrono::Utc::now().timestamp_millis().max(0) as TimePoint
    }

    fn wait_until_or_cancelled(&self, target: TimePoint, cancel: &AtomicBool) -> WaitOutcome {
        loop {
            let now = self.now();
            if now >= target {
                return WaitOutcome::Reached;
            }
            if cancel.load(Ordering::Acquire) {
                return WaitOutcome::Cancelled;
            }
            std::thread::sleep(Duration::from_millis(target - now).min(self.wait_slice));
        }
    }

    fn name(&self) -> &str {
        "system"
    }
}

// =============================================================================
// VIRTUAL PROVIDER
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Rebase {
    start: TimePoint,
    meter: ElapsedTimeMeter,
}

impl Rebase {
    fn at(start: TimePoint) -> Self {
        Self {
            start,
            meter: ElapsedTimeMeter::new(),
        }
    }

    #[inline]
    fn now(&self) -> TimePoint {
        self.start + self.meter.elapsed_millis()
    }
}

/// Waiter key: target time, then a unique token so equal targets from
/// different threads are tracked independently.
type WaitKey = (TimePoint, u64);

/// Virtual provider with instantaneous time jumps.
///
/// `now()` is the rebased start time plus the wall time elapsed since the
/// rebase. Every blocked waiter owns a wake channel registered in the
/// pending-wake set; a jump signals exactly the waiters whose target is at
/// or before the new time.
pub struct VirtualTimeProvider {
    base: Mutex<Rebase>,
    pending: Mutex<BTreeMap<WaitKey, Sender<()>>>,
    next_token: AtomicU64,
    wait_slice: Duration,
}

impl VirtualTimeProvider {
    /// Create a provider whose logical time starts at `initial_time`.
    pub fn new(initial_time: TimePoint) -> Self {
        Self::with_wait_slice(initial_time, DEFAULT_WAIT_SLICE)
    }

    pub fn with_wait_slice(initial_time: TimePoint, wait_slice: Duration) -> Self {
        Self {
            base: Mutex::new(Rebase::at(initial_time)),
            pending: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(0),
            wait_slice: wait_slice.max(Duration::from_millis(1)),
        }
    }

    /// Rebase logical time to `ts` and wake every waiter whose target is
    /// now reached. No real time elapses.
    ///
    /// A `ts` at or before `now` leaves the clock where it is; only the
    /// waiters are signalled.
    pub fn jump_to_time(&self, ts: TimePoint) {
        let reached = {
            let mut base = self.base.lock();
            let now = base.now();
            if ts > now {
                *base = Rebase::at(ts);
                ts
            } else {
                now
            }
        };

        let pending = self.pending.lock();
        let mut woken = 0usize;
        for (_, tx) in pending.range(..=(reached, u64::MAX)) {
            // Full means the waiter already has an unread wake-up.
            let _ = tx.try_send(());
            woken += 1;
        }
        debug!(ts, reached, woken, "clock_jump");
    }

    /// Jump to the earliest timestamp any thread is currently waiting for.
    ///
    /// Returns the new time, or `None` (with a warning) when nobody waits.
    pub fn jump_to_first_awaiting_timestamp(&self) -> Option<TimePoint> {
        let first = self.pending.lock().keys().next().map(|(ts, _)| *ts);
        match first {
            Some(ts) => {
                self.jump_to_time(ts);
                Some(ts)
            }
            None => {
                warn!("no awaiting time to jump");
                None
            }
        }
    }

    /// Snapshot of the targets currently waited for, ascending.
    pub fn pending_wakes(&self) -> Vec<TimePoint> {
        self.pending.lock().keys().map(|(ts, _)| *ts).collect()
    }

    /// Block until logical time reaches `target` or `cancel` is set, calling
    /// `on_registered` once `target` is in the pending-wake set.
    ///
    /// The hook can jump the clock on the waiter's behalf without racing the
    /// registration.
    pub fn wait_until_with_hook<F>(
        &self,
        target: TimePoint,
        cancel: &AtomicBool,
        on_registered: F,
    ) -> WaitOutcome
    where
        F: FnOnce(),
    {
        if self.now() >= target {
            return WaitOutcome::Reached;
        }

        let (key, wake) = self.register(target);
        on_registered();
        let outcome = loop {
            let now = self.now();
            if now >= target {
                break WaitOutcome::Reached;
            }
            if cancel.load(Ordering::Acquire) {
                break WaitOutcome::Cancelled;
            }
            let slice = Duration::from_millis(target - now).min(self.wait_slice);
            // Either a jump signalled us or the slice ran out; re-check both.
            let _ = wake.recv_timeout(slice);
        };
        self.pending.lock().remove(&key);
        outcome
    }

    fn register(&self, target: TimePoint) -> (WaitKey, channel::Receiver<()>) {
        let key = (target, self.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = channel::bounded(1);
        self.pending.lock().insert(key, tx);
        (key, rx)
    }
}

impl TimeProvider for VirtualTimeProvider {
    fn now(&self) -> TimePoint {
        self.base.lock().now()
    }

    fn wait_until_or_cancelled(&self, target: TimePoint, cancel: &AtomicBool) -> WaitOutcome {
        self.wait_until_with_hook(target, cancel, || {})
    }

    fn earliest_pending(&self) -> Option<TimePoint> {
        self.pending.lock().keys().next().map(|(ts, _)| *ts)
    }

    fn name(&self) -> &str {
        "virtual"
    }
}

impl fmt::Debug for VirtualTimeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTimeProvider")
            .field("now", &self.now())
            .field("pending", &self.pending_wakes())
            .finish()
    }
}

// =============================================================================
// CLOCK HOLDER
// =============================================================================

/// Indirection over whichever provider is installed.
///
/// Defaults to the system provider; swapping is atomic and callers already
/// blocked in a wait keep using the provider they started with.
pub struct ClockHolder {
    provider: ArcSwap<Arc<dyn TimeProvider>>,
}

impl ClockHolder {
    pub fn new() -> Self {
        Self::with_provider(Arc::new(SystemTimeProvider::new()))
    }

    pub fn with_provider(provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            provider: ArcSwap::from_pointee(provider),
        }
    }

    /// Install a new provider.
    pub fn install(&self, provider: Arc<dyn TimeProvider>) {
        debug!(provider = provider.name(), "clock_provider_installed");
        self.provider.store(Arc::new(provider));
    }

    /// Go back to wall-clock time.
    pub fn reset_to_system(&self) {
        self.install(Arc::new(SystemTimeProvider::new()));
    }

    /// The currently installed provider.
    pub fn current(&self) -> Arc<dyn TimeProvider> {
        let guard = self.provider.load();
        Arc::clone(&**guard)
    }
}

impl Default for ClockHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for ClockHolder {
    fn now(&self) -> TimePoint {
        self.provider.load().now()
    }

    fn wait_until_or_cancelled(&self, target: TimePoint, cancel: &AtomicBool) -> WaitOutcome {
        self.current().wait_until_or_cancelled(target, cancel)
    }

    fn earliest_pending(&self) -> Option<TimePoint> {
        self.provider.load().earliest_pending()
    }

    fn name(&self) -> &str {
        "holder"
    }
}

impl fmt::Debug for ClockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let provider = self.current();
        f.debug_struct("ClockHolder")
            .field("provider", &provider.name())
            .field("now", &provider.now())
            .finish()
    }
}

/// Helper to convert a time point to a chrono DateTime.
#[inline]
pub fn millis_to_datetime(ts: TimePoint) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    chrono::Utc.timestamp_millis_opt(ts as i64).single()
}
