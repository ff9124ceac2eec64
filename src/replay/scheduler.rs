//! Replay Scheduler
//!
//! Drives a recorded stream onto the bus while coordinating the virtual
//! clock with quiescence.
//!
//! # Per-event cycle
//! `Reading -> AdvancingClock -> Forwarding -> (Reading | Stopped)`
//!
//! 1. Peek the next event's timestamp; exhaustion stops the run.
//! 2. First event only: install a virtual clock seeded at its timestamp.
//! 3. Wait on the clock for the event's timestamp. With jumping enabled and
//!    every unit idle once that wait is registered, jump to the earliest
//!    pending wake. Otherwise the all-ready callback does the jumping. Jumps
//!    always go to the earliest pending wake, so consumer timeouts due before
//!    the event fire first and at their own instant.
//! 4. Units still busy at forward time are logged, not waited for: some
//!    units only turn idle once they receive the next event.
//! 5. Forward the event.
//!
//! The scheduler also installs the registry's all-ready callback, which
//! jumps the clock to the earliest pending wake so idle gaps are skipped
//! instead of slept through.

use crate::replay::clock::{
    ElapsedTimeMeter, TimePoint, TimeProvider, VirtualTimeProvider, WaitOutcome,
};
use crate::replay::context::ReplayContext;
use crate::replay::feed::StreamSource;
use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type ClockSlot = Arc<Mutex<Option<Arc<VirtualTimeProvider>>>>;

/// Scheduler state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Reading,
    AdvancingClock,
    Forwarding,
    Stopped,
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayState::Reading => write!(f, "reading"),
            ReplayState::AdvancingClock => write!(f, "advancing_clock"),
            ReplayState::Forwarding => write!(f, "forwarding"),
            ReplayState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub events_forwarded: u64,
    /// Instant clock jumps taken while the pipeline was idle
    pub clock_jumps: u64,
    /// Events that needed a real-time wait because some unit was busy
    pub real_waits: u64,
    /// Events forwarded while some unit was still busy
    pub busy_forwards: u64,
    pub first_event_ts: Option<TimePoint>,
    pub last_event_ts: Option<TimePoint>,
    pub wall_elapsed_ms: u64,
    pub stopped_early: bool,
}

/// Cooperative stop request, observable within one wait slice.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct ReplayScheduler<S: StreamSource> {
    source: S,
    ctx: ReplayContext,
    jump_enabled: bool,
    clock: ClockSlot,
    stop: Arc<AtomicBool>,
    state: ReplayState,
    stats: ReplayStats,
}

impl<S: StreamSource> ReplayScheduler<S> {
    /// Scheduler with jumping taken from the context's configuration.
    pub fn new(ctx: &ReplayContext, source: S) -> Self {
        Self::with_jump(ctx, source, ctx.config().jump_enabled)
    }

    /// Scheduler with explicit jump mode. Subscribes the all-ready callback.
    pub fn with_jump(ctx: &ReplayContext, source: S, jump_enabled: bool) -> Self {
        let clock: ClockSlot = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&clock);
        ctx.units()
            .subscribe(move || on_all_units_ready(jump_enabled, &slot));

        Self {
            source,
            ctx: ctx.clone(),
            jump_enabled,
            clock,
            stop: Arc::new(AtomicBool::new(false)),
            state: ReplayState::Reading,
            stats: ReplayStats::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// The virtual clock installed by this run, once the first event is read.
    pub fn virtual_clock(&self) -> Option<Arc<VirtualTimeProvider>> {
        self.clock.lock().clone()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Replay until the source is exhausted, a read fails, or stop is
    /// requested.
    pub fn run(&mut self) -> anyhow::Result<ReplayStats> {
        let meter = ElapsedTimeMeter::new();
        info!(
            source = self.source.name(),
            jump_enabled = self.jump_enabled,
            "replay_started"
        );

        let result = self.run_loop();
        self.state = ReplayState::Stopped;
        self.stats.wall_elapsed_ms = meter.elapsed_millis();

        match result {
            Ok(()) => {
                info!(
                    events = self.stats.events_forwarded,
                    clock_jumps = self.stats.clock_jumps,
                    real_waits = self.stats.real_waits,
                    busy_forwards = self.stats.busy_forwards,
                    wall_ms = self.stats.wall_elapsed_ms,
                    stopped_early = self.stats.stopped_early,
                    "replay_finished"
                );
                Ok(self.stats.clone())
            }
            Err(e) => {
                error!(
                    error = %e,
                    events = self.stats.events_forwarded,
                    "replay_failed"
                );
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> anyhow::Result<()> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                self.stats.stopped_early = true;
                return Ok(());
            }

            self.state = ReplayState::Reading;
            let Some(ts) = self.source.read_next().context("reading next event")? else {
                debug!("stream_exhausted");
                return Ok(());
            };

            let clock = self.clock_for(ts);

            self.state = ReplayState::AdvancingClock;
            if !self.advance_clock(&clock, ts) {
                self.stats.stopped_early = true;
                return Ok(());
            }

            self.state = ReplayState::Forwarding;
            let busy = self.ctx.units().busy_units();
            if !busy.is_empty() {
                warn!(busy_units = %busy, ts, "forwarding event while some of units is not ready");
                self.stats.busy_forwards += 1;
            }
            self.source.forward_next();

            self.stats.events_forwarded += 1;
            self.stats.first_event_ts.get_or_insert(ts);
            self.stats.last_event_ts = Some(ts);
        }
    }

    fn clock_for(&self, ts: TimePoint) -> Arc<VirtualTimeProvider> {
        let mut slot = self.clock.lock();
        if let Some(clock) = slot.as_ref() {
            return Arc::clone(clock);
        }
        let clock = Arc::new(VirtualTimeProvider::with_wait_slice(
            ts,
            self.ctx.config().wait_slice(),
        ));
        self.ctx.clock().install(clock.clone());
        info!(start_ts = ts, "virtual_clock_installed");
        *slot = Some(Arc::clone(&clock));
        clock
    }

    /// Bring the clock to `ts`. Returns false if stopped first.
    ///
    /// An event at or before `now` is forwarded without touching the clock.
    /// Otherwise `ts` itself is registered as a pending wake and jumps only
    /// ever go to the earliest pending wake, so waiters are released in
    /// timestamp order.
    fn advance_clock(&mut self, clock: &VirtualTimeProvider, ts: TimePoint) -> bool {
        if clock.now() >= ts {
            return true;
        }
        let units = Arc::clone(self.ctx.units());
        if self.jump_enabled && units.is_idle() {
            self.stats.clock_jumps += 1;
        } else {
            self.stats.real_waits += 1;
            debug!(ts, busy_units = %units.busy_units(), "waiting_for_clock");
        }

        let jump_enabled = self.jump_enabled;
        // A ready transition that landed before `ts` was registered found
        // nothing to jump to, so re-check once it is.
        let outcome = clock.wait_until_with_hook(ts, &self.stop, || {
            if jump_enabled && units.is_idle() {
                clock.jump_to_first_awaiting_timestamp();
            }
        });
        outcome == WaitOutcome::Reached
    }
}

impl<S: StreamSource> Drop for ReplayScheduler<S> {
    fn drop(&mut self) {
        self.ctx.units().unsubscribe();
    }
}

impl<S: StreamSource> fmt::Debug for ReplayScheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayScheduler")
            .field("source", &self.source.name())
            .field("jump_enabled", &self.jump_enabled)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

/// All-ready callback: skip straight to the earliest instant anyone waits for.
fn on_all_units_ready(jump_enabled: bool, slot: &Mutex<Option<Arc<VirtualTimeProvider>>>) {
    if !jump_enabled {
        return;
    }
    let clock = slot.lock().clone();
    if let Some(clock) = clock {
        if clock.earliest_pending().is_some() {
            clock.jump_to_first_awaiting_timestamp();
        }
    }
}
