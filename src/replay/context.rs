//! Run Context
//!
//! One clock holder, one quiescence registry and one transport counter per
//! run, built at the top of the call graph and handed to every component.

use crate::replay::bus::EventBus;
use crate::replay::clock::{ClockHolder, SystemTimeProvider, TimePoint, TimeProvider};
use crate::replay::config::ReplayConfig;
use crate::replay::events::MessageQueue;
use crate::replay::quiescence::{InFlightCounter, QuiescenceRegistry, UnitId, UnitState};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ReplayContext {
    clock: Arc<ClockHolder>,
    units: Arc<QuiescenceRegistry>,
    transport: Arc<InFlightCounter>,
    config: ReplayConfig,
}

impl ReplayContext {
    pub fn new(config: ReplayConfig) -> Self {
        let clock = Arc::new(ClockHolder::with_provider(Arc::new(
            SystemTimeProvider::with_wait_slice(config.wait_slice()),
        )));
        let units = Arc::new(QuiescenceRegistry::new());
        let transport = Arc::new(InFlightCounter::new(units.unit(UnitId::Transport)));
        Self {
            clock,
            units,
            transport,
            config,
        }
    }

    pub fn clock(&self) -> &Arc<ClockHolder> {
        &self.clock
    }

    pub fn units(&self) -> &Arc<QuiescenceRegistry> {
        &self.units
    }

    pub fn unit(&self, unit: UnitId) -> UnitState {
        self.units.unit(unit)
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Events queued or being delivered on any bus built from this context.
    pub fn transport(&self) -> &Arc<InFlightCounter> {
        &self.transport
    }

    #[inline]
    pub fn now(&self) -> TimePoint {
        self.clock.now()
    }

    /// Bus whose in-flight events keep the transport unit busy.
    ///
    /// All buses of one context share the counter, so the transport turns
    /// ready only when every bus is drained.
    pub fn bus<M: MessageQueue>(&self) -> EventBus<M> {
        EventBus::with_in_flight(Arc::clone(&self.transport))
            .with_worker_prefix(&self.config.worker_name_prefix)
    }
}

impl Default for ReplayContext {
    fn default() -> Self {
        Self::new(ReplayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::events::{AnalyzerStreamEvent, MarketStreamEvent, OrderPlanInfo};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_default_context_runs_on_wall_clock() {
        let ctx = ReplayContext::default();
        assert_eq!(ctx.clock().current().name(), "system");
        assert!(ctx.now() > 1_000_000_000_000);
        assert!(ctx.units().is_idle());
    }

    #[test]
    fn test_buses_share_transport_unit() {
        let ctx = ReplayContext::default();
        let market = ctx.bus::<MarketStreamEvent>();
        let analyzer = ctx.bus::<AnalyzerStreamEvent>();

        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let worker_gate = gate.clone();
        analyzer
            .subscribe(move |_: &AnalyzerStreamEvent| {
                let _pass = worker_gate.lock();
            })
            .unwrap();
        market.subscribe(|_: &MarketStreamEvent| {}).unwrap();

        analyzer.publish(AnalyzerStreamEvent::NewOrderPlan(OrderPlanInfo::default()));
        market.publish(MarketStreamEvent::NewTrade(Default::default()));
        assert!(market.wait_until_idle(Duration::from_secs(2), ctx.config().idle_poll()));

        // The market bus is drained but the analyzer event is still held.
        assert!(ctx.units().busy_units().contains(UnitId::Transport));

        drop(held);
        assert!(analyzer.wait_until_idle(Duration::from_secs(2), ctx.config().idle_poll()));
        assert!(ctx.units().is_idle());
    }
    #[test]
    fn test_ready_callback_can_publish_on_context_bus() {
        let ctx = ReplayContext::default();
        let market = ctx.bus::<MarketStreamEvent>();
        let plans = ctx.bus::<AnalyzerStreamEvent>();
        market.subscribe(|_: &MarketStreamEvent| {}).unwrap();
        let planned = plans.subscribe(|_: &AnalyzerStreamEvent| {}).unwrap();

        // Runs on the market worker once its delivery leaves the pipeline idle.
        let publisher = plans.publisher();
        let once = AtomicBool::new(false);
        ctx.units().subscribe(move || {
            if !once.swap(true, Ordering::SeqCst) {
                publisher.publish(AnalyzerStreamEvent::NewOrderPlan(OrderPlanInfo::default()));
            }
        });

        market.publish(MarketStreamEvent::NewTrade(Default::default()));
        assert!(market.wait_until_idle(Duration::from_secs(2), ctx.config().idle_poll()));
        for _ in 0..400 {
            if planned.delivered() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(planned.delivered(), 1);
        assert!(plans.wait_until_idle(Duration::from_secs(2), ctx.config().idle_poll()));
        assert!(ctx.units().is_idle());
        ctx.units().unsubscribe();
    }
}
