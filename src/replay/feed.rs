//! Stream Sources
//!
//! Two-phase contract between the replay scheduler and whatever holds the
//! recorded events: peek the next timestamp, then forward the peeked event.

use crate::replay::bus::Publisher;
use crate::replay::clock::TimePoint;
use crate::replay::events::MarketStreamEvent;
use tracing::warn;

/// Source of timestamped events driven by the replay scheduler.
pub trait StreamSource: Send {
    /// Peek the next event's logical timestamp without delivering it.
    ///
    /// `Ok(None)` means the stream is exhausted.
    fn read_next(&mut self) -> anyhow::Result<Option<TimePoint>>;

    /// Deliver the event returned by the preceding `read_next`.
    fn forward_next(&mut self);

    /// Source identifier for logging/diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// A source backed by an in-memory vector of market events.
pub struct VecStreamSource {
    events: Vec<(TimePoint, MarketStreamEvent)>,
    index: usize,
    peeked: bool,
    publisher: Publisher<MarketStreamEvent>,
    name: String,
}

impl VecStreamSource {
    pub fn new(
        name: impl Into<String>,
        mut events: Vec<(TimePoint, MarketStreamEvent)>,
        publisher: Publisher<MarketStreamEvent>,
    ) -> Self {
        // Stable sort keeps publish order for equal timestamps
        events.sort_by_key(|(ts, _)| *ts);
        Self {
            events,
            index: 0,
            peeked: false,
            publisher,
            name: name.into(),
        }
    }

    /// Build from events, keyed by their receive timestamp.
    pub fn from_events(
        name: impl Into<String>,
        events: Vec<MarketStreamEvent>,
        publisher: Publisher<MarketStreamEvent>,
    ) -> Self {
        let keyed = events
            .into_iter()
            .map(|e| (e.received_timestamp(), e))
            .collect();
        Self::new(name, keyed, publisher)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.events.len().saturating_sub(self.index)
    }
}

impl StreamSource for VecStreamSource {
    fn read_next(&mut self) -> anyhow::Result<Option<TimePoint>> {
        let next = self.events.get(self.index).map(|(ts, _)| *ts);
        self.peeked = next.is_some();
        Ok(next)
    }

    fn forward_next(&mut self) {
        if !self.peeked {
            warn!(source = %self.name, "nothing to forward");
            return;
        }
        self.peeked = false;
        let (_, event) = self.events[self.index].clone();
        self.index += 1;
        self.publisher.publish(event);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
