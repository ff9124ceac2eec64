//! Market Stream Recording
//!
//! Records the market stream to a JSON-lines file and replays it through the
//! stream-source contract.
//!
//! # File Format
//! One [`MarketDataRecord`] per line in `<dir>/market_stream.jsonl`, in the
//! order the events were published.

use crate::replay::bus::{BusError, EventBus, Publisher, SubscriptionHandle};
use crate::replay::clock::TimePoint;
use crate::replay::events::{MarketStreamEvent, MessageQueue, OrderBook, Trade};
use crate::replay::feed::StreamSource;
use crate::replay::quiescence::UnitState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const RECORDING_FILENAME: &str = "market_stream.jsonl";

/// Path of the recording file inside `dir`.
pub fn recording_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(RECORDING_FILENAME)
}

/// One line of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketDataRecord {
    OrderBook(OrderBook),
    Trade(Trade),
}

impl MarketDataRecord {
    pub fn received_timestamp(&self) -> TimePoint {
        match self {
            MarketDataRecord::OrderBook(book) => book.received_timestamp,
            MarketDataRecord::Trade(trade) => trade.received_timestamp,
        }
    }
}

impl From<MarketStreamEvent> for MarketDataRecord {
    fn from(event: MarketStreamEvent) -> Self {
        match event {
            MarketStreamEvent::OrderBookUpdate(book) => MarketDataRecord::OrderBook(book),
            MarketStreamEvent::NewTrade(trade) => MarketDataRecord::Trade(trade),
        }
    }
}

impl From<MarketDataRecord> for MarketStreamEvent {
    fn from(record: MarketDataRecord) -> Self {
        match record {
            MarketDataRecord::OrderBook(book) => MarketStreamEvent::OrderBookUpdate(book),
            MarketDataRecord::Trade(trade) => MarketStreamEvent::NewTrade(trade),
        }
    }
}

/// Errors from reading or writing recordings.
#[derive(Debug)]
pub enum RecordingError {
    Io(io::Error),
    /// A line that is not a valid record (1-based line number).
    Decode { line: usize, message: String },
    Bus(BusError),
}

impl fmt::Display for RecordingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "recording io error: {}", e),
            Self::Decode { line, message } => {
                write!(f, "invalid record at line {}: {}", line, message)
            }
            Self::Bus(e) => write!(f, "recording subscription failed: {}", e),
        }
    }
}

impl std::error::Error for RecordingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Bus(e) => Some(e),
            Self::Decode { .. } => None,
        }
    }
}

impl From<io::Error> for RecordingError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<BusError> for RecordingError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

// =============================================================================
// WRITER
// =============================================================================

/// Appends records to a recording file.
pub struct RecordingWriter {
    out: BufWriter<File>,
    path: PathBuf,
    written: u64,
}

impl RecordingWriter {
    /// Create (truncating) `<dir>/market_stream.jsonl`.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let path = recording_path(dir);
        let file = File::create(&path)?;
        info!(path = %path.display(), "Saving stream to file");
        Ok(Self {
            out: BufWriter::new(file),
            path,
            written: 0,
        })
    }

    pub fn append(&mut self, event: &MarketStreamEvent) -> Result<(), RecordingError> {
        let record = MarketDataRecord::from(event.clone());
        serde_json::to_writer(&mut self.out, &record).map_err(io::Error::from)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RecordingError> {
        self.out.flush()?;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RecordingWriter {
    fn drop(&mut self) {
        if let Err(e) = self.out.flush() {
            error!(path = %self.path.display(), error = %e, "failed to flush recording");
        }
    }
}

/// Bus subscriber that records every market event.
pub struct StreamRecorder {
    writer: Arc<Mutex<RecordingWriter>>,
    handle: SubscriptionHandle<MarketStreamEvent>,
}

impl StreamRecorder {
    pub fn attach(
        bus: &EventBus<MarketStreamEvent>,
        dir: impl AsRef<Path>,
    ) -> Result<Self, RecordingError> {
        let writer = Arc::new(Mutex::new(RecordingWriter::create(dir)?));
        let sink = Arc::clone(&writer);
        let handle = bus.subscribe(move |event: &MarketStreamEvent| {
            let mut writer = sink.lock();
            if let Err(e) = writer.append(event) {
                error!(kind = %event.kind(), error = %e, "failed to record event");
            }
        })?;
        Ok(Self { writer, handle })
    }

    /// Records written so far.
    pub fn written(&self) -> u64 {
        self.writer.lock().written()
    }

    pub fn path(&self) -> PathBuf {
        self.writer.lock().path().to_path_buf()
    }

    pub fn flush(&self) -> Result<(), RecordingError> {
        self.writer.lock().flush()
    }

    pub fn subscription(&self) -> &SubscriptionHandle<MarketStreamEvent> {
        &self.handle
    }
}

impl Drop for StreamRecorder {
    fn drop(&mut self) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.flush() {
            error!(error = %e, "failed to flush recording");
        }
        warn!(path = %writer.path().display(), written = writer.written(), "closing the stream file");
    }
}

// =============================================================================
// RECORDED SOURCE
// =============================================================================

/// Replays a recording through the two-phase stream-source contract.
///
/// `read_next` holds the stream-forwarder unit busy while it reads, so the
/// scheduler never sees the pipeline idle mid-read.
pub struct RecordedStreamSource {
    reader: BufReader<File>,
    line: usize,
    buf: String,
    stashed: Option<MarketDataRecord>,
    publisher: Publisher<MarketStreamEvent>,
    unit: Option<UnitState>,
    name: String,
}

impl RecordedStreamSource {
    pub fn open(
        dir: impl AsRef<Path>,
        publisher: Publisher<MarketStreamEvent>,
        unit: Option<UnitState>,
    ) -> Result<Self, RecordingError> {
        let path = recording_path(dir);
        let file = File::open(&path)?;
        info!(path = %path.display(), "Loading stream from file");
        Ok(Self {
            reader: BufReader::new(file),
            line: 0,
            buf: String::new(),
            stashed: None,
            publisher,
            unit,
            name: path.display().to_string(),
        })
    }

    /// Next non-blank record, or `None` at end of file.
    fn read_record(&mut self) -> Result<Option<MarketDataRecord>, RecordingError> {
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }
            return serde_json::from_str(text)
                .map(Some)
                .map_err(|e| RecordingError::Decode {
                    line: self.line,
                    message: e.to_string(),
                });
        }
    }
}

impl StreamSource for RecordedStreamSource {
    fn read_next(&mut self) -> anyhow::Result<Option<TimePoint>> {
        let unit = self.unit.clone();
        let _busy = unit.as_ref().map(|u| u.scoped());

        match self.read_record()? {
            Some(record) => {
                let ts = record.received_timestamp();
                debug!(line = self.line, ts, "record_read");
                self.stashed = Some(record);
                Ok(Some(ts))
            }
            None => {
                self.stashed = None;
                Ok(None)
            }
        }
    }

    fn forward_next(&mut self) {
        match self.stashed.take() {
            Some(record) => {
                self.publisher.publish(record.into());
            }
            None => warn!(source = %self.name, "nothing to forward. hint: read first"),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// PRINTER
// =============================================================================

/// Bus subscriber that logs every market event.
pub struct StreamPrinter {
    handle: SubscriptionHandle<MarketStreamEvent>,
}

impl StreamPrinter {
    pub fn attach(bus: &EventBus<MarketStreamEvent>) -> Result<Self, BusError> {
        let handle = bus.subscribe(|event: &MarketStreamEvent| match event {
            MarketStreamEvent::OrderBookUpdate(book) => info!(
                ts = book.timestamp,
                received_ts = book.received_timestamp,
                bids = book.bids.len(),
                asks = book.asks.len(),
                best_bid = ?book.best_bid().map(|l| l.price),
                best_ask = ?book.best_ask().map(|l| l.price),
                "order_book"
            ),
            MarketStreamEvent::NewTrade(trade) => info!(
                ts = trade.trade_timestamp,
                received_ts = trade.received_timestamp,
                price = trade.price,
                qty = trade.quantity,
                buyer_maker = trade.is_buyer_maker,
                "trade"
            ),
        })?;
        Ok(Self { handle })
    }

    pub fn printed(&self) -> u64 {
        self.handle.delivered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::events::Level;
    use crate::replay::quiescence::{QuiescenceRegistry, UnitId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn book_at(ts: TimePoint) -> MarketStreamEvent {
        MarketStreamEvent::OrderBookUpdate(OrderBook {
            timestamp: ts - 5,
            received_timestamp: ts,
            bids: vec![Level::new(100.0, 1.0)],
            asks: vec![Level::new(101.0, 2.0)],
        })
    }

    fn trade_at(ts: TimePoint) -> MarketStreamEvent {
        MarketStreamEvent::NewTrade(Trade {
            price: 100.5,
            quantity: 0.25,
            received_timestamp: ts,
            ..Default::default()
        })
    }

    fn collect_into(
        bus: &EventBus<MarketStreamEvent>,
    ) -> (Arc<Mutex<Vec<MarketStreamEvent>>>, SubscriptionHandle<MarketStreamEvent>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = bus
            .subscribe(move |e: &MarketStreamEvent| sink.lock().push(e.clone()))
            .unwrap();
        (seen, handle)
    }

    #[test]
    fn test_recorder_writes_published_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::<MarketStreamEvent>::new();
        let recorder = StreamRecorder::attach(&bus, dir.path()).unwrap();

        bus.publish(book_at(1_000));
        bus.publish(trade_at(1_010));
        bus.shutdown();
        assert_eq!(recorder.written(), 2);
        drop(recorder);

        let contents = std::fs::read_to_string(recording_path(dir.path())).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"kind\":\"order_book\""));
        assert!(lines[1].contains("\"kind\":\"trade\""));
    }

    #[test]
    fn test_recorded_source_replays_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = RecordingWriter::create(dir.path()).unwrap();
            writer.append(&book_at(2_000)).unwrap();
            writer.append(&trade_at(2_500)).unwrap();
        }

        let bus = EventBus::<MarketStreamEvent>::new();
        let (seen, _handle) = collect_into(&bus);
        let mut source = RecordedStreamSource::open(dir.path(), bus.publisher(), None).unwrap();

        assert_eq!(source.read_next().unwrap(), Some(2_000));
        source.forward_next();
        assert_eq!(source.read_next().unwrap(), Some(2_500));
        source.forward_next();
        assert_eq!(source.read_next().unwrap(), None);
        bus.shutdown();

        assert_eq!(*seen.lock(), vec![book_at(2_000), trade_at(2_500)]);
    }

    #[test]
    fn test_forward_without_read_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        RecordingWriter::create(dir.path())
            .unwrap()
            .append(&trade_at(1))
            .unwrap();

        let bus = EventBus::<MarketStreamEvent>::new();
        let (seen, _handle) = collect_into(&bus);
        let mut source = RecordedStreamSource::open(dir.path(), bus.publisher(), None).unwrap();

        source.forward_next();
        assert_eq!(source.read_next().unwrap(), Some(1));
        source.forward_next();
        source.forward_next();
        bus.shutdown();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_decode_error_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let valid = serde_json::to_string(&MarketDataRecord::from(trade_at(7))).unwrap();
        std::fs::write(
            recording_path(dir.path()),
            format!("{}\n\n{{\"kind\":\"nope\"}}\n", valid),
        )
        .unwrap();

        let bus = EventBus::<MarketStreamEvent>::new();
        let mut source = RecordedStreamSource::open(dir.path(), bus.publisher(), None).unwrap();
        assert_eq!(source.read_next().unwrap(), Some(7));

        let err = source.read_next().unwrap_err();
        match err.downcast_ref::<RecordingError>() {
            Some(RecordingError::Decode { line, .. }) => assert_eq!(*line, 3),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_read_brackets_forwarder_unit() {
        let dir = tempfile::tempdir().unwrap();
        RecordingWriter::create(dir.path())
            .unwrap()
            .append(&trade_at(1))
            .unwrap();

        let registry = Arc::new(QuiescenceRegistry::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        registry.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let bus = EventBus::<MarketStreamEvent>::new();
        let mut source = RecordedStreamSource::open(
            dir.path(),
            bus.publisher(),
            Some(registry.unit(UnitId::StreamForwarder)),
        )
        .unwrap();

        source.read_next().unwrap();
        source.read_next().unwrap();
        assert!(registry.is_idle());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_recording_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::<MarketStreamEvent>::new();
        let result = RecordedStreamSource::open(dir.path(), bus.publisher(), None);
        assert!(matches!(result, Err(RecordingError::Io(_))));
    }

    #[test]
    fn test_printer_counts_events() {
        let bus = EventBus::<MarketStreamEvent>::new();
        let printer = StreamPrinter::attach(&bus).unwrap();
        bus.publish(book_at(10));
        bus.publish(trade_at(11));
        bus.shutdown();
        assert_eq!(printer.printed(), 2);
    }
}
