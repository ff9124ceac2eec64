//! Replay Runner
//!
//! Replays a recorded market stream through the event bus under the
//! virtual clock and prints run statistics as JSON.
//!
//! Usage:
//!   replay_run --recording ./data/session1 [--no-jump] [--print]
//!
//! Environment:
//!   REPLAY_RECORDING - Directory holding market_stream.jsonl
//!   REPLAY_CONFIG_PATH - TOML config (default: replay_config.toml)
//!   REPLAY_NO_JUMP - Wait in real time instead of jumping idle gaps
//!   RUST_LOG - Log filter (default: replay_harness=info)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use replay_harness::replay::{
    MarketStreamEvent, RecordedStreamSource, ReplayConfig, ReplayContext, ReplayScheduler,
    StreamPrinter, UnitId,
};

#[derive(Parser, Debug)]
#[command(name = "replay_run")]
#[command(about = "Replay a recorded market stream under the virtual clock")]
struct Args {
    /// Recording directory
    #[arg(long, env = "REPLAY_RECORDING")]
    recording: PathBuf,

    /// Wait in real time instead of jumping idle gaps
    #[arg(long, env = "REPLAY_NO_JUMP")]
    no_jump: bool,

    /// Config file (overrides REPLAY_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log every replayed event
    #[arg(long)]
    print: bool,

    /// Upper bound on one clock wait slice in milliseconds
    #[arg(long, env = "REPLAY_WAIT_SLICE_MS")]
    wait_slice_ms: Option<u64>,

    /// How long to wait for subscribers to drain after the stream ends (seconds)
    #[arg(long, default_value = "30")]
    drain_timeout_secs: u64,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replay_harness=info,replay_run=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ReplayConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ReplayConfig::from_env(),
    };
    if args.no_jump {
        config.jump_enabled = false;
    }
    if let Some(ms) = args.wait_slice_ms {
        config.wait_slice_ms = ms;
    }

    info!("Starting replay");
    info!("  Recording: {}", args.recording.display());
    info!("  Jump enabled: {}", config.jump_enabled);
    info!("  Wait slice: {}ms", config.wait_slice_ms);

    let ctx = ReplayContext::new(config);
    let bus = ctx.bus::<MarketStreamEvent>();
    let printer = if args.print {
        Some(StreamPrinter::attach(&bus).context("attaching stream printer")?)
    } else {
        None
    };

    let source = RecordedStreamSource::open(
        &args.recording,
        bus.publisher(),
        Some(ctx.unit(UnitId::StreamForwarder)),
    )
    .with_context(|| format!("opening recording in {}", args.recording.display()))?;

    let mut scheduler = ReplayScheduler::new(&ctx, source);
    let stats = scheduler.run().context("replay failed")?;

    if !bus.wait_until_idle(
        Duration::from_secs(args.drain_timeout_secs),
        ctx.config().idle_poll(),
    ) {
        warn!(
            timeout_secs = args.drain_timeout_secs,
            "subscribers still busy after drain timeout"
        );
    }
    bus.shutdown();

    if let Some(printer) = &printer {
        info!(printed = printer.printed(), "stream printer finished");
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("serializing stats")?
    );
    Ok(())
}
