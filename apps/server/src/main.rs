//! rivulet Server - standalone headless pipeline runner.
//!
//! Builds a small live pipeline (pattern source -> passthrough -> one or
//! more sinks sharing a reader), runs it on the tokio scheduler and reports
//! pipeline state until a shutdown signal arrives. Useful as a smoke-test
//! deployment and as a reference for embedding the core library.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rivulet_core::filter::builtin::{Collector, CollectorHandle, FrameSource, Passthrough};
use rivulet_core::{
    constants::DEFAULT_ID, Filter, FilterRole, LoggingObserver, PipelineManager, QueueConfig,
    StreamInfo, VideoCodec, VideoStreamInfo,
};
use tokio::signal;

use crate::config::RunnerConfig;

/// rivulet Server - headless streaming pipeline runner.
#[derive(Parser, Debug)]
#[command(name = "rivulet-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "RIVULET_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Stop after this many seconds (0 = run until signalled).
    #[arg(short = 't', long, default_value_t = 0, env = "RIVULET_RUN_SECS")]
    run_secs: u64,

    /// Dump the final pipeline state as JSON on shutdown.
    #[arg(long)]
    dump_state: bool,
}

const SOURCE_ID: u32 = 1;
const PASSTHROUGH_ID: u32 = 2;
const SINK_BASE_ID: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("rivulet Server v{}", env!("CARGO_PKG_VERSION"));

    let config = RunnerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    log::info!(
        "Configuration: pts_step={}us, frame_time={}ms, sinks={}",
        config.pts_step_us,
        config.frame_time_ms,
        config.sinks
    );

    let (manager, sinks) = build_pipeline(&config).context("Failed to build pipeline")?;
    manager.start().context("Failed to start pipeline")?;
    log::info!("Pipeline running");

    let report_interval = Duration::from_secs(config.report_interval_secs.max(1));
    let mut reporter = tokio::time::interval(report_interval);
    reporter.tick().await; // immediate first tick

    let timed_run = args.run_secs > 0;
    let deadline = tokio::time::sleep(if timed_run {
        Duration::from_secs(args.run_secs)
    } else {
        // Never taken: the select arm below is disabled for untimed runs.
        Duration::from_secs(60 * 60 * 24 * 365)
    });
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                log::info!("Shutdown signal received, cleaning up...");
                break;
            }
            _ = &mut deadline, if timed_run => {
                log::info!("Run time elapsed, cleaning up...");
                break;
            }
            _ = reporter.tick() => {
                if config.report_interval_secs > 0 {
                    report(&sinks);
                }
            }
        }
    }

    if args.dump_state {
        println!("{}", serde_json::to_string_pretty(&manager.state())?);
    }

    manager.stop().await.context("Failed to stop pipeline")?;
    log::info!("Shutdown complete");
    Ok(())
}

/// Builds source -> passthrough -> sink(s); extra sinks share the first
/// sink's reader.
fn build_pipeline(config: &RunnerConfig) -> Result<(PipelineManager, Vec<CollectorHandle>)> {
    let manager = PipelineManager::new().with_observer(Arc::new(LoggingObserver));

    let info = StreamInfo::video(VideoStreamInfo {
        codec: VideoCodec::H264,
        pixel_format: None,
        width: 1280,
        height: 720,
        annexb: false,
    });
    let queue_config = QueueConfig::new(config.queue_slots);

    let source_body = FrameSource::new(info.clone(), queue_config)
        .with_pts_step_us(config.pts_step_us)
        .with_payload_len(config.payload_len);
    let source = Filter::new(SOURCE_ID, FilterRole::Server, Box::new(source_body));
    source.set_frame_time(Duration::from_millis(config.frame_time_ms));
    manager.add_filter(source)?;

    manager.add_filter(Filter::new(
        PASSTHROUGH_ID,
        FilterRole::Regular,
        Box::new(Passthrough::new(info, queue_config)),
    ))?;

    let mut handles = Vec::with_capacity(config.sinks);
    for n in 0..config.sinks {
        let (body, handle) = Collector::new(1);
        manager.add_filter(Filter::new(
            SINK_BASE_ID + n as u32,
            FilterRole::Regular,
            Box::new(body),
        ))?;
        handles.push(handle);
    }

    manager.create_path(
        1,
        SOURCE_ID,
        DEFAULT_ID,
        SINK_BASE_ID,
        DEFAULT_ID,
        vec![PASSTHROUGH_ID],
    )?;
    manager.connect_path(1)?;

    // Additional sinks consume the same queue through a shared reader.
    let first_sink = manager
        .filter(SINK_BASE_ID)
        .context("first sink missing")?;
    for n in 1..config.sinks {
        let sink = manager
            .filter(SINK_BASE_ID + n as u32)
            .context("sink missing")?;
        first_sink.share_reader(&sink, DEFAULT_ID, DEFAULT_ID)?;
    }

    Ok((manager, handles))
}

fn report(sinks: &[CollectorHandle]) {
    for (n, sink) in sinks.iter().enumerate() {
        let frames = sink.frames();
        let last_pts = frames.last().map_or(0, |f| f.pts);
        log::info!(
            "[Report] sink {}: {} frames, last pts {} us",
            n,
            frames.len(),
            last_pts
        );
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
