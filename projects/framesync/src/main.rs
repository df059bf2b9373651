mod cli;

use anyhow::{Context, Result};
use cli::Args;
use framesync::{
    EndpointConfig, FnPredictor, InferenceError, Item, MemorySource, NullSink, OverflowPolicy,
    Payload, Pipeline, PipelineConfig, Predictor, PredictorFactory, SourceChannel, SourceConfig,
    SourceId, SynchronizedTuple,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    tracing::info!("starting service with configuration:");
    tracing::info!("  in_video: {}", args.in_video);
    tracing::info!("  in_msg: {:?}", args.in_msg);
    tracing::info!("  out: {}", args.out);
    tracing::info!("  devices: {:?}", args.devices);
    tracing::info!("  num_workers_per_device: {}", args.num_workers_per_device);
    tracing::info!("  run_until_complete: {}", args.run_until_complete);
    tracing::info!("  daemon_mode: {}", args.daemon_mode);

    let video_endpoint =
        EndpointConfig::parse(&args.in_video).context("parsing --in-video")?;
    let msg_endpoints: Vec<EndpointConfig> = args
        .in_msg
        .iter()
        .map(|s| EndpointConfig::parse(s))
        .collect::<Result<_, _>>()
        .context("parsing --in-msg")?;
    let _out_endpoint = EndpointConfig::parse(&args.out).context("parsing --out")?;

    let mut source_configs = vec![SourceConfig::from_endpoint(&video_endpoint)];
    source_configs.extend(msg_endpoints.iter().map(SourceConfig::from_endpoint));

    let config = PipelineConfig {
        sources: source_configs,
        pending_capacity: args.pending_capacity,
        group_timeout: Duration::from_millis(args.group_timeout_ms),
        dispatch_capacity: args.dispatch_capacity,
        dispatch_overflow: if args.drop_on_full {
            OverflowPolicy::DropNewest
        } else {
            OverflowPolicy::Block
        },
        devices: args.devices.clone(),
        num_workers_per_device: args.num_workers_per_device,
        drain_grace: Duration::from_millis(500),
        run_until_complete: args.run_until_complete,
        daemon_mode: args.daemon_mode,
    };

    // Synthetic transports standing in for RTSP/MQTT: the video source
    // emits frames in order, message sources arrive slightly scrambled to
    // exercise any configured reorder window.
    let mut sources: Vec<Box<dyn SourceChannel>> = Vec::new();
    sources.push(Box::new(synthetic_source(
        source_name(&video_endpoint, "video"),
        args.frames,
        false,
    )));
    for (i, endpoint) in msg_endpoints.iter().enumerate() {
        sources.push(Box::new(synthetic_source(
            source_name(endpoint, &format!("msg{i}")),
            args.frames,
            true,
        )));
    }

    let factory: PredictorFactory =
        Arc::new(|_, _| Box::new(FnPredictor(annotate)) as Box<dyn Predictor>);

    let handle = Pipeline::start(config, sources, Arc::new(NullSink), factory)
        .context("pipeline startup failed")?;

    // Monitor thread: one snapshot per second, off the hot path.
    let observer = handle.observer();
    let monitor_done = Arc::new(AtomicBool::new(false));
    let monitor = {
        let done = monitor_done.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                let s = observer.snapshot();
                tracing::info!(
                    tuples = s.tuples_emitted,
                    results = s.results_sent,
                    pending = s.pending_groups,
                    dispatch = s.dispatch_depth,
                    sync_drops = s.sync_drops,
                    ordering_drops = s.ordering_drops,
                    "pipeline status"
                );
                std::thread::sleep(Duration::from_secs(1));
            }
        })
    };

    if args.daemon_mode && !args.run_until_complete {
        tracing::info!("running in daemon mode - service continues in background");
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }

    let summary = handle.wait();
    monitor_done.store(true, Ordering::Relaxed);
    let _ = monitor.join();
    tracing::info!(
        "drain complete: {}",
        serde_json::to_string(&summary).unwrap_or_default()
    );
    Ok(())
}

fn source_name(endpoint: &EndpointConfig, fallback: &str) -> SourceId {
    SourceId::new(endpoint.topic.as_deref().unwrap_or(fallback))
}

/// Builds a finite in-memory source over keys `0..frames`. Scrambled
/// sources swap adjacent pairs so an ordering stage has work to do.
fn synthetic_source(id: SourceId, frames: u64, scrambled: bool) -> MemorySource {
    let mut seqs: Vec<u64> = (0..frames).collect();
    if scrambled {
        for pair in seqs.chunks_mut(2) {
            pair.reverse();
        }
    }
    let items: Vec<Item> = seqs
        .into_iter()
        .map(|seq| Item::new(id.clone(), seq, seq, Arc::new(seq.to_be_bytes().to_vec())))
        .collect();
    MemorySource::new(id, items).with_delay(Duration::from_millis(2))
}

/// Stand-in inference step: concatenates every slot's payload.
fn annotate(tuple: &SynchronizedTuple) -> std::result::Result<Payload, InferenceError> {
    let mut out = Vec::new();
    for item in &tuple.items {
        out.extend_from_slice(&item.payload);
    }
    Ok(Arc::new(out))
}
