//! Pipeline supervisor: wires sources, ordering stages, the synchronizer,
//! the dispatch queue, and the worker pool, and manages their lifecycle.
//!
//! Every stage runs on its own thread and communicates only through
//! bounded channels; the handle returned by [`Pipeline::start`] is the one
//! place that can observe and stop the whole arrangement.

use crate::config::{OverflowPolicy, PipelineConfig};
use crate::error::{StartupError, WorkerInitError};
use crate::io::{OutputSink, SourceChannel};
use crate::pipeline::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::ordering::ReorderBuffer;
use crate::pipeline::synchronizer::Synchronizer;
use crate::pipeline::types::{Item, SourceId, SynchronizedTuple, WorkerState};
use crate::pipeline::worker::{self, PredictorFactory};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Poll interval used by stage loops to stay stop-responsive.
const STAGE_POLL: Duration = Duration::from_millis(50);

pub struct Pipeline;

impl Pipeline {
    /// Starts the full pipeline. Initializes every source and the sink
    /// first and fails fast on any connection error; nothing is spawned
    /// until all boundaries are up.
    pub fn start(
        config: PipelineConfig,
        mut sources: Vec<Box<dyn SourceChannel>>,
        sink: Arc<dyn OutputSink>,
        factory: PredictorFactory,
    ) -> Result<PipelineHandle, StartupError> {
        config.validate()?;
        if sources.len() != config.sources.len() {
            return Err(StartupError::Config(crate::error::ConfigError::Invalid(
                format!(
                    "{} sources supplied but {} configured",
                    sources.len(),
                    config.sources.len()
                ),
            )));
        }

        sink.initialize()?;
        for source in &mut sources {
            source.initialize()?;
        }

        let metrics = Arc::new(PipelineMetrics::default());
        let stop = Arc::new(AtomicBool::new(false));
        let pending_gauge = Arc::new(AtomicUsize::new(0));
        let mut threads: Vec<JoinHandle<()>> = Vec::new();

        // Shared inlet feeding the synchronizer from every relay.
        let (inlet_tx, inlet_rx) = channel::bounded::<Item>(config.dispatch_capacity);

        let mut source_ids = Vec::with_capacity(sources.len());
        let mut source_buffers: Vec<(SourceId, Receiver<Item>)> = Vec::new();

        for (source, source_config) in sources.into_iter().zip(config.sources.iter()) {
            let id = source.id();
            source_ids.push(id.clone());

            // The channel's own bounded buffer; `send` blocking on a full
            // buffer is what pushes backpressure into the transport.
            let (buf_tx, buf_rx) = channel::bounded::<Item>(source_config.queue_capacity);
            source_buffers.push((id.clone(), buf_rx.clone()));

            threads.push(spawn_source(source, buf_tx, stop.clone()));
            threads.push(spawn_relay(
                id,
                buf_rx,
                inlet_tx.clone(),
                source_config.buffer_threshold,
                metrics.clone(),
                stop.clone(),
            ));
        }
        drop(inlet_tx);

        let (dispatch_tx, dispatch_rx) =
            channel::bounded::<SynchronizedTuple>(config.dispatch_capacity);
        let dispatch_depth = dispatch_rx.clone();

        threads.push(spawn_synchronizer(
            source_ids,
            &config,
            inlet_rx,
            dispatch_tx,
            metrics.clone(),
            pending_gauge.clone(),
            stop.clone(),
        ));

        let (init_tx, init_rx) = channel::unbounded::<Result<usize, WorkerInitError>>();
        let workers = worker::spawn_pool(
            &config.devices,
            config.num_workers_per_device,
            &dispatch_rx,
            &sink,
            &factory,
            &metrics,
            &stop,
            init_tx,
        );
        drop(dispatch_rx);

        // Every slot reports its one-time setup outcome before consuming.
        let mut init_errors = Vec::new();
        for _ in 0..workers.len() {
            match init_rx.recv() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => init_errors.push(e),
                Err(_) => break,
            }
        }
        if init_errors.len() == workers.len() {
            stop.store(true, Ordering::Relaxed);
            for t in threads {
                let _ = t.join();
            }
            for w in workers {
                let _ = w.join.join();
            }
            return Err(StartupError::NoWorkersAvailable);
        }
        for e in &init_errors {
            tracing::error!(error = %e, "worker slot excluded from pool");
        }

        tracing::info!(
            workers = workers.len() - init_errors.len(),
            devices = config.devices.len(),
            sources = config.sources.len(),
            "pipeline started"
        );

        let mut worker_cells = Vec::with_capacity(workers.len());
        let mut worker_joins = Vec::with_capacity(workers.len());
        for w in workers {
            worker_cells.push(w.state);
            worker_joins.push((w.worker_id, w.join));
        }

        Ok(PipelineHandle {
            stop,
            observer: MetricsObserver {
                metrics,
                pending_gauge,
                source_buffers,
                dispatch_depth,
                worker_cells,
            },
            worker_joins,
            threads,
            init_errors,
        })
    }

    /// Starts the pipeline and runs it according to the service flags:
    /// any non-daemon invocation drains everything and returns the final
    /// snapshot; `daemon_mode` never returns, logging a snapshot
    /// periodically instead.
    pub fn run(
        config: PipelineConfig,
        sources: Vec<Box<dyn SourceChannel>>,
        sink: Arc<dyn OutputSink>,
        factory: PredictorFactory,
    ) -> Result<MetricsSnapshot, StartupError> {
        let run_until_complete = config.run_until_complete;
        let daemon_mode = config.daemon_mode;
        let handle = Self::start(config, sources, sink, factory)?;

        if run_until_complete || !daemon_mode {
            return Ok(handle.wait());
        }

        tracing::info!("daemon mode: pipeline runs until the process is killed");
        loop {
            std::thread::sleep(Duration::from_secs(60));
            let snapshot = handle.metrics();
            tracing::info!(
                results_sent = snapshot.results_sent,
                pending_groups = snapshot.pending_groups,
                dispatch_depth = snapshot.dispatch_depth,
                "pipeline heartbeat"
            );
        }
    }
}

/// Cloneable pull-based accessor over the pipeline's observable state.
/// Decoupled from the hot path: reading it never touches a lock the
/// stages contend on.
#[derive(Clone, Debug)]
pub struct MetricsObserver {
    metrics: Arc<PipelineMetrics>,
    pending_gauge: Arc<AtomicUsize>,
    source_buffers: Vec<(SourceId, Receiver<Item>)>,
    dispatch_depth: Receiver<SynchronizedTuple>,
    worker_cells: Vec<Arc<crate::pipeline::types::WorkerStateCell>>,
}

impl MetricsObserver {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let source_depths: BTreeMap<String, usize> = self
            .source_buffers
            .iter()
            .map(|(id, rx)| (id.as_str().to_string(), rx.len()))
            .collect();
        MetricsSnapshot::collect(
            &self.metrics,
            source_depths,
            self.dispatch_depth.len(),
            self.pending_gauge.load(Ordering::Relaxed),
            self.worker_states(),
        )
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.worker_cells.iter().map(|c| c.get()).collect()
    }
}

/// Live handle over a started pipeline: observability plus stop/drain.
#[derive(Debug)]
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    observer: MetricsObserver,
    worker_joins: Vec<(usize, JoinHandle<()>)>,
    threads: Vec<JoinHandle<()>>,
    init_errors: Vec<WorkerInitError>,
}

impl PipelineHandle {
    /// Point-in-time observability snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.observer.snapshot()
    }

    /// Detached accessor that outlives `stop`/`wait`, for monitor threads.
    pub fn observer(&self) -> MetricsObserver {
        self.observer.clone()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.observer.worker_states()
    }

    /// Worker slots that failed their one-time setup and never joined
    /// the pool.
    pub fn init_errors(&self) -> &[WorkerInitError] {
        &self.init_errors
    }

    /// Signals a graceful stop without waiting for it to finish.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Graceful stop: sources stop accepting input, in-flight groups get
    /// the configured grace period, workers finish their current item,
    /// and every thread is joined.
    pub fn stop(self) -> MetricsSnapshot {
        self.request_stop();
        self.join_all()
    }

    /// Blocks until every source reaches end of stream and every queued
    /// item is processed, then joins all threads. Only meaningful with
    /// finite sources (`run_until_complete` services).
    pub fn wait(self) -> MetricsSnapshot {
        self.join_all()
    }

    fn join_all(mut self) -> MetricsSnapshot {
        for t in std::mem::take(&mut self.threads) {
            if t.join().is_err() {
                tracing::error!("pipeline stage thread panicked");
            }
        }
        for (worker_id, join) in std::mem::take(&mut self.worker_joins) {
            if join.join().is_err() {
                tracing::error!(worker_id, "worker thread panicked");
            }
        }
        self.metrics()
    }
}

/// One thread per Source Channel: blocking receive, forward into the
/// channel's own bounded buffer.
fn spawn_source(
    mut source: Box<dyn SourceChannel>,
    buf_tx: Sender<Item>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let id = source.id();
        tracing::info!(source = %id, "source channel started");
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match source.receive() {
                Ok(Some(item)) => {
                    // Blocks when the buffer is full: backpressure.
                    if buf_tx.send(item).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!(source = %id, "source reached end of stream");
                    break;
                }
                Err(e) => {
                    tracing::error!(source = %id, error = %e, "source receive failed");
                    break;
                }
            }
        }
    })
}

/// One thread per source between its buffer and the synchronizer inlet.
/// Sources configured with a `buffer_threshold` get a reorder window here;
/// the rest are forwarded as-is.
fn spawn_relay(
    id: SourceId,
    buf_rx: Receiver<Item>,
    inlet_tx: Sender<Item>,
    buffer_threshold: Option<usize>,
    metrics: Arc<PipelineMetrics>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reorder = buffer_threshold.map(ReorderBuffer::new);

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match buf_rx.recv_timeout(STAGE_POLL) {
                Ok(item) => {
                    let released = match reorder.as_mut() {
                        Some(rb) => {
                            let before = rb.stats();
                            let released = rb.push(item);
                            let after = rb.stats();
                            PipelineMetrics::add(
                                &metrics.ordering_drops,
                                (after.stale_drops - before.stale_drops)
                                    + (after.duplicate_drops - before.duplicate_drops),
                            );
                            PipelineMetrics::add(
                                &metrics.ordering_forced_advances,
                                after.forced_advances - before.forced_advances,
                            );
                            released
                        }
                        None => vec![item],
                    };
                    for item in released {
                        if inlet_tx.send(item).is_err() {
                            return;
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // End of stream: no more arrivals can fill the gaps,
                    // release whatever the window still holds.
                    if let Some(rb) = reorder.as_mut() {
                        for item in rb.flush() {
                            if inlet_tx.send(item).is_err() {
                                return;
                            }
                        }
                    }
                    tracing::debug!(source = %id, "relay finished");
                    return;
                }
            }
        }
    })
}

fn spawn_synchronizer(
    source_ids: Vec<SourceId>,
    config: &PipelineConfig,
    inlet_rx: Receiver<Item>,
    dispatch_tx: Sender<SynchronizedTuple>,
    metrics: Arc<PipelineMetrics>,
    pending_gauge: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let pending_capacity = config.pending_capacity;
    let group_timeout = config.group_timeout;
    let overflow = config.dispatch_overflow;
    let drain_grace = config.drain_grace;

    std::thread::spawn(move || {
        let mut sync = Synchronizer::new(source_ids, pending_capacity, group_timeout);
        let mut last_sweep = Instant::now();
        let mut stopping_since: Option<Instant> = None;

        loop {
            // Graceful stop: in-flight groups get a grace period to
            // complete before the thread exits.
            if stop.load(Ordering::Relaxed) {
                let since = *stopping_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= drain_grace {
                    break;
                }
            }

            match inlet_rx.recv_timeout(STAGE_POLL) {
                Ok(item) => {
                    let before = sync.stats();
                    if let Some(tuple) = sync.ingest(item) {
                        PipelineMetrics::incr(&metrics.tuples_emitted);
                        if !dispatch(&dispatch_tx, tuple, overflow, &metrics, &stop) {
                            break;
                        }
                    }
                    let after = sync.stats();
                    PipelineMetrics::add(
                        &metrics.sync_drops,
                        after.capacity_evictions - before.capacity_evictions,
                    );
                    PipelineMetrics::add(
                        &metrics.slot_overwrites,
                        after.slot_overwrites - before.slot_overwrites,
                    );
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_sweep.elapsed() >= STAGE_POLL {
                let evicted = sync.sweep_expired(Instant::now());
                PipelineMetrics::add(&metrics.sync_drops, evicted as u64);
                last_sweep = Instant::now();
            }
            pending_gauge.store(sync.pending_len(), Ordering::Relaxed);
        }

        pending_gauge.store(sync.pending_len(), Ordering::Relaxed);
        tracing::info!(
            tuples = sync.stats().tuples_emitted,
            drops = sync.stats().capacity_evictions + sync.stats().timeout_evictions,
            "synchronizer finished"
        );
        // dispatch_tx drops here; idle workers see the disconnect.
    })
}

/// Pushes one tuple into the dispatch queue under the configured overflow
/// policy. Returns false when the queue is gone.
fn dispatch(
    tx: &Sender<SynchronizedTuple>,
    tuple: SynchronizedTuple,
    overflow: OverflowPolicy,
    metrics: &PipelineMetrics,
    stop: &AtomicBool,
) -> bool {
    match overflow {
        OverflowPolicy::DropNewest => match tx.try_send(tuple) {
            Ok(()) => true,
            Err(channel::TrySendError::Full(_)) => {
                PipelineMetrics::incr(&metrics.dispatch_drops);
                true
            }
            Err(channel::TrySendError::Disconnected(_)) => false,
        },
        OverflowPolicy::Block => {
            // Bounded blocking, kept stop-responsive.
            let mut tuple = tuple;
            loop {
                match tx.send_timeout(tuple, STAGE_POLL) {
                    Ok(()) => return true,
                    Err(channel::SendTimeoutError::Timeout(t)) => {
                        if stop.load(Ordering::Relaxed) {
                            return false;
                        }
                        tuple = t;
                    }
                    Err(channel::SendTimeoutError::Disconnected(_)) => return false,
                }
            }
        }
    }
}
