//! Worker slots: initialize-once / infer-many replicas of the inference
//! step, all pulling from one shared dispatch queue.
//!
//! Slots never share mutable state with each other; each owns its
//! device-bound predictor exclusively. A per-item inference failure is
//! absorbed and counted, it never stops the pool.

use crate::error::{InferenceError, WorkerInitError};
use crate::io::OutputSink;
use crate::pipeline::metrics::PipelineMetrics;
use crate::pipeline::types::{Payload, ResultEnvelope, SynchronizedTuple, WorkerState, WorkerStateCell};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll interval for the stop flag while the queue is idle.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// The opaque inference step. Concrete model wrappers implement this;
/// the pipeline is generic over it.
pub trait Predictor: Send {
    /// One-time model/resource setup, run inside the owning worker thread.
    fn initialize(&mut self) -> Result<(), WorkerInitError>;

    fn infer(&mut self, tuple: &SynchronizedTuple) -> Result<Payload, InferenceError>;
}

/// Builds one predictor per worker slot, given `(worker_id, device)`.
pub type PredictorFactory = Arc<dyn Fn(usize, &str) -> Box<dyn Predictor> + Send + Sync>;

/// Predictor wrapping a plain closure; initialization always succeeds.
pub struct FnPredictor<F>(pub F);

impl<F> Predictor for FnPredictor<F>
where
    F: FnMut(&SynchronizedTuple) -> Result<Payload, InferenceError> + Send,
{
    fn initialize(&mut self) -> Result<(), WorkerInitError> {
        Ok(())
    }

    fn infer(&mut self, tuple: &SynchronizedTuple) -> Result<Payload, InferenceError> {
        (self.0)(tuple)
    }
}

/// Supervisor-side view of one spawned slot.
pub struct WorkerHandle {
    pub worker_id: usize,
    pub device: String,
    pub state: Arc<WorkerStateCell>,
    pub join: JoinHandle<()>,
}

/// Spawns `devices × num_workers_per_device` slots sharing `dispatch_rx`.
///
/// Each slot reports its initialization outcome on `init_tx` before it
/// starts consuming, so the supervisor can fail fast when no slot came up.
pub fn spawn_pool(
    devices: &[String],
    num_workers_per_device: usize,
    dispatch_rx: &Receiver<SynchronizedTuple>,
    sink: &Arc<dyn OutputSink>,
    factory: &PredictorFactory,
    metrics: &Arc<PipelineMetrics>,
    stop: &Arc<AtomicBool>,
    init_tx: Sender<Result<usize, WorkerInitError>>,
) -> Vec<WorkerHandle> {
    let mut handles = Vec::with_capacity(devices.len() * num_workers_per_device);
    let mut worker_id = 0;

    for device in devices {
        for _ in 0..num_workers_per_device {
            let state = Arc::new(WorkerStateCell::new());
            let join = spawn_worker(
                worker_id,
                device.clone(),
                dispatch_rx.clone(),
                sink.clone(),
                factory.clone(),
                state.clone(),
                metrics.clone(),
                stop.clone(),
                init_tx.clone(),
            );
            handles.push(WorkerHandle {
                worker_id,
                device: device.clone(),
                state,
                join,
            });
            worker_id += 1;
        }
    }

    handles
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    worker_id: usize,
    device: String,
    rx: Receiver<SynchronizedTuple>,
    sink: Arc<dyn OutputSink>,
    factory: PredictorFactory,
    state: Arc<WorkerStateCell>,
    metrics: Arc<PipelineMetrics>,
    stop: Arc<AtomicBool>,
    init_tx: Sender<Result<usize, WorkerInitError>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        tracing::info!(worker_id, %device, "spawning worker slot");
        worker_loop(
            worker_id, &device, rx, sink, factory, &state, &metrics, &stop, init_tx,
        );
        state.set(WorkerState::Stopped);
        tracing::info!(worker_id, %device, "worker slot stopped");
    })
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    worker_id: usize,
    device: &str,
    rx: Receiver<SynchronizedTuple>,
    sink: Arc<dyn OutputSink>,
    factory: PredictorFactory,
    state: &WorkerStateCell,
    metrics: &PipelineMetrics,
    stop: &AtomicBool,
    init_tx: Sender<Result<usize, WorkerInitError>>,
) {
    // The predictor is built and initialized inside its own thread; the
    // model resource never crosses thread boundaries.
    let mut predictor = factory(worker_id, device);
    match predictor.initialize() {
        Ok(()) => {
            state.set(WorkerState::Ready);
            let _ = init_tx.send(Ok(worker_id));
        }
        Err(e) => {
            // Fatal for this slot only; the pool continues without it.
            tracing::error!(worker_id, %device, error = %e, "worker initialization failed");
            let _ = init_tx.send(Err(e));
            return;
        }
    }
    drop(init_tx);

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let tuple = match rx.recv_timeout(IDLE_POLL) {
            Ok(tuple) => tuple,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        state.set(WorkerState::Busy);
        match predictor.infer(&tuple) {
            Ok(payload) => {
                let envelope = ResultEnvelope {
                    correlation_key: tuple.correlation_key,
                    worker_id,
                    device: device.to_string(),
                    payload,
                };
                match sink.send(envelope) {
                    Ok(()) => PipelineMetrics::incr(&metrics.results_sent),
                    Err(e) => {
                        PipelineMetrics::incr(&metrics.send_errors);
                        tracing::warn!(worker_id, error = %e, "sink rejected result");
                    }
                }
            }
            Err(e) => {
                PipelineMetrics::incr(&metrics.inference_errors);
                tracing::warn!(worker_id, error = %e, "discarding item after inference failure");
            }
        }
        state.set(WorkerState::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use crate::io::{CollectSink, OutputSink};
    use crate::pipeline::types::{Item, SourceId};
    use crossbeam::channel;
    use std::sync::Mutex;

    fn tuple(key: u64) -> SynchronizedTuple {
        let id = SourceId::new("src");
        SynchronizedTuple {
            correlation_key: key,
            items: vec![Item::new(id, key, key, Arc::new(vec![]))],
        }
    }

    fn echo(t: &SynchronizedTuple) -> Result<Payload, InferenceError> {
        Ok(Arc::new(t.correlation_key.to_be_bytes().to_vec()))
    }

    fn echo_factory() -> PredictorFactory {
        Arc::new(|_, _| Box::new(FnPredictor(echo)) as Box<dyn Predictor>)
    }

    fn run_pool_until_drained(
        devices: &[String],
        per_device: usize,
        factory: PredictorFactory,
        sink: Arc<dyn OutputSink>,
        tuples: Vec<SynchronizedTuple>,
    ) -> (Arc<PipelineMetrics>, Vec<WorkerHandle>) {
        let (tx, rx) = channel::bounded(100);
        let metrics = Arc::new(PipelineMetrics::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (init_tx, init_rx) = channel::unbounded();

        let handles = spawn_pool(
            devices, per_device, &rx, &sink, &factory, &metrics, &stop, init_tx,
        );
        for _ in 0..handles.len() {
            let _ = init_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }

        for t in tuples {
            tx.send(t).unwrap();
        }
        drop(tx);

        (metrics, handles)
    }

    fn join_all(handles: Vec<WorkerHandle>) {
        for handle in handles {
            handle.join.join().unwrap();
            assert_eq!(handle.state.get(), WorkerState::Stopped);
        }
    }

    #[test]
    fn test_k_tuples_yield_k_results_once_each() {
        let sink = CollectSink::new();
        let devices = vec!["cpu".to_string()];
        let tuples: Vec<_> = (0..20).map(tuple).collect();
        let (metrics, handles) = run_pool_until_drained(
            &devices,
            3,
            echo_factory(),
            sink.clone(),
            tuples,
        );
        join_all(handles);

        let results = sink.results();
        assert_eq!(results.len(), 20);
        // No tuple processed twice.
        let mut keys: Vec<u64> = results.iter().map(|r| r.correlation_key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 20);
        assert_eq!(metrics.results_sent.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn test_inference_failure_discards_item_and_continues() {
        // Item 3 of 5 fails; results for 1,2,4,5 still arrive and the pool
        // keeps consuming afterwards.
        let sink = CollectSink::new();
        let devices = vec!["cpu".to_string()];
        fn fail_on_3(t: &SynchronizedTuple) -> Result<Payload, InferenceError> {
            if t.correlation_key == 3 {
                Err(InferenceError::new(3, "bad tensor"))
            } else {
                Ok(Arc::new(vec![]))
            }
        }
        let factory: PredictorFactory =
            Arc::new(|_, _| Box::new(FnPredictor(fail_on_3)) as Box<dyn Predictor>);
        let tuples: Vec<_> = (1..=5).map(tuple).collect();
        let (metrics, handles) =
            run_pool_until_drained(&devices, 1, factory, sink.clone(), tuples);
        join_all(handles);

        let mut keys: Vec<u64> = sink.results().iter().map(|r| r.correlation_key).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2, 4, 5]);
        assert_eq!(metrics.inference_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_init_failure_is_fatal_to_that_slot_only() {
        let sink = CollectSink::new();
        let devices = vec!["cuda:0".to_string(), "cuda:1".to_string()];
        // Slot on cuda:1 fails to come up.
        let factory: PredictorFactory = Arc::new(|worker_id, device| {
            Box::new(FnOnceInit {
                failing: device == "cuda:1",
                worker_id,
                device: device.to_string(),
            }) as Box<dyn Predictor>
        });

        let tuples: Vec<_> = (0..10).map(tuple).collect();
        let (tx, rx) = channel::bounded(100);
        let metrics = Arc::new(PipelineMetrics::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (init_tx, init_rx) = channel::unbounded();
        let sink_dyn: Arc<dyn OutputSink> = sink.clone();
        let handles = spawn_pool(
            &devices, 1, &rx, &sink_dyn, &factory, &metrics, &stop, init_tx,
        );

        let outcomes: Vec<_> = (0..2)
            .map(|_| init_rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(outcomes.iter().filter(|o| o.is_err()).count(), 1);

        for t in tuples {
            tx.send(t).unwrap();
        }
        drop(tx);
        join_all(handles);
        assert_eq!(sink.len(), 10);
    }

    struct FnOnceInit {
        failing: bool,
        worker_id: usize,
        device: String,
    }

    impl Predictor for FnOnceInit {
        fn initialize(&mut self) -> Result<(), WorkerInitError> {
            if self.failing {
                Err(WorkerInitError {
                    worker_id: self.worker_id,
                    device: self.device.clone(),
                    reason: "model download failed".to_string(),
                })
            } else {
                Ok(())
            }
        }

        fn infer(&mut self, _t: &SynchronizedTuple) -> Result<Payload, InferenceError> {
            Ok(Arc::new(vec![]))
        }
    }

    #[test]
    fn test_send_error_reported_not_retried() {
        struct RejectingSink {
            attempts: Mutex<u64>,
        }
        impl OutputSink for RejectingSink {
            fn initialize(&self) -> Result<(), crate::error::ConnectionError> {
                Ok(())
            }
            fn send(&self, result: ResultEnvelope) -> Result<(), SendError> {
                *self.attempts.lock().unwrap() += 1;
                Err(SendError {
                    correlation_key: result.correlation_key,
                    reason: "broker unavailable".to_string(),
                })
            }
        }

        let sink = Arc::new(RejectingSink {
            attempts: Mutex::new(0),
        });
        let devices = vec!["cpu".to_string()];
        let (metrics, handles) = run_pool_until_drained(
            &devices,
            1,
            echo_factory(),
            sink.clone(),
            (0..4).map(tuple).collect(),
        );
        join_all(handles);

        assert_eq!(*sink.attempts.lock().unwrap(), 4); // one attempt per item
        assert_eq!(metrics.send_errors.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.results_sent.load(Ordering::Relaxed), 0);
    }
}
