//! Multi-source stream synchronizer and bounded worker-pool engine.
//!
//! Video-analytics services built on this crate merge one video stream
//! with any number of independently delayed message streams into
//! temporally aligned tuples, then fan those tuples out to a pool of
//! stateful worker replicas under strict backpressure. Transports and
//! models are external collaborators plugged in through [`SourceChannel`],
//! [`OutputSink`], and [`Predictor`].

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;

pub use config::{EndpointConfig, OverflowPolicy, PipelineConfig, SourceConfig};
pub use error::{
    ConfigError, ConnectionError, InferenceError, SendError, StartupError, WorkerInitError,
};
pub use io::{CollectSink, MemorySource, NullSink, OutputSink, SourceChannel};
pub use pipeline::metrics::MetricsSnapshot;
pub use pipeline::orchestrator::{MetricsObserver, Pipeline, PipelineHandle};
pub use pipeline::types::{
    Item, Payload, ResultEnvelope, SourceId, SynchronizedTuple, WorkerState,
};
pub use pipeline::worker::{FnPredictor, Predictor, PredictorFactory};
