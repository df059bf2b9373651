use thiserror::Error;

/// A source or sink failed to connect/initialize. Fatal to pipeline startup.
#[derive(Debug, Error)]
#[error("connection to '{endpoint}' failed: {reason}")]
pub struct ConnectionError {
    pub endpoint: String,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

/// The Output Sink rejected a result. Reported, never retried by the core.
#[derive(Debug, Error)]
#[error("sink rejected result for key {correlation_key}: {reason}")]
pub struct SendError {
    pub correlation_key: u64,
    pub reason: String,
}

/// One-time model/resource setup failed for a single worker slot.
#[derive(Debug, Error)]
#[error("worker {worker_id} on device '{device}' failed to initialize: {reason}")]
pub struct WorkerInitError {
    pub worker_id: usize,
    pub device: String,
    pub reason: String,
}

/// A per-item inference failure. Absorbed by the owning worker slot.
#[derive(Debug, Error)]
#[error("inference failed for key {correlation_key}: {reason}")]
pub struct InferenceError {
    pub correlation_key: u64,
    pub reason: String,
}

impl InferenceError {
    pub fn new(correlation_key: u64, reason: impl Into<String>) -> Self {
        Self {
            correlation_key,
            reason: reason.into(),
        }
    }
}

/// Invalid or unparseable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid connection string '{input}': {reason}")]
    InvalidConnectionString { input: String, reason: String },
    #[error("unknown option '{option}' in connection string")]
    UnknownOption { option: String },
    #[error("option '{option}' has invalid value '{value}': {reason}")]
    InvalidOption {
        option: String,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Errors that can abort pipeline startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("no worker slot finished initialization")]
    NoWorkersAvailable,
}
