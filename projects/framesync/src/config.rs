//! Validated configuration structs for every pipeline component.
//!
//! The connection-string format mirrors the service front-ends:
//! `scheme://host:port,topic=name,qos=2,queue_max_len=100`. Options are
//! enumerated and validated here once, at startup; components receive
//! plain structs and never re-parse anything.

use crate::error::ConfigError;
use serde::Serialize;
use std::time::Duration;

/// Recognized options of a parsed connection string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointConfig {
    pub scheme: String,
    pub addr: String,
    pub topic: Option<String>,
    /// Message delivery guarantee level, passed through to the transport.
    pub qos: Option<u8>,
    pub queue_max_len: Option<usize>,
    pub buffer_threshold: Option<usize>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
}

impl EndpointConfig {
    /// Parses `scheme://host:port,key=value,...`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = input.split_once("://").ok_or_else(|| {
            ConfigError::InvalidConnectionString {
                input: input.to_string(),
                reason: "missing '://' scheme separator".to_string(),
            }
        })?;

        let mut parts = rest.split(',');
        let addr = parts.next().unwrap_or_default();
        if scheme.is_empty() || addr.is_empty() {
            return Err(ConfigError::InvalidConnectionString {
                input: input.to_string(),
                reason: "empty scheme or address".to_string(),
            });
        }

        let mut config = Self {
            scheme: scheme.to_string(),
            addr: addr.to_string(),
            topic: None,
            qos: None,
            queue_max_len: None,
            buffer_threshold: None,
            width: None,
            height: None,
            fps: None,
        };

        for part in parts {
            let (key, value) =
                part.split_once('=')
                    .ok_or_else(|| ConfigError::InvalidConnectionString {
                        input: input.to_string(),
                        reason: format!("option '{part}' is not key=value"),
                    })?;
            match key {
                "topic" => config.topic = Some(value.to_string()),
                "qos" => {
                    let qos = parse_option::<u8>(key, value)?;
                    if qos > 2 {
                        return Err(ConfigError::InvalidOption {
                            option: key.to_string(),
                            value: value.to_string(),
                            reason: "qos must be 0, 1 or 2".to_string(),
                        });
                    }
                    config.qos = Some(qos);
                }
                "queue_max_len" => config.queue_max_len = Some(parse_nonzero(key, value)?),
                "buffer_threshold" => config.buffer_threshold = Some(parse_nonzero(key, value)?),
                "width" => config.width = Some(parse_option(key, value)?),
                "height" => config.height = Some(parse_option(key, value)?),
                "fps" => config.fps = Some(parse_option(key, value)?),
                _ => {
                    return Err(ConfigError::UnknownOption {
                        option: key.to_string(),
                    })
                }
            }
        }

        Ok(config)
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidOption {
        option: key.to_string(),
        value: value.to_string(),
        reason: "not a valid number".to_string(),
    })
}

fn parse_nonzero(key: &str, value: &str) -> Result<usize, ConfigError> {
    let parsed: usize = parse_option(key, value)?;
    if parsed == 0 {
        return Err(ConfigError::InvalidOption {
            option: key.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

/// Per-source configuration.
#[derive(Debug, Clone, Serialize)]
pub struct SourceConfig {
    /// Capacity of the channel's own bounded buffer.
    pub queue_capacity: usize,
    /// When set, an Ordering Stage with this window size is interposed
    /// between the channel and the synchronizer.
    pub buffer_threshold: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            buffer_threshold: None,
        }
    }
}

impl SourceConfig {
    /// Derives source settings from a parsed connection string.
    pub fn from_endpoint(endpoint: &EndpointConfig) -> Self {
        Self {
            queue_capacity: endpoint.queue_max_len.unwrap_or(100),
            buffer_threshold: endpoint.buffer_threshold,
        }
    }
}

/// Behavior of the dispatch queue when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverflowPolicy {
    /// Producer blocks until a worker frees capacity (backpressure).
    Block,
    /// The incoming tuple is dropped and counted.
    DropNewest,
}

/// Whole-pipeline configuration, constructed once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    /// One entry per source, in the fixed order tuples are laid out.
    pub sources: Vec<SourceConfig>,
    /// Maximum number of pending (incomplete) groups.
    pub pending_capacity: usize,
    /// A pending group older than this is evicted even below capacity.
    pub group_timeout: Duration,
    /// Capacity of the dispatch queue feeding the worker pool.
    pub dispatch_capacity: usize,
    pub dispatch_overflow: OverflowPolicy,
    /// Compute device identifiers, e.g. ["cuda:0", "cuda:1"] or ["cpu"].
    pub devices: Vec<String>,
    pub num_workers_per_device: usize,
    /// Grace period granted to in-flight groups during graceful stop.
    pub drain_grace: Duration,
    /// Exit after one full drain instead of running forever.
    pub run_until_complete: bool,
    /// Keep the process alive after pipeline start.
    pub daemon_mode: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            pending_capacity: 50,
            group_timeout: Duration::from_secs(5),
            dispatch_capacity: 100,
            dispatch_overflow: OverflowPolicy::Block,
            devices: vec!["cpu".to_string()],
            num_workers_per_device: 1,
            drain_grace: Duration::from_millis(500),
            run_until_complete: false,
            daemon_mode: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one source is required".to_string(),
            ));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one device is required".to_string(),
            ));
        }
        if self.num_workers_per_device == 0 {
            return Err(ConfigError::Invalid(
                "num_workers_per_device must be at least 1".to_string(),
            ));
        }
        if self.pending_capacity == 0 || self.dispatch_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pending_capacity and dispatch_capacity must be at least 1".to_string(),
            ));
        }
        for (i, source) in self.sources.iter().enumerate() {
            if source.queue_capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "source {i}: queue_capacity must be at least 1"
                )));
            }
            if source.buffer_threshold == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "source {i}: buffer_threshold must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// Total number of worker slots the pool will create.
    pub fn total_workers(&self) -> usize {
        self.devices.len() * self.num_workers_per_device
    }
}
