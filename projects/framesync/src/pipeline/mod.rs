// Stream synchronization and execution pipeline.

pub mod metrics;
pub mod ordering;
pub mod orchestrator;
pub mod synchronizer;
pub mod types;
pub mod worker;
