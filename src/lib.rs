//! GPS Collector - FleetUp Vehicle Location Collector
//!
//! Polls a vehicle-location API on a fixed interval and appends every new
//! observation to an append-only CSV dataset. It can be used as a library,
//! or run as a standalone service with the `gps-collector` executable.
//!
//! # Architecture
//!
//! - **Collector**: Scheduler, retry/backoff and the FleetUp API client
//! - **Storage**: Idempotent CSV dataset writer and durable cursor
//! - **Config**: YAML + environment configuration with validation
//! - **Telemetry**: `tracing` subscriber setup
//!
//! # Guarantees
//!
//! - At most one collection cycle runs at a time
//! - Each `(vehicle id, timestamp)` observation is stored at most once
//! - The cursor only advances after the batch is durably written

pub mod collector;
pub mod config;
pub mod storage;
pub mod telemetry;

pub use collector::{
    BackoffPolicy, CollectionCycle, CollectorError, CycleStatus, FetchError, FleetUpClient,
    FleetUpConfig, LocationPage, LocationSource, RunSummary, Scheduler, StopHandle, StopSignal,
    stop_channel,
};
pub use config::{AppConfig, ConfigError};
pub use storage::{
    Cursor, CursorStore, DataError, DatasetWriter, LocationRecord, StorageBuilder,
    StorageError, StorageHandles, WriteReport,
};
