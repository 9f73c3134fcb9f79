//! Collector Layer
//!
//! Periodic collection of vehicle locations from a remote source into the
//! storage layer. A single [`Scheduler`] task owns the loop; nothing runs
//! concurrently with a cycle.
//!
//! # Architecture
//!
//! - [`LocationSource`]: Boundary trait for remote location APIs
//! - [`FleetUpClient`]: FleetUp implementation of [`LocationSource`]
//! - [`BackoffPolicy`]: Retry delay computation (exponential, capped, jittered)
//! - [`fetch_with_retry`]: Retry state machine around one fetch
//! - [`Scheduler`]: Fixed-interval loop running one [`CollectionCycle`] per tick
//! - [`stop_channel`]: Cooperative shutdown signal
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gps_collector::{BackoffPolicy, FleetUpClient, FleetUpConfig, Scheduler, StorageBuilder, stop_channel};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = StorageBuilder::new("./data").build()?;
//! let config = FleetUpConfig::new("acct", "secret", "api-key", "https://api.example.com/");
//! let client = Arc::new(FleetUpClient::new(config)?);
//! let mut scheduler = Scheduler::new(client, storage, BackoffPolicy::default());
//! let (_handle, stop) = stop_channel();
//! scheduler.run(Duration::from_secs(300), stop).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod cycle;
pub mod fleetup;
mod retry;
mod scheduler;
mod signal;
#[cfg(test)]
mod testing;
mod traits;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use cycle::{CollectionCycle, CycleStatus};
pub use fleetup::{FleetUpClient, FleetUpConfig};
pub use retry::{FetchOutcome, RetryState, fetch_with_retry};
pub use scheduler::{RunSummary, Scheduler};
pub use signal::{StopHandle, StopSignal, stop_channel};
pub use traits::{CollectorError, ErrorKind, FetchError, LocationPage, LocationSource};
