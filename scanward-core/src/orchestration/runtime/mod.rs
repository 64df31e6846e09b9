//! Concrete runtime pieces wired by the orchestrator.

pub mod event_bus;
pub mod executor;
pub mod workers;

pub use event_bus::InProcEventBus;
pub use executor::{TaskExecutor, TaskOutcome};
pub use workers::{PoolSizes, PoolSlot, WorkerPools};
