//! Scan orchestration engine.
//!
//! Accepts scan requests against a target, decomposes them into one task per
//! scanner, schedules the tasks on resource-typed worker pools under CPU and
//! memory admission control, and caches results by content checksum so that
//! unchanged targets are never rescanned.
//!
//! The entry point is [`orchestration::ScanOrchestrator`], built from an
//! [`orchestration::OrchestrationContext`].

pub mod error;
pub mod orchestration;
pub mod types;

pub use error::{Result, ScanError};
pub use orchestration::{
    OrchestrationContext, OrchestratorConfig, ScanOrchestrator, ScanRequest,
    ScannerSelection,
};
pub use types::ids::{JobId, TaskId};
