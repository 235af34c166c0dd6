// ABOUTME: Core types, traits, and utilities for Osiris pipeline execution
// ABOUTME: Manifest model, run logs, tabular data, secret masking, and the driver contract

pub mod constants;
pub mod context;
pub mod driver;
pub mod error;
pub mod events;
pub mod manifest;
pub mod redact;
pub mod run_config;
pub mod status;
pub mod table;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types
pub use context::ExecutionContext;
pub use driver::{
    DoctorReport, Driver, DriverContext, DriverError, DriverRegistry, DriverRole, InputRef,
    InputSource, OutputValue, ResolveError, StepInputs, StepOutputs,
};
pub use error::{CoreError, Result};
pub use events::{read_jsonl, RunLog, SharedBuffer, StreamWriter};
pub use manifest::{Manifest, ManifestMetadata, PipelineInfo, Step};
pub use redact::{mask_secrets, MASK};
pub use run_config::RunConfig;
pub use status::RunStatus;
pub use table::Table;
