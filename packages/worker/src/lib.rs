// ABOUTME: In-sandbox proxy worker for Osiris pipelines
// ABOUTME: Line protocol, output cache with spill, dependency probe, and the batch host

pub mod cache;
pub mod config;
pub mod deps;
pub mod error;
pub mod host;
pub mod protocol;
pub mod session;
pub mod worker;

pub use cache::OutputCache;
pub use config::WorkerConfig;
pub use deps::{ensure_dependencies, DependencyProbe, PathProbe};
pub use error::{Result, WorkerError};
pub use host::{run_batch, BatchReport};
pub use protocol::{Command, Response, StepResult};
pub use session::Session;
pub use worker::ProxyWorker;
