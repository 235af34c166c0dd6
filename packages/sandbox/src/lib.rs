// ABOUTME: Remote sandbox support for Osiris pipeline runs
// ABOUTME: Transport abstraction, E2B and in-memory backends, client orchestration, payload packaging

pub mod client;
pub mod e2b;
pub mod error;
pub mod memory;
pub mod payload;
pub mod transport;

pub use client::{
    ArtifactDownload, BackoffPolicy, FinalStatus, SandboxClient, DEFAULT_INITIAL_INTERVAL,
    PAYLOAD_ARCHIVE_NAME,
};
pub use e2b::{E2BTransport, E2BTransportConfig};
pub use error::{Result, SandboxError};
pub use memory::{CommandHandler, MemoryFs, MemoryTransport};
pub use payload::{
    validate_payload, Payload, PayloadBuilder, PayloadError, PayloadFile, PayloadManifest,
    DEFAULT_MAX_PAYLOAD_BYTES,
};
pub use transport::{
    FileEntry, ProcessHandle, ProcessOutput, ProcessState, SandboxHandle, SandboxSpec,
    SandboxStatus, SandboxTransport, SANDBOX_HOME,
};
