// ABOUTME: Execution adapters for Osiris pipelines
// ABOUTME: A shared prepare/execute/collect contract with local and E2B sandbox targets

pub mod adapter;
pub mod config;
pub mod e2b;
pub mod error;
pub mod factory;
pub mod local;
pub mod parity;
pub mod types;

pub use adapter::{ExecutionAdapter, ADAPTER_TARGET_KEY};
pub use config::{ConfigError, E2BConfig};
pub use e2b::{remote_root, tag_jsonl, E2BAdapter, SandboxPhase, E2B_TARGET, REMOTE_DIR};
pub use error::{CollectError, ExecuteError, PrepareError};
pub use factory::AdapterFactory;
pub use local::{last_failure_message, LocalAdapter, FALLBACK_FAILURE_MESSAGE, LOCAL_TARGET};
pub use parity::{load_normalized, normalize_for_parity};
pub use types::{
    CollectedArtifacts, CompiledPlan, Constraints, ExecResult, IoLayout, PreparedRun, RunParams,
    StepResult,
};
