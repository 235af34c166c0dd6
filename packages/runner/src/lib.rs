// ABOUTME: In-process pipeline execution for Osiris
// ABOUTME: DAG ordering, config materialization, connections, the step executor, and builtin drivers

pub mod connections;
pub mod dag;
pub mod drivers;
pub mod error;
pub mod lifecycle;
pub mod materialize;
pub mod runner;
pub mod step;

pub use connections::{
    ConnectionError, ConnectionRef, ConnectionResolver, EnvConnections, FileConnections,
};
pub use dag::{derive_inputs, topological_order, StepGraph};
pub use drivers::builtin_registry;
pub use error::{Result, RunnerError};
pub use materialize::{
    build_cfg_index, materialize, referenced_connections, MaterializedConfig, ORCHESTRATION_KEYS,
};
pub use runner::{DagRunner, RunReport};
pub use step::{execute_step, RowTotals, StepError, StepFailure, StepOutcome, StepSetup};
