// ABOUTME: Line protocol between the host and the proxy worker
// ABOUTME: Commands are discriminated by `cmd`, responses and stream messages by `type`

use chrono::{SecondsFormat, Utc};
use osiris_core::{InputRef, Manifest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Session events emitted only by the worker
pub mod event_names {
    pub const SESSION_INITIALIZED: &str = "session_initialized";
    pub const DRIVER_REGISTERED: &str = "driver_registered";
    pub const DRIVER_REGISTRATION_FAILED: &str = "driver_registration_failed";
    pub const DEPENDENCY_CHECK_FAILED: &str = "dependency_check_failed";
    pub const CONFIG_LOADED: &str = "config_loaded";
    pub const CLEANUP_COMPLETE: &str = "cleanup_complete";
}

/// Commands read from the worker's input, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Prepare {
        session_id: String,
        manifest: Manifest,
        /// Overrides the run config's install permission for this session
        #[serde(default, skip_serializing_if = "Option::is_none")]
        install_deps: Option<bool>,
    },
    ExecStep {
        step_id: String,
        driver: String,
        cfg_path: String,
        #[serde(default)]
        inputs: BTreeMap<String, InputRef>,
    },
    Cleanup {},
    Ping {
        #[serde(default)]
        data: Value,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Prepare { .. } => "prepare",
            Command::ExecStep { .. } => "exec_step",
            Command::Cleanup {} => "cleanup",
            Command::Ping { .. } => "ping",
        }
    }
}

/// Outcome of `exec_step`; only JSON-safe fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub ok: bool,
    pub rows_processed: usize,
    pub rows_read: usize,
    pub rows_written: usize,
    pub duration_ms: u64,
    /// Summary of the cached outputs (table shapes, spill locations, plain values)
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Exactly one response is written per command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Prepared {
        session_id: String,
        session_dir: String,
        drivers_loaded: Vec<String>,
        timestamp: String,
    },
    StepResult(StepResult),
    CleanupComplete {
        session_id: Option<String>,
        steps_executed: usize,
        steps_completed: usize,
        total_rows: usize,
        status_path: String,
        timestamp: String,
    },
    Pong {
        data: Value,
        timestamp: String,
    },
    Error {
        error: String,
        timestamp: String,
        #[serde(default)]
        context: Value,
    },
}

impl Response {
    pub fn error(error: impl Into<String>, context: Value) -> Self {
        Response::Error {
            error: error.into(),
            timestamp: timestamp(),
            context,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_decode_exec_step() {
        let cmd: Command = serde_json::from_str(
            r#"{"cmd": "exec_step", "step_id": "write", "driver": "fs.writer",
                "cfg_path": "cfg/write.json",
                "inputs": {"df": {"from_step": "extract", "key": "df"}}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::ExecStep {
                step_id: "write".to_string(),
                driver: "fs.writer".to_string(),
                cfg_path: "cfg/write.json".to_string(),
                inputs: BTreeMap::from([("df".to_string(), InputRef::new("extract", "df"))]),
            }
        );
        assert_eq!(cmd.name(), "exec_step");
    }

    #[rstest]
    #[case(r#"{"cmd": "cleanup"}"#, Command::Cleanup {})]
    #[case(r#"{"cmd": "ping"}"#, Command::Ping { data: Value::Null })]
    #[case(r#"{"cmd": "ping", "data": {"n": 1}}"#, Command::Ping { data: json!({"n": 1}) })]
    fn test_decode_bare_commands(#[case] line: &str, #[case] expected: Command) {
        let cmd: Command = serde_json::from_str(line).unwrap();
        assert_eq!(cmd, expected);
    }

    #[rstest]
    #[case(r#"{"cmd": "shutdown"}"#)]
    #[case(r#"{"step_id": "extract"}"#)]
    #[case("not json")]
    fn test_malformed_command_is_rejected(#[case] line: &str) {
        assert!(serde_json::from_str::<Command>(line).is_err());
    }

    #[test]
    fn test_step_result_is_tagged() {
        let response = Response::StepResult(StepResult {
            step_id: "extract".to_string(),
            ok: true,
            rows_processed: 3,
            rows_read: 3,
            rows_written: 0,
            duration_ms: 5,
            outputs: json!({}),
            error: None,
            error_type: None,
            traceback: None,
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "step_result");
        assert_eq!(value["rows_read"], 3);
        assert!(value.get("error").is_none());
    }
}
