// ABOUTME: Error types for the core package
// ABOUTME: Manifest validation, driver lookup, and I/O failures

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid manifest: {}", .0.join("; "))]
    InvalidManifest(Vec<String>),

    #[error("Driver not found: {name} (available: {})", .available.join(", "))]
    DriverNotFound { name: String, available: Vec<String> },

    #[error("Invalid table: {0}")]
    InvalidTable(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_not_found_lists_available() {
        let err = CoreError::DriverNotFound {
            name: "mysql.extractor".to_string(),
            available: vec!["a.writer".to_string(), "b.extractor".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("mysql.extractor"));
        assert!(msg.contains("a.writer, b.extractor"));
    }

    #[test]
    fn test_invalid_manifest_joins_problems() {
        let err = CoreError::InvalidManifest(vec!["one".to_string(), "two".to_string()]);
        assert_eq!(err.to_string(), "Invalid manifest: one; two");
    }
}
