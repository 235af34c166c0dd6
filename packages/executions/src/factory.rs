// ABOUTME: Adapter factory selecting an execution target by name
// ABOUTME: Builds the local adapter or an E2B adapter configured from the environment

use crate::adapter::ExecutionAdapter;
use crate::config::E2BConfig;
use crate::e2b::{E2BAdapter, E2B_TARGET};
use crate::error::PrepareError;
use crate::local::{LocalAdapter, LOCAL_TARGET};
use tracing::debug;

pub struct AdapterFactory;

impl AdapterFactory {
    /// Adapter for `target`; E2B settings come from the process environment
    pub fn create(target: &str) -> Result<Box<dyn ExecutionAdapter>, PrepareError> {
        let e2b_config = if target.trim().eq_ignore_ascii_case(E2B_TARGET) {
            Some(E2BConfig::from_env()?)
        } else {
            None
        };
        Self::create_with(target, e2b_config)
    }

    /// Like [`AdapterFactory::create`] with an explicit E2B configuration
    pub fn create_with(
        target: &str,
        e2b_config: Option<E2BConfig>,
    ) -> Result<Box<dyn ExecutionAdapter>, PrepareError> {
        let normalized = target.trim().to_ascii_lowercase();
        debug!("Creating execution adapter for target '{}'", normalized);
        match normalized.as_str() {
            LOCAL_TARGET => Ok(Box::new(LocalAdapter::new())),
            E2B_TARGET => Ok(Box::new(E2BAdapter::new(e2b_config.unwrap_or_default()))),
            _ => Err(PrepareError::UnknownTarget(target.to_string())),
        }
    }
}
