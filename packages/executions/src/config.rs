// ABOUTME: E2B adapter configuration read from the process environment
// ABOUTME: Sandbox resources, timeouts, worker flags, and environment pass-through

use std::collections::BTreeMap;
use std::env;
use std::num::ParseIntError;
use thiserror::Error;

pub const API_KEY_VAR: &str = "E2B_API_KEY";
pub const ENV_PASSTHROUGH_PREFIX: &str = "OSIRIS_E2B_ENV_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number in {var}: {source}")]
    InvalidNumber {
        var: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct E2BConfig {
    /// Only checked at execute time so `prepare` works without credentials
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub template: Option<String>,
    pub cpu: u32,
    pub memory_gb: u32,
    pub timeout_secs: u64,
    pub force_spill: bool,
    pub install_deps: bool,
    pub install_command: Option<String>,
    /// Pinned packages written to the payload's requirements file
    pub requirements: Vec<String>,
    /// Extra sandbox environment, from `OSIRIS_E2B_ENV_<NAME>`
    pub env: BTreeMap<String, String>,
}

impl Default for E2BConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: None,
            template: None,
            cpu: 2,
            memory_gb: 4,
            timeout_secs: 900,
            force_spill: false,
            install_deps: false,
            install_command: None,
            requirements: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl E2BConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    /// Same as [`E2BConfig::from_env`] over an explicit variable set
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let get = |name: &str| {
            vars.get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let cpu = parse_positive(get("OSIRIS_E2B_CPU"), "OSIRIS_E2B_CPU", defaults.cpu)?;
        let memory_gb = parse_positive(
            get("OSIRIS_E2B_MEMORY_GB"),
            "OSIRIS_E2B_MEMORY_GB",
            defaults.memory_gb,
        )?;
        let timeout_secs = match get("OSIRIS_E2B_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|source| ConfigError::InvalidNumber {
                    var: "OSIRIS_E2B_TIMEOUT_SECS",
                    source,
                })?,
            None => defaults.timeout_secs,
        };
        if timeout_secs == 0 {
            return Err(ConfigError::Zero {
                var: "OSIRIS_E2B_TIMEOUT_SECS",
            });
        }

        let force_spill = get("OSIRIS_E2B_FORCE_SPILL")
            .unwrap_or_else(|| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);
        let install_deps = get("OSIRIS_E2B_INSTALL_DEPS")
            .unwrap_or_else(|| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let requirements = get("OSIRIS_E2B_REQUIREMENTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let env = vars
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(ENV_PASSTHROUGH_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();

        Ok(E2BConfig {
            api_key: get(API_KEY_VAR),
            api_url: get("OSIRIS_E2B_API_URL"),
            template: get("OSIRIS_E2B_TEMPLATE"),
            cpu,
            memory_gb,
            timeout_secs,
            force_spill,
            install_deps,
            install_command: get("OSIRIS_E2B_INSTALL_COMMAND"),
            requirements,
            env,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

fn parse_positive(raw: Option<String>, var: &'static str, default: u32) -> Result<u32, ConfigError> {
    let value = match raw {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|source| ConfigError::InvalidNumber { var, source })?,
        None => default,
    };
    if value == 0 {
        return Err(ConfigError::Zero { var });
    }
    Ok(value)
}
