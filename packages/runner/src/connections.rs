// ABOUTME: Connection reference parsing and resolution
// ABOUTME: Resolves @family.alias from osiris_connections.json or OSIRIS_CONN_* environment variables

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub const CONNECTIONS_FILE: &str = "osiris_connections.json";
pub const CONNECTION_ENV_PREFIX: &str = "OSIRIS_CONN_";

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid connection reference '{0}' (expected @family.alias)")]
    InvalidReference(String),

    #[error("Connection '@{family}.{alias}' not found")]
    NotFound { family: String, alias: String },

    #[error("No default connection for family '{family}'")]
    NoDefault { family: String },

    #[error("Environment variable '{var}' referenced by connection '@{family}' is not set")]
    MissingEnvVar { family: String, var: String },

    #[error("No connection resolver configured for '{0}'")]
    NoResolver(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid substitution pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Parsed `@family.alias` (alias omitted selects the family default)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRef {
    pub family: String,
    pub alias: Option<String>,
}

impl ConnectionRef {
    pub fn parse(reference: &str) -> Result<Self, ConnectionError> {
        let body = reference
            .strip_prefix('@')
            .ok_or_else(|| ConnectionError::InvalidReference(reference.to_string()))?;
        let (family, alias) = match body.split_once('.') {
            Some((family, alias)) => (family, Some(alias)),
            None => (body, None),
        };
        if family.is_empty() || alias.is_some_and(str::is_empty) {
            return Err(ConnectionError::InvalidReference(reference.to_string()));
        }
        Ok(Self {
            family: family.to_string(),
            alias: alias.map(str::to_string),
        })
    }

    /// Name of the environment variable carrying this descriptor into a sandbox
    pub fn env_var_name(&self) -> String {
        let alias = self.alias.as_deref().unwrap_or("default");
        format!(
            "{}{}_{}",
            CONNECTION_ENV_PREFIX,
            env_component(&self.family),
            env_component(alias)
        )
    }
}

impl std::fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "@{}.{}", self.family, alias),
            None => write!(f, "@{}", self.family),
        }
    }
}

fn env_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Source of connection descriptors
pub trait ConnectionResolver: Send + Sync {
    fn resolve(&self, reference: &ConnectionRef) -> Result<Value, ConnectionError>;
}

/// Connections declared in `osiris_connections.json`:
/// `{"connections": {"<family>": {"<alias>": {..., "default": true}}}}`
#[derive(Debug, Clone, Default)]
pub struct FileConnections {
    families: BTreeMap<String, BTreeMap<String, Value>>,
}

impl FileConnections {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConnectionError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let value: Value = serde_json::from_str(&text)?;
        debug!("Loaded connections from {}", path.as_ref().display());
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let families = value
            .get("connections")
            .and_then(Value::as_object)
            .map(|families| {
                families
                    .iter()
                    .filter_map(|(family, aliases)| {
                        let aliases = aliases.as_object()?;
                        Some((
                            family.clone(),
                            aliases
                                .iter()
                                .map(|(alias, desc)| (alias.clone(), desc.clone()))
                                .collect(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { families }
    }
}

impl ConnectionResolver for FileConnections {
    fn resolve(&self, reference: &ConnectionRef) -> Result<Value, ConnectionError> {
        let aliases = self.families.get(&reference.family);
        let descriptor = match &reference.alias {
            Some(alias) => aliases.and_then(|a| a.get(alias)).ok_or_else(|| {
                ConnectionError::NotFound {
                    family: reference.family.clone(),
                    alias: alias.clone(),
                }
            })?,
            None => aliases
                .and_then(|a| {
                    a.values()
                        .find(|d| d.get("default").and_then(Value::as_bool) == Some(true))
                        .or_else(|| if a.len() == 1 { a.values().next() } else { None })
                })
                .ok_or_else(|| ConnectionError::NoDefault {
                    family: reference.family.clone(),
                })?,
        };

        let mut resolved = substitute_env(descriptor, &reference.family)?;
        if let Value::Object(map) = &mut resolved {
            map.remove("default");
        }
        Ok(resolved)
    }
}

/// Descriptors passed as JSON in `OSIRIS_CONN_<FAMILY>_<ALIAS>` variables
#[derive(Debug, Clone, Default)]
pub struct EnvConnections;

impl ConnectionResolver for EnvConnections {
    fn resolve(&self, reference: &ConnectionRef) -> Result<Value, ConnectionError> {
        let var = reference.env_var_name();
        let raw = std::env::var(&var).map_err(|_| ConnectionError::NotFound {
            family: reference.family.clone(),
            alias: reference.alias.clone().unwrap_or_else(|| "default".to_string()),
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

const ENV_REFERENCE_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Replace `${VAR}` in every string of `value` with the environment value
fn substitute_env(value: &Value, family: &str) -> Result<Value, ConnectionError> {
    let pattern = Regex::new(ENV_REFERENCE_PATTERN)?;
    substitute_with(&pattern, value, family)
}

fn substitute_with(pattern: &Regex, value: &Value, family: &str) -> Result<Value, ConnectionError> {
    match value {
        Value::String(s) => {
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for caps in pattern.captures_iter(s) {
                let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                let replacement =
                    std::env::var(name.as_str()).map_err(|_| ConnectionError::MissingEnvVar {
                        family: family.to_string(),
                        var: name.as_str().to_string(),
                    })?;
                out.push_str(&s[last..whole.start()]);
                out.push_str(&replacement);
                last = whole.end();
            }
            out.push_str(&s[last..]);
            Ok(Value::String(out))
        }
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), substitute_with(pattern, v, family)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| substitute_with(pattern, v, family))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}
