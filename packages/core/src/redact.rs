// ABOUTME: Secret masking for configs written to artifacts or shipped as descriptors
// ABOUTME: Recursively replaces values under secret-looking keys with a fixed mask

use serde_json::Value;

pub const MASK: &str = "***MASKED***";

const SECRET_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "key",
    "service_role_key",
    "anon_key",
    "access_key",
    "private_key",
    "connection_string",
    "dsn",
];

/// Whether a config key names a secret (case-insensitive)
pub fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEYS.iter().any(|s| *s == key)
        || key.ends_with("_password")
        || key.ends_with("_secret")
        || key.ends_with("_token")
}

/// Copy of `value` with every secret field replaced by [`MASK`]
pub fn mask_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if is_secret_key(k) && !v.is_null() {
                        Value::String(MASK.to_string())
                    } else {
                        mask_secrets(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}
