// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-driven runtime configuration (spec §6.4).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::Serialize;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("missing required environment variable {var}")]
    MissingRequired {
        /// Name of the missing variable.
        var: &'static str,
    },
    /// An environment variable held a value that could not be parsed.
    #[error("environment variable {var} has invalid value {value:?}: {reason}")]
    InvalidValue {
        /// Name of the offending variable.
        var: &'static str,
        /// The raw value that failed to parse.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Semantic validation failed after all variables were parsed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Top-level runtime configuration, assembled entirely from environment
/// variables (spec §6.4 — there is no config file in v1).
#[derive(Debug, Clone, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ReceiptGateConfig {
    /// `RECEIPTGATE_DATABASE_URL`. `sqlite:...` or `postgres://...`.
    pub database_url: String,
    /// `RECEIPTGATE_API_KEY`. Required unless `allow_insecure_dev` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// `RECEIPTGATE_ALLOW_INSECURE_DEV`. Default `false`.
    pub allow_insecure_dev: bool,
    /// `RECEIPTGATE_AUTO_MIGRATE_ON_STARTUP`. Default `false`.
    pub auto_migrate_on_startup: bool,
    /// `RECEIPTGATE_RECEIPT_BODY_MAX_BYTES`. Default 262144 (256 KiB).
    pub receipt_body_max_bytes: usize,
    /// `RECEIPTGATE_ENABLE_GRAPH_LAYER`. Default `false`.
    pub enable_graph_layer: bool,
    /// `RECEIPTGATE_ENABLE_SEMANTIC_LAYER`. Default `false`.
    pub enable_semantic_layer: bool,
    /// `RECEIPTGATE_TOOL_CALL_TIMEOUT_MS`. Default 30000 (30s). Deadline a
    /// single RPC tool call is allowed to run before the server reports
    /// [`ErrorKind::Timeout`](receiptgate_error::ErrorKind::Timeout).
    pub tool_call_timeout_ms: u64,
}

const DEFAULT_BODY_MAX_BYTES: usize = 262_144;
const DEFAULT_TOOL_CALL_TIMEOUT_MS: u64 = 30_000;

const VAR_DATABASE_URL: &str = "RECEIPTGATE_DATABASE_URL";
const VAR_API_KEY: &str = "RECEIPTGATE_API_KEY";
const VAR_ALLOW_INSECURE_DEV: &str = "RECEIPTGATE_ALLOW_INSECURE_DEV";
const VAR_AUTO_MIGRATE: &str = "RECEIPTGATE_AUTO_MIGRATE_ON_STARTUP";
const VAR_BODY_MAX_BYTES: &str = "RECEIPTGATE_RECEIPT_BODY_MAX_BYTES";
const VAR_ENABLE_GRAPH: &str = "RECEIPTGATE_ENABLE_GRAPH_LAYER";
const VAR_ENABLE_SEMANTIC: &str = "RECEIPTGATE_ENABLE_SEMANTIC_LAYER";
const VAR_TOOL_CALL_TIMEOUT_MS: &str = "RECEIPTGATE_TOOL_CALL_TIMEOUT_MS";

fn read_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var,
                value,
                reason: "expected a boolean (true/false/1/0/yes/no/on/off)".into(),
            }),
        },
    }
}

/// Load configuration from the process environment.
///
/// # Errors
///
/// Returns [`ConfigError::MissingRequired`] if `RECEIPTGATE_DATABASE_URL` is
/// unset, or if `RECEIPTGATE_API_KEY` is unset and
/// `RECEIPTGATE_ALLOW_INSECURE_DEV` is not truthy. Returns
/// [`ConfigError::InvalidValue`] for any variable that fails to parse.
pub fn load_from_env() -> Result<ReceiptGateConfig, ConfigError> {
    let database_url = std::env::var(VAR_DATABASE_URL).map_err(|_| ConfigError::MissingRequired {
        var: VAR_DATABASE_URL,
    })?;

    let allow_insecure_dev = read_bool(VAR_ALLOW_INSECURE_DEV, false)?;
    let api_key = std::env::var(VAR_API_KEY).ok();
    if api_key.is_none() && !allow_insecure_dev {
        return Err(ConfigError::MissingRequired { var: VAR_API_KEY });
    }

    let auto_migrate_on_startup = read_bool(VAR_AUTO_MIGRATE, false)?;
    let enable_graph_layer = read_bool(VAR_ENABLE_GRAPH, false)?;
    let enable_semantic_layer = read_bool(VAR_ENABLE_SEMANTIC, false)?;

    let receipt_body_max_bytes = match std::env::var(VAR_BODY_MAX_BYTES) {
        Err(_) => DEFAULT_BODY_MAX_BYTES,
        Ok(raw) => raw.trim().parse::<usize>().map_err(|e| ConfigError::InvalidValue {
            var: VAR_BODY_MAX_BYTES,
            value: raw,
            reason: e.to_string(),
        })?,
    };

    let tool_call_timeout_ms = match std::env::var(VAR_TOOL_CALL_TIMEOUT_MS) {
        Err(_) => DEFAULT_TOOL_CALL_TIMEOUT_MS,
        Ok(raw) => raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            var: VAR_TOOL_CALL_TIMEOUT_MS,
            value: raw,
            reason: e.to_string(),
        })?,
    };

    let config = ReceiptGateConfig {
        database_url,
        api_key,
        allow_insecure_dev,
        auto_migrate_on_startup,
        receipt_body_max_bytes,
        enable_graph_layer,
        enable_semantic_layer,
        tool_call_timeout_ms,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ReceiptGateConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.database_url.trim().is_empty() {
        errors.push("database_url must not be empty".into());
    } else if !(config.database_url.starts_with("sqlite:")
        || config.database_url.starts_with("postgres://")
        || config.database_url.starts_with("postgresql://"))
    {
        errors.push(format!(
            "database_url {:?} must start with 'sqlite:', 'postgres://', or 'postgresql://'",
            config.database_url
        ));
    }

    if config.receipt_body_max_bytes == 0 {
        errors.push("receipt_body_max_bytes must be greater than zero".into());
    }

    if config.tool_call_timeout_ms == 0 {
        errors.push("tool_call_timeout_ms must be greater than zero".into());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        VAR_DATABASE_URL,
        VAR_API_KEY,
        VAR_ALLOW_INSECURE_DEV,
        VAR_AUTO_MIGRATE,
        VAR_BODY_MAX_BYTES,
        VAR_ENABLE_GRAPH,
        VAR_ENABLE_SEMANTIC,
        VAR_TOOL_CALL_TIMEOUT_MS,
    ];

    fn clear_all() {
        for var in ALL_VARS {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let err = load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { var } if var == VAR_DATABASE_URL));
    }

    #[test]
    fn missing_api_key_without_insecure_dev_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { std::env::set_var(VAR_DATABASE_URL, "sqlite:///tmp/x.db") };
        let err = load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { var } if var == VAR_API_KEY));
        clear_all();
    }

    #[test]
    fn insecure_dev_allows_missing_api_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var(VAR_DATABASE_URL, "sqlite:///tmp/x.db");
            std::env::set_var(VAR_ALLOW_INSECURE_DEV, "true");
        }
        let cfg = load_from_env().unwrap();
        assert!(cfg.api_key.is_none());
        assert!(cfg.allow_insecure_dev);
        clear_all();
    }

    #[test]
    fn defaults_are_applied() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var(VAR_DATABASE_URL, "postgres://localhost/db");
            std::env::set_var(VAR_API_KEY, "secret");
        }
        let cfg = load_from_env().unwrap();
        assert_eq!(cfg.receipt_body_max_bytes, DEFAULT_BODY_MAX_BYTES);
        assert!(!cfg.auto_migrate_on_startup);
        assert!(!cfg.enable_graph_layer);
        assert!(!cfg.enable_semantic_layer);
        assert_eq!(cfg.tool_call_timeout_ms, DEFAULT_TOOL_CALL_TIMEOUT_MS);
        clear_all();
    }

    #[test]
    fn custom_tool_call_timeout_is_parsed() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var(VAR_DATABASE_URL, "sqlite:///tmp/x.db");
            std::env::set_var(VAR_API_KEY, "secret");
            std::env::set_var(VAR_TOOL_CALL_TIMEOUT_MS, "5000");
        }
        let cfg = load_from_env().unwrap();
        assert_eq!(cfg.tool_call_timeout_ms, 5000);
        clear_all();
    }

    #[test]
    fn zero_tool_call_timeout_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var(VAR_DATABASE_URL, "sqlite:///tmp/x.db");
            std::env::set_var(VAR_API_KEY, "secret");
            std::env::set_var(VAR_TOOL_CALL_TIMEOUT_MS, "0");
        }
        let err = load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
        clear_all();
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var(VAR_DATABASE_URL, "sqlite:///tmp/x.db");
            std::env::set_var(VAR_API_KEY, "secret");
            std::env::set_var(VAR_AUTO_MIGRATE, "sometimes");
        }
        let err = load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var, .. } if var == VAR_AUTO_MIGRATE));
        clear_all();
    }

    #[test]
    fn invalid_database_url_scheme_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var(VAR_DATABASE_URL, "mysql://localhost/db");
            std::env::set_var(VAR_API_KEY, "secret");
        }
        let err = load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
        clear_all();
    }

    #[test]
    fn zero_body_max_bytes_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var(VAR_DATABASE_URL, "sqlite:///tmp/x.db");
            std::env::set_var(VAR_API_KEY, "secret");
            std::env::set_var(VAR_BODY_MAX_BYTES, "0");
        }
        let err = load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
        clear_all();
    }

    #[test]
    fn custom_body_max_bytes_is_parsed() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var(VAR_DATABASE_URL, "sqlite:///tmp/x.db");
            std::env::set_var(VAR_API_KEY, "secret");
            std::env::set_var(VAR_BODY_MAX_BYTES, "1024");
        }
        let cfg = load_from_env().unwrap();
        assert_eq!(cfg.receipt_body_max_bytes, 1024);
        clear_all();
    }
}
