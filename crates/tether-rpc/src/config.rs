//! Process configuration with layered loading and environment variable interpolation.

use std::collections::HashMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    value::{Dict, Map, Value},
    Error as FigmentError, Figment, Metadata, Profile, Provider,
};
use serde::Deserialize;
use thiserror::Error;

use crate::invoker::InvokerConfig;
use crate::routing::RoutingConfig;

/// Errors that can occur when loading or parsing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("Configuration error: {0}")]
    Figment(Box<FigmentError>),

    /// The specified configuration file was not found.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration is invalid or malformed.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Top-level configuration of a tether process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TetherConfig {
    /// Named invokers.
    #[serde(default)]
    pub invokers: HashMap<String, InvokerConfig>,

    /// Static routes for the routed channel.
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_owned()
}

impl TetherConfig {
    /// Loads configuration from the default path (`tether.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("tether.toml")
    }

    /// Loads configuration from the specified file path.
    ///
    /// Environment variables prefixed with `TETHER_` override file settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new()
            .merge(InterpolatingToml::file(path)?)
            .merge(Env::prefixed("TETHER_").split("__"));

        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(InterpolatingToml::string(content));
        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Returns the invoker named `name`.
    pub fn invoker(&self, name: &str) -> Result<&InvokerConfig, ConfigError> {
        self.invokers
            .get(name)
            .ok_or_else(|| ConfigError::Invalid(format!("no invoker named {name}")))
    }
}

struct EnvVarInterpolator;

impl EnvVarInterpolator {
    fn interpolate_value(value: Value) -> Value {
        match value {
            Value::String(_, s) => Value::from(Self::interpolate_string(&s)),
            Value::Dict(tag, dict) => {
                let dict: Dict = dict
                    .into_iter()
                    .map(|(k, v)| (k, Self::interpolate_value(v)))
                    .collect();
                Value::Dict(tag, dict)
            }
            Value::Array(tag, arr) => {
                Value::Array(tag, arr.into_iter().map(Self::interpolate_value).collect())
            }
            other => other,
        }
    }

    /// Expands `${VAR}` and `${VAR:-fallback}`. Unset variables without a
    /// fallback expand to nothing.
    fn interpolate_string(s: &str) -> String {
        let mut result = String::with_capacity(s.len());
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();
                let expr: String = chars.by_ref().take_while(|ch| *ch != '}').collect();
                let (var_name, fallback) = match expr.split_once(":-") {
                    Some((name, fallback)) => (name, Some(fallback)),
                    None => (expr.as_str(), None),
                };
                match (std::env::var(var_name), fallback) {
                    (Ok(val), _) => result.push_str(&val),
                    (Err(_), Some(fallback)) => result.push_str(fallback),
                    (Err(_), None) => {}
                }
            } else {
                result.push(c);
            }
        }

        result
    }
}

/// TOML configuration provider with environment variable interpolation.
///
/// Supports `${VAR_NAME}` syntax for embedding environment variable values.
pub struct InterpolatingToml {
    content: String,
}

impl InterpolatingToml {
    pub fn file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|_| ConfigError::FileNotFound(path.as_ref().display().to_string()))?;
        Ok(Self { content })
    }

    pub fn string(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl Provider for InterpolatingToml {
    fn metadata(&self) -> Metadata {
        Metadata::named("Interpolating TOML")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, FigmentError> {
        let base = Toml::string(&self.content).data()?;
        Ok(base
            .into_iter()
            .map(|(profile, dict)| {
                let dict: Dict = dict
                    .into_iter()
                    .map(|(k, v)| (k, EnvVarInterpolator::interpolate_value(v)))
                    .collect();
                (profile, dict)
            })
            .collect())
    }
}
