//! Unified error type for the orchestrator core
//!
//! Every error surfaced by the library maps onto one of the kinds below.
//! Load-time kinds (configuration, template, plugin, dependency) are fatal
//! before any work begins; runtime kinds fail the owning graph node and let
//! the scheduler continue with whatever is still unblocked.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Standard result type for library operations
pub type GardenResult<T> = Result<T, GardenError>;

/// The unified error type for the entire orchestrator
#[derive(Error, Debug)]
pub enum GardenError {
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        /// File and key the error points at, when known
        path: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        hint: Option<String>,
    },

    #[error("Template error: {message}")]
    Template {
        message: String,
        /// The offending `${...}` expression
        expression: Option<String>,
        /// Keys that were being resolved when the error occurred
        trail: Vec<String>,
        hint: Option<String>,
    },

    #[error("Plugin error: {message}")]
    Plugin {
        message: String,
        plugin_name: Option<String>,
        hint: Option<String>,
    },

    #[error("Dependency error: {message}")]
    Dependency {
        message: String,
        /// Full cycle path when the error is a cycle, e.g. `a <- b <- a`
        cycle: Option<String>,
        hint: Option<String>,
    },

    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        node_key: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Provider '{provider}' is not ready: {message}")]
    NotReady { provider: String, message: String },

    #[error("Cancelled: {message}")]
    Cancelled { message: String },

    #[error("Timed out after {seconds}s: {message}")]
    Timeout { message: String, seconds: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GardenError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            path: None,
            source: None,
            hint: None,
        }
    }

    pub fn config_at(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            path: Some(path.into()),
            source: None,
            hint: None,
        }
    }

    pub fn template(message: impl Into<String>) -> Self {
        Self::Template {
            message: message.into(),
            expression: None,
            trail: Vec::new(),
            hint: None,
        }
    }

    pub fn plugin(message: impl Into<String>) -> Self {
        Self::Plugin {
            message: message.into(),
            plugin_name: None,
            hint: None,
        }
    }

    pub fn plugin_named(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            message: message.into(),
            plugin_name: Some(plugin.into()),
            hint: None,
        }
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::Dependency {
            message: message.into(),
            cycle: None,
            hint: None,
        }
    }

    /// A dependency cycle, rendered as the full chain `a <- b <- a`
    pub fn cycle(message: impl Into<String>, chain: &[String]) -> Self {
        Self::Dependency {
            message: message.into(),
            cycle: Some(chain.join(" <- ")),
            hint: Some("break the cycle by removing one of the references".to_string()),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            node_key: None,
            source: None,
        }
    }

    pub fn runtime_for(node_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            node_key: Some(node_key.into()),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach an actionable hint where the variant carries one
    pub fn with_hint(mut self, hint_text: impl Into<String>) -> Self {
        match &mut self {
            Self::Configuration { hint, .. }
            | Self::Template { hint, .. }
            | Self::Plugin { hint, .. }
            | Self::Dependency { hint, .. } => *hint = Some(hint_text.into()),
            _ => {}
        }
        self
    }

    /// Process exit code per the CLI contract: 1 for handled failures,
    /// 2 for internal invariant violations.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Internal { .. } => 2,
            _ => 1,
        }
    }

    /// The taxonomy kind, mostly for log fields and aggregate reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Template { .. } => ErrorKind::Template,
            Self::Plugin { .. } => ErrorKind::Plugin,
            Self::Dependency { .. } => ErrorKind::Dependency,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Runtime,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Io { .. } => ErrorKind::Runtime,
        }
    }

    /// Render the error with path, cause and hint for terminal output
    pub fn detail(&self) -> String {
        let mut out = self.to_string();
        match self {
            Self::Configuration { path: Some(p), .. } => {
                out.push_str(&format!("\n  at: {}", p));
            }
            Self::Template {
                expression, trail, ..
            } => {
                if let Some(expr) = expression {
                    out.push_str(&format!("\n  expression: {}", expr));
                }
                if !trail.is_empty() {
                    out.push_str(&format!("\n  while resolving: {}", trail.join(" -> ")));
                }
            }
            Self::Dependency { cycle: Some(c), .. } => {
                out.push_str(&format!("\n  cycle: {}", c));
            }
            _ => {}
        }
        if let Some(source) = std::error::Error::source(self) {
            out.push_str(&format!("\n  caused by: {}", source));
        }
        if let Some(hint) = self.hint() {
            out.push_str(&format!("\n  hint: {}", hint));
        }
        out
    }

    fn hint(&self) -> Option<&str> {
        match self {
            Self::Configuration { hint, .. }
            | Self::Template { hint, .. }
            | Self::Plugin { hint, .. }
            | Self::Dependency { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

/// Error taxonomy kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Template,
    Plugin,
    Dependency,
    Runtime,
    NotReady,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Template => "template",
            Self::Plugin => "plugin",
            Self::Dependency => "dependency",
            Self::Runtime => "runtime",
            Self::NotReady => "not-ready",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl From<anyhow::Error> for GardenError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<GardenError>() {
            Ok(garden) => garden,
            Err(other) => GardenError::Runtime {
                message: other.to_string(),
                node_key: None,
                source: Some(other.into()),
            },
        }
    }
}

impl From<serde_yaml::Error> for GardenError {
    fn from(err: serde_yaml::Error) -> Self {
        GardenError::Configuration {
            message: format!("invalid YAML: {}", err),
            path: None,
            source: Some(Box::new(err)),
            hint: None,
        }
    }
}

impl From<serde_json::Error> for GardenError {
    fn from(err: serde_json::Error) -> Self {
        GardenError::Configuration {
            message: format!("invalid JSON: {}", err),
            path: None,
            source: Some(Box::new(err)),
            hint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(GardenError::config("bad field").exit_code(), 1);
        assert_eq!(GardenError::cancelled("interrupt").exit_code(), 1);
        assert_eq!(GardenError::internal("broken invariant").exit_code(), 2);
    }

    #[test]
    fn cycle_renders_full_chain() {
        let chain = vec![
            "test-a".to_string(),
            "test-b".to_string(),
            "test-a".to_string(),
        ];
        let err = GardenError::cycle("circular provider references", &chain);
        assert!(err.detail().contains("test-a <- test-b <- test-a"));
    }

    #[test]
    fn hint_shows_in_detail() {
        let err = GardenError::config("unknown module type 'containr'")
            .with_hint("did you mean 'container'?");
        assert!(err.detail().contains("hint: did you mean 'container'?"));
    }

    #[test]
    fn anyhow_roundtrip_preserves_kind() {
        let original: anyhow::Error = GardenError::cancelled("stop").into();
        let back: GardenError = original.into();
        assert_eq!(back.kind(), ErrorKind::Cancelled);
    }
}
