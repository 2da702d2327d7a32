//! Common types and errors for Folio
//!
//! This crate provides the notebook identity and shared error type used
//! across all Folio components.

pub mod sanitizer;
pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Core error types shared by Folio crates
#[derive(Error, Debug)]
pub enum FolioError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid notebook identity: {0}")]
    InvalidNotebook(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// An addressable peer: application id plus workspace name.
///
/// Stable for the lifetime of the peer. Used as a routing key and as the
/// seed of the CRDT actor id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Notebook {
    pub app: u16,
    pub workspace: String,
}

impl Notebook {
    pub fn new(app: u16, workspace: impl Into<String>) -> Self {
        Self {
            app,
            workspace: workspace.into(),
        }
    }

    /// Routing key, `"<app>/<workspace>"`
    pub fn key(&self) -> String {
        format!("{}/{}", self.app, self.workspace)
    }
}

impl fmt::Display for Notebook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.workspace)
    }
}

impl FromStr for Notebook {
    type Err = FolioError;

    fn from_str(s: &str) -> Result<Self> {
        let (app, workspace) = s
            .split_once('/')
            .ok_or_else(|| FolioError::InvalidNotebook(format!("expected <app>/<workspace>, got '{}'", s)))?;

        let app = app
            .parse::<u16>()
            .map_err(|e| FolioError::InvalidNotebook(format!("bad app id '{}': {}", app, e)))?;

        if workspace.is_empty() {
            return Err(FolioError::InvalidNotebook("workspace cannot be empty".to_string()));
        }

        Ok(Self::new(app, workspace))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FolioError>;

/// Exit code constants for the `folio` binary
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CONFIG_ERROR: i32 = 101;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notebook_key_roundtrip() {
        let notebook = Notebook::new(3, "research");
        assert_eq!(notebook.key(), "3/research");

        let parsed: Notebook = "3/research".parse().unwrap();
        assert_eq!(parsed, notebook);
    }

    #[test]
    fn test_notebook_workspace_may_contain_slash() {
        let parsed: Notebook = "1/team/alpha".parse().unwrap();
        assert_eq!(parsed.app, 1);
        assert_eq!(parsed.workspace, "team/alpha");
    }

    #[test]
    fn test_notebook_rejects_garbage() {
        assert!("research".parse::<Notebook>().is_err());
        assert!("x/research".parse::<Notebook>().is_err());
        assert!("2/".parse::<Notebook>().is_err());
    }

    #[test]
    fn test_notebook_json_shape() {
        let json = serde_json::to_value(Notebook::new(1, "main")).unwrap();
        assert_eq!(json, serde_json::json!({"app": 1, "workspace": "main"}));
    }
}
