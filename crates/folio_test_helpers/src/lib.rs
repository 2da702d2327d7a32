//! Shared test utilities for Folio test suites
//!
//! # Modules
//!
//! - [`workspace`]: Temp directories and `.folio` workspace setup
//! - [`cli`]: Command builders with pre-configured environments
//! - [`logging`]: Test logging configuration
//! - [`assertions`]: Domain-specific assertion helpers
//! - [`wait`]: Polling helpers for asynchronous convergence
//!
//! # Example
//!
//! ```rust,no_run
//! use folio_test_helpers::prelude::*;
//!
//! let workspace = init_workspace();
//! folio_command()
//!     .current_dir(workspace.path())
//!     .arg("--help")
//!     .assert()
//!     .success();
//! ```

pub mod assertions;
pub mod cli;
pub mod logging;
pub mod wait;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::cli::{command_for, folio_command};
    pub use crate::logging::{init_test_logging, suppress_logs};
    pub use crate::wait::wait_until;
    pub use crate::workspace::{init_workspace, temp_dir, workspace_with_config};
}
