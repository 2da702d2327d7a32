//! CLI command builders for tests
//!
//! Pre-configured command builders with clean environments so user settings
//! and log noise never leak into assertions.

use assert_cmd::Command;

/// Get a Command for the `folio` binary with clean environment
///
/// Sets `RUST_LOG=error` and removes `FOLIO_WORKSPACE`.
#[allow(deprecated)]
pub fn folio_command() -> Command {
    command_for("folio")
}

/// Get a Command for a specific binary with clean environment
#[allow(deprecated)]
pub fn command_for(bin_name: &str) -> Command {
    let mut cmd = Command::cargo_bin(bin_name)
        .unwrap_or_else(|_| panic!("Failed to find {} binary", bin_name));
    cmd.env("RUST_LOG", "error");
    cmd.env_remove("FOLIO_WORKSPACE");
    cmd
}
