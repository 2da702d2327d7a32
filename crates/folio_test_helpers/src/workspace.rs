//! Workspace initialization utilities for tests

use assert_fs::TempDir;
use std::fs;

/// Create a temporary directory for testing
///
/// The directory is removed when the `TempDir` is dropped.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Initialize a Folio workspace in a temp directory
///
/// Creates `.folio/` and `.folio/pages/`.
///
/// # Example
///
/// ```rust
/// use folio_test_helpers::workspace::init_workspace;
///
/// let workspace = init_workspace();
/// assert!(workspace.path().join(".folio/pages").exists());
/// ```
pub fn init_workspace() -> TempDir {
    let temp = temp_dir();
    fs::create_dir_all(temp.path().join(".folio/pages"))
        .expect("Failed to create .folio directory");
    temp
}

/// Create a workspace whose `.folio/config.toml` holds `config`
pub fn workspace_with_config(config: &str) -> TempDir {
    let workspace = init_workspace();
    fs::write(workspace.path().join(".folio/config.toml"), config)
        .expect("Failed to write config.toml");
    workspace
}

/// Write `content` to `name` inside `workspace`, creating parents
pub fn write_file(workspace: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let file_path = workspace.path().join(name);
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(&file_path, content).expect("Failed to write file");
    file_path
}
