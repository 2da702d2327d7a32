//! CLI integration tests

use folio_test_helpers::prelude::*;
use folio_test_helpers::workspace::write_file;
use predicates::prelude::*;

const GREETING: &str = r#"{
  "content": "hello world",
  "annotations": [
    { "start": 0, "end": 11, "type": "block", "level": 1, "viewType": "bullet" },
    { "start": 0, "end": 5, "type": "bold" }
  ]
}"#;

#[test]
fn test_folio_help() {
    folio_command()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("shared-page sync"));
}

#[test]
fn test_folio_version() {
    folio_command()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_init_writes_config() {
    let temp = temp_dir();
    folio_command()
        .current_dir(temp.path())
        .args(["init", "--workspace", "lab", "--app", "7"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Workspace initialized as 7/lab"));

    let config = folio_config::Config::load(temp.path()).unwrap();
    assert_eq!(config.notebook().unwrap(), folio_common::Notebook::new(7, "lab"));
    assert!(temp.path().join(".folio/pages").exists());
}

#[test]
fn test_init_is_idempotent() {
    let temp = workspace_with_config("[notebook]\nworkspace = \"kept\"\n");
    folio_command()
        .current_dir(temp.path())
        .arg("init")
        .assert()
        .success()
        .stderr(predicate::str::contains("already exists"));

    let config = folio_config::Config::load(temp.path()).unwrap();
    assert_eq!(config.notebook.workspace, "kept");
}

#[test]
fn test_render_schema() {
    let temp = temp_dir();
    let file = write_file(&temp, "page.json", GREETING);
    folio_command()
        .arg("render")
        .arg(&file)
        .assert()
        .success()
        .stderr(stderr_not_contains(&["ERROR", "WARN"]))
        .stdout(predicate::str::contains(
            "<ul data-level=\"1\"><li><strong>hello</strong> world</li></ul>",
        ));
}

#[test]
fn test_render_rejects_invalid_schema() {
    let temp = temp_dir();
    let file = write_file(
        &temp,
        "bad.json",
        r#"{"content": "hi", "annotations": [{"start": 0, "end": 9, "type": "bold"}]}"#,
    );
    folio_command()
        .arg("render")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed validation"));
}

#[test]
fn test_parse_markup() {
    let temp = temp_dir();
    let file = write_file(&temp, "page.html", "<em>quiet</em> please");
    folio_command()
        .arg("parse")
        .arg(&file)
        .assert()
        .success()
        .stdout(schema_json())
        .stdout(predicate::str::contains("\"italics\""))
        .stdout(predicate::str::contains("quiet please"));
}

#[test]
fn test_inline_text() {
    folio_command()
        .args(["inline", "see **this** [doc](https://folio.dev)"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"bold\""))
        .stdout(predicate::str::contains("\"href\": \"https://folio.dev\""));
}

#[test]
fn test_inline_ambiguous_emphasis_fails() {
    folio_command()
        .args(["inline", "2*3 **bold** 4*5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ambiguous emphasis"));
}

#[test]
fn test_tree_nests_annotations() {
    let temp = temp_dir();
    let file = write_file(&temp, "page.json", GREETING);
    folio_command()
        .arg("tree")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("block [0, 11) \"hello world\"\n  bold [0, 5) \"hello\""));
}

#[test]
fn test_connect_requires_notebook_identity() {
    let temp = workspace_with_config("[relay]\nurl = \"ws://127.0.0.1:9\"\n");
    folio_command()
        .current_dir(temp.path())
        .arg("connect")
        .assert()
        .failure()
        .stderr(predicate::str::contains("workspace cannot be empty"));
}

#[test]
fn test_connect_rejects_bad_peer() {
    let temp = workspace_with_config("[notebook]\nworkspace = \"lab\"\n");
    folio_command()
        .current_dir(temp.path())
        .args(["connect", "--peer", "nobody"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid --peer 'nobody'"));
}
