//! Integration tests for the PeerBox CLI commands
//!
//! These run the compiled binary with `PEERBOX_HOME` pointing at a temporary
//! directory and the passphrase supplied through the environment.

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const PASSPHRASE: &str = "correct horse";

fn peerbox(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_peerbox"))
        .args(args)
        .env("PEERBOX_HOME", home)
        .env("PEERBOX_PASSPHRASE", PASSPHRASE)
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "off")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Initializes an account and returns its fingerprint.
fn init(home: &Path, name: &str) -> String {
    let email = format!("{}@example.com", name.to_lowercase());
    let output = peerbox(home, &["init", "--name", name, "--email", &email]);
    assert!(output.status.success(), "init failed: {}", stderr(&output));
    assert!(stdout(&output).contains("PeerBox initialized"));

    let id = peerbox(home, &["id"]);
    assert!(id.status.success(), "id failed: {}", stderr(&id));
    stdout(&id).lines().next().unwrap().trim().to_string()
}

#[test]
fn test_cli_init_and_id() {
    let home = TempDir::new().unwrap();
    let fingerprint = init(home.path(), "Ann");
    assert_eq!(fingerprint.len(), 40);
    assert!(home.path().join("config.toml").exists());

    let id = stdout(&peerbox(home.path(), &["id"]));
    assert!(id.contains("Ann <ann@example.com>"));
    assert!(id.contains("(primary)"));
}

#[test]
fn test_cli_second_init_keeps_config() {
    let home = TempDir::new().unwrap();
    let fingerprint = init(home.path(), "Ann");

    let config_path = home.path().join("config.toml");
    let edited = std::fs::read_to_string(&config_path)
        .unwrap()
        .replace("listen_port = 41337", "listen_port = 5000");
    std::fs::write(&config_path, &edited).unwrap();

    let again = peerbox(home.path(), &["init", "--name", "Ann", "--email", "ann@example.com"]);
    assert!(!again.status.success());
    assert!(stderr(&again).contains("already exists"));

    let config = std::fs::read_to_string(&config_path).unwrap();
    assert!(config.contains("listen_port = 5000"));
    let id = stdout(&peerbox(home.path(), &["id"]));
    assert!(id.contains(&fingerprint));
}

#[test]
fn test_cli_requires_init() {
    let home = TempDir::new().unwrap();
    let output = peerbox(home.path(), &["id"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not initialized"));
}

#[test]
fn test_cli_wrong_passphrase_fails() {
    let home = TempDir::new().unwrap();
    init(home.path(), "Ann");

    let output = Command::new(env!("CARGO_BIN_EXE_peerbox"))
        .arg("id")
        .env("PEERBOX_HOME", home.path())
        .env("PEERBOX_PASSPHRASE", "wrong")
        .env("NO_COLOR", "1")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Error:"));
}

#[test]
fn test_cli_add_ls_cat() {
    let home = TempDir::new().unwrap();
    init(home.path(), "Ann");

    let source = home.path().join("notes.txt");
    std::fs::write(&source, "remember the milk").unwrap();
    let add = peerbox(home.path(), &["add", source.to_str().unwrap()]);
    assert!(add.status.success(), "add failed: {}", stderr(&add));
    assert!(stdout(&add).contains("notes.txt.pbx"));

    let ls = stdout(&peerbox(home.path(), &["ls"]));
    assert!(ls.contains("notes.txt.pbx"));

    let cat = peerbox(home.path(), &["cat", "notes.txt"]);
    assert!(cat.status.success(), "cat failed: {}", stderr(&cat));
    assert_eq!(stdout(&cat), "remember the milk");

    let rm = peerbox(home.path(), &["rm", "notes.txt"]);
    assert!(rm.status.success());
    assert!(stdout(&peerbox(home.path(), &["ls"])).contains("No files."));
}

#[test]
fn test_cli_exchange_keys_and_follow() {
    let ann_home = TempDir::new().unwrap();
    let bob_home = TempDir::new().unwrap();
    init(ann_home.path(), "Ann");
    let bob = init(bob_home.path(), "Bob");

    let key_file = ann_home.path().join("bob.asc");
    let export = peerbox(bob_home.path(), &["export", "--output", key_file.to_str().unwrap()]);
    assert!(export.status.success(), "export failed: {}", stderr(&export));

    let import = peerbox(ann_home.path(), &["import", key_file.to_str().unwrap(), "--group", "family"]);
    assert!(import.status.success(), "import failed: {}", stderr(&import));
    assert!(stdout(&import).contains(&bob));

    let friends = stdout(&peerbox(ann_home.path(), &["friends"]));
    assert!(friends.contains("Bob <bob@example.com>"));
    assert!(friends.contains("not following"));

    let follow = peerbox(ann_home.path(), &["follow", &bob, "--address", "127.0.0.1:41337"]);
    assert!(follow.status.success(), "follow failed: {}", stderr(&follow));
    let config = std::fs::read_to_string(ann_home.path().join("config.toml")).unwrap();
    assert!(config.contains(&bob));
    assert!(stdout(&peerbox(ann_home.path(), &["friends"])).contains("[following]"));

    let forget = peerbox(ann_home.path(), &["forget", &bob]);
    assert!(forget.status.success(), "forget failed: {}", stderr(&forget));
    assert!(stdout(&peerbox(ann_home.path(), &["friends"])).contains("No friends yet"));
}

#[test]
fn test_cli_rejects_bad_fingerprint() {
    let home = TempDir::new().unwrap();
    init(home.path(), "Ann");
    let output = peerbox(home.path(), &["follow", "not-a-fingerprint"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("is not a fingerprint"));
}
