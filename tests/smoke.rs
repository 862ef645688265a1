//! Smoke tests -- verify the binary runs and every subcommand is wired.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("printdesk")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("load-test the print service"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("printdesk")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("printdesk"));
}

#[test]
fn test_types_list_subcommand_exists() {
    Command::cargo_bin("printdesk")
        .unwrap()
        .args(["types", "list", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--owner"));
}

#[test]
fn test_files_upload_subcommand_exists() {
    Command::cargo_bin("printdesk")
        .unwrap()
        .args(["files", "upload", "--help"])
        .assert()
        .success();
}

#[test]
fn test_load_test_subcommand_exists() {
    Command::cargo_bin("printdesk")
        .unwrap()
        .args(["load-test", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--window"));
}

#[test]
fn test_bad_config_file_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("printdesk.toml");
    std::fs::write(&path, "[load_test]\nwindow_secs = 2\n").unwrap();

    Command::cargo_bin("printdesk")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid config file"));
}

#[test]
fn test_unreachable_service_fails_cleanly() {
    Command::cargo_bin("printdesk")
        .unwrap()
        .args(["--api", "http://127.0.0.1:9", "config"])
        .env_remove("PRINTDESK_CONFIG")
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to fetch service configuration"));
}

#[test]
fn test_unreadable_env_config_is_reported() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("printdesk.toml");
    std::fs::write(&path, "[api\nbase_url = ").unwrap();

    Command::cargo_bin("printdesk")
        .unwrap()
        .args(["--api", "http://127.0.0.1:9", "config"])
        .env("PRINTDESK_CONFIG", &path)
        .env_remove("RUST_LOG")
        .assert()
        .failure()
        .stderr(predicates::str::contains("PRINTDESK_CONFIG set but file could not be loaded"));
}

#[test]
fn test_files_download_subcommand_exists() {
    Command::cargo_bin("printdesk")
        .unwrap()
        .args(["files", "download", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--out"));
}
