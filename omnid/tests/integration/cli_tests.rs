use std::process::Command;

use omni_common::AgentConfig;
use tempfile::TempDir;

use super::common::{init_test_logging, run_omnid};

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("agent.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_help_lists_flags() {
    init_test_logging();
    crate::test_log!("TEST START: test_help_lists_flags");

    let output = Command::new(env!("CARGO_BIN_EXE_omnid"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--config", "--bind", "--port", "--workspace-root", "--backup-root", "--print-config"] {
        assert!(stdout.contains(flag), "help is missing {flag}:\n{stdout}");
    }

    crate::test_log!("TEST PASS: test_help_lists_flags");
}

#[test]
fn test_version_matches_package() {
    init_test_logging();
    let output = Command::new(env!("CARGO_BIN_EXE_omnid"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_print_config_layers_file_env_and_flags() {
    init_test_logging();
    crate::test_log!("TEST START: test_print_config_layers_file_env_and_flags");

    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    let config = write_config(
        &dir,
        "[server]\nport = 1234\nbind_host = \"0.0.0.0\"\n\n[projects]\nhidden = [\"Scratch\"]\n",
    );

    let output = run_omnid(
        &config,
        &["--print-config", "--port", "9999", "--workspace-root", work.to_str().unwrap()],
        &[
            ("OMNI_ACCESS_TOKEN", "super-secret-token"),
            ("OMNI_BIND_HOST", "127.0.0.2"),
        ],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("super-secret-token"));

    let printed: AgentConfig = toml::from_str(&stdout).unwrap();
    assert_eq!(printed.auth.token, "***");
    assert_eq!(printed.server.port, 9999);
    assert_eq!(printed.server.bind_host, "127.0.0.2");
    assert_eq!(printed.paths.workspace_root, work);
    assert_eq!(printed.projects.hidden, vec!["Scratch".to_string()]);

    crate::test_log!("TEST PASS: test_print_config_layers_file_env_and_flags");
}

#[test]
fn test_invalid_environment_is_reported() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    let output = run_omnid(
        &config,
        &["--print-config"],
        &[("OMNI_PORT", "not-a-port"), ("OMNI_PEER_ENABLED", "maybe")],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("OMNI_PORT"), "{stderr}");
    assert!(stderr.contains("OMNI_PEER_ENABLED"), "{stderr}");
}

#[test]
fn test_malformed_config_file_fails() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[server\nport = ");

    let output = run_omnid(&config, &["--print-config"], &[]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to parse config file"));
}
