use std::path::Path;
use std::process::{Command, Output};

use tracing_subscriber::{EnvFilter, fmt};

pub fn init_test_logging() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env().add_directive("omnid=debug".parse().unwrap()))
        .try_init();
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

/// Run the built `omnid` binary with an explicit config file so the
/// user's own configuration never leaks in.
pub fn run_omnid(config: &Path, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_omnid"));
    command.arg("--config").arg(config).args(args);
    for (key, value) in env {
        command.env(key, value);
    }
    command.output().expect("failed to run omnid")
}
