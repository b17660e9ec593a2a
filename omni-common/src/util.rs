//! Shared helpers for the agent.

use std::path::{Component, Path};

use crate::errors::AgentError;
use crate::path_guard::PathDenial;

/// Maximum characters returned by one-shot command execution.
pub const MAX_COMMAND_OUTPUT: usize = 20_000;
const TRUNCATION_MARKER: &str = "\n...truncated...";

/// Keys whose values are replaced with `***` before a command is logged.
const SECRET_KEYS: &[&str] = &[
    "OMNI_ACCESS_TOKEN=",
    "ACCESS_TOKEN=",
    "AUTH_TOKEN=",
    "API_KEY=",
    "SECRET=",
    "PASSWORD=",
    "TOKEN=",
    "--token ",
    "--token=",
    "--password ",
    "--password=",
    "X-Omni-Token: ",
    "Bearer ",
    "token=",
];

/// Length of the value starting at `s`. A value that opens with a quote runs
/// to the matching quote; otherwise it ends at whitespace, `&` or a quote.
fn value_len(s: &str) -> usize {
    let mut len = 0;
    let mut quote = None;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if let Some(q) = quote {
            if c == q {
                quote = None;
            }
        } else if c == '"' || c == '\'' {
            if len > 0 {
                break;
            }
            quote = Some(c);
        } else if c.is_whitespace() || c == '&' {
            break;
        }
        len += c.len_utf8();
    }
    len
}

/// Mask tokens and passwords in a command line before it reaches the logs.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let mut result = cmd.to_string();
    for key in SECRET_KEYS {
        let mut from = 0;
        while let Some(found) = result[from..].find(key) {
            let value_start = from + found + key.len();
            let value_end = value_start + value_len(&result[value_start..]);
            if value_end == value_start || &result[value_start..value_end] == "***" {
                from = value_end;
                continue;
            }
            result.replace_range(value_start..value_end, "***");
            from = value_start + 3;
        }
    }
    result
}

/// Cap command output at [`MAX_COMMAND_OUTPUT`] characters.
pub fn truncate_output(output: String) -> String {
    match output.char_indices().nth(MAX_COMMAND_OUTPUT) {
        Some((cut, _)) => {
            let mut truncated = output[..cut].to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => output,
    }
}

/// A project name must be exactly one normal path component.
pub fn validate_project_name(name: &str) -> Result<(), AgentError> {
    let unsafe_name = || AgentError::UnsafePath {
        path: Path::new(name).to_path_buf(),
        reason: PathDenial::OutsideAllowedRoots,
    };
    if name.trim().is_empty() {
        return Err(AgentError::InvalidRequest("project name is empty".into()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(unsafe_name());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(unsafe_name()),
    }
}

/// Fresh random access token (64 hex characters).
pub fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}
