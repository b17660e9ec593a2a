//! Shared types and utilities for the OmniProjectSync remote agent.
//!
//! The daemon (`omnid`) builds on:
//! - [`path_guard`]: the policy every remote-supplied path passes through
//! - [`protocol`]: tagged frames for the interactive session channel
//! - [`types`]: registry, manifest and ledger data model
//! - [`config`] and [`logging`]: ambient setup

pub mod config;
pub mod errors;
pub mod logging;
pub mod path_guard;
pub mod protocol;
pub mod types;
pub mod util;

pub use config::{AgentConfig, ConfigError, EnvParser};
pub use errors::AgentError;
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use path_guard::{PathDenial, PathSafetyPolicy, default_deny_roots};
pub use protocol::{ClientMessage, ServerMessage, is_system_project};
pub use types::{
    ProjectManifest, ProjectRecord, ProjectStatus, RegistryMap, RestoreMap, restore_id,
};
pub use util::{mask_sensitive_command, truncate_output, validate_project_name};
