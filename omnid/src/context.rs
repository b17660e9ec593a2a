//! Process-wide agent state, built once and shared by every handler.

use std::sync::Arc;
use std::time::Instant;

use omni_common::{AgentConfig, AgentError, PathSafetyPolicy};

use crate::auth::AuthGate;
use crate::events::EventBus;
use crate::locks::ProjectLocks;
use crate::peer::PeerClient;
use crate::registry::ProjectRegistry;
use crate::sessions::SessionTable;
use crate::software::{PackageManager, Winget};

pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub guard: PathSafetyPolicy,
    pub registry: ProjectRegistry,
    pub locks: ProjectLocks,
    pub sessions: SessionTable,
    pub events: EventBus,
    /// `None` when software provisioning is disabled.
    pub packages: Option<Arc<dyn PackageManager>>,
    pub peer: PeerClient,
    pub auth: AuthGate,
    pub started_at: Instant,
    pub version: &'static str,
    pub pid: u32,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let guard = config.path_policy();
        let registry = ProjectRegistry::new(
            config.paths.workspace_root.clone(),
            config.paths.backup_root.clone(),
            &config.state_dir(),
        );
        let packages: Option<Arc<dyn PackageManager>> = if config.software.enabled {
            Some(Arc::new(Winget))
        } else {
            None
        };
        let peer = PeerClient::new(&config.peer, config.auth.token.clone())?;
        let auth = AuthGate::new(config.auth.token.clone());
        Ok(Self {
            config: Arc::new(config),
            guard,
            registry,
            locks: ProjectLocks::new(),
            sessions: SessionTable::default(),
            events: EventBus::default(),
            packages,
            peer,
            auth,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
            pid: std::process::id(),
        })
    }

    /// Replace the package manager.
    #[cfg(test)]
    pub fn with_packages(mut self, packages: Option<Arc<dyn PackageManager>>) -> Self {
        self.packages = packages;
        self
    }
}
