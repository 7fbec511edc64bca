//! Shared gateway state, passed to the WS handler and every dispatcher.

use std::sync::Arc;
use std::time::Instant;

use ar_domain::config::GatewayConfig;

use crate::permissions::PermissionStore;
use crate::runners::RunnerRegistry;
use crate::sessions::SessionIndex;
use crate::surface::ChatSurface;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub runners: Arc<RunnerRegistry>,
    pub permissions: Arc<PermissionStore>,
    pub sessions: Arc<SessionIndex>,
    pub surface: Arc<dyn ChatSurface>,
    pub started: Arc<Instant>,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>, surface: Arc<dyn ChatSurface>) -> Self {
        let permissions = Arc::new(PermissionStore::new(config.permission_ttl()));
        Self {
            config,
            runners: Arc::new(RunnerRegistry::new()),
            permissions,
            sessions: Arc::new(SessionIndex::new()),
            surface,
            started: Arc::new(Instant::now()),
        }
    }
}
