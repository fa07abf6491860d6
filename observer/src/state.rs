use std::sync::Arc;

use crate::orchestrator::OrchestratorController;

pub struct AppState {
    pub controller: Arc<OrchestratorController>,
}
