//! Server state

use std::sync::Arc;

use crate::app::controller::AgentController;

/// Server state shared across handlers
pub struct ServerState {
    pub controller: Arc<AgentController>,
}

impl ServerState {
    pub fn new(controller: Arc<AgentController>) -> Self {
        Self { controller }
    }
}
