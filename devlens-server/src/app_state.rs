use std::sync::Arc;

use devlens_config::ServerConfig;
use devlens_core::{StreamFanout, ToolFacade};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<ToolFacade>,
    pub fanout: Arc<StreamFanout>,
    pub server_config: ServerConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("stream_subscribers", &self.fanout.subscriber_count())
            .finish()
    }
}
