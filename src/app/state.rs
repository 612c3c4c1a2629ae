//! Application state shared across routes

use std::sync::Arc;

use crate::ai::AiClient;
use crate::config::Config;
use crate::rooms::RoomManager;
use crate::store::RoomStore;
use crate::ws::Hub;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
    pub manager: Arc<RoomManager>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn RoomStore>, ai: Arc<dyn AiClient>) -> Self {
        let config = Arc::new(config);

        // Connected clients; rooms reach them through the transport trait
        let hub = Arc::new(Hub::new());

        let manager = Arc::new(RoomManager::new(
            store,
            hub.clone(),
            ai,
            config.engine.clone(),
        ));

        Self {
            config,
            hub,
            manager,
        }
    }
}
