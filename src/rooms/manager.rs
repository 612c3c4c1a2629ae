//! Room manager - routes client traffic and publishes to room tasks

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::ai::AiClient;
use crate::config::EngineConfig;
use crate::store::RoomStore;
use crate::ws::{ServerEnvelope, Transport};

use super::room::{self, Lifecycle, RoomCommand, RoomDeps, RoomInput, RoomRegistry};
use super::{validate_room_id, RoomError};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RoomManager {
    registry: Arc<RoomRegistry>,
    deps: RoomDeps,
}

impl RoomManager {
    pub fn new(
        store: Arc<dyn RoomStore>,
        transport: Arc<dyn Transport>,
        ai: Arc<dyn AiClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            deps: RoomDeps {
                store,
                transport,
                ai,
                config,
            },
        }
    }

    /// Queue a join, loading the room from storage if it is not resident
    pub fn join(&self, room_id: &str, client: &str) -> Result<(), RoomError> {
        validate_room_id(room_id)?;
        let command = RoomCommand::Input(RoomInput::Join {
            client: client.to_string(),
        });
        let deps = self.deps.clone();
        let registry = self.registry.clone();
        self.registry.send_or_spawn(room_id, command, |generation| {
            room::spawn(room_id, generation, deps, registry)
        });
        Ok(())
    }

    pub fn leave(&self, room_id: &str, client: &str) {
        self.registry.send(
            room_id,
            RoomCommand::Input(RoomInput::Leave {
                client: client.to_string(),
            }),
        );
    }

    /// Queue one client action; false if the room is not resident
    pub fn input(&self, room_id: &str, client: &str, kind: &str, payload: Value) -> bool {
        self.registry.send(
            room_id,
            RoomCommand::Input(RoomInput::Action {
                client: client.to_string(),
                kind: kind.to_string(),
                payload,
            }),
        )
    }

    /// Store new logic for a room and hot-reload it if the room is
    /// resident. Returns whether a running room picked it up.
    pub async fn publish(
        &self,
        room_id: &str,
        source: String,
        owner: Option<String>,
    ) -> Result<bool, RoomError> {
        validate_room_id(room_id)?;
        self.deps
            .store
            .save_logic(room_id, source.clone())
            .await?;

        let reloaded = self
            .registry
            .send(room_id, RoomCommand::Reload { source, owner });
        self.deps.transport.broadcast(
            room_id,
            &ServerEnvelope::new("assets_changed", json!({ "room_id": room_id })),
        );

        info!(room_id = %room_id, reloaded, "Room logic published");
        Ok(reloaded)
    }

    /// Lifecycle of a resident room; `None` once it is hibernated or was
    /// never loaded
    pub fn status(&self, room_id: &str) -> Option<Lifecycle> {
        self.registry.get(room_id).map(|handle| handle.lifecycle())
    }

    pub fn active_rooms(&self) -> usize {
        self.registry.active_rooms()
    }

    /// Persist and stop every resident room
    pub async fn shutdown(&self) {
        let rooms = self.registry.room_ids();
        info!(rooms = rooms.len(), "Stopping rooms");
        for room_id in &rooms {
            self.registry.send(room_id, RoomCommand::Shutdown);
        }

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while self.registry.active_rooms() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.registry.active_rooms(),
                "Timed out waiting for rooms to stop"
            );
        }
    }
}
