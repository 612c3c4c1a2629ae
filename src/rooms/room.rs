//! Room task: lifecycle and authoritative tick loop
//!
//! Every resident room is one tokio task that owns its world and script
//! host. Everything else talks to it through an unbounded command queue
//! that is drained at the start of each tick.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::ai::{fallback_text, AiClient};
use crate::config::EngineConfig;
use crate::game::world::{AiRequest, Outbound};
use crate::game::{EngineError, RoomState, World};
use crate::script::{BotAction, ScriptHost};
use crate::store::RoomStore;
use crate::util::time::{tick_delta, tick_period, Timer};
use crate::ws::{ServerEnvelope, Transport};

/// Base delay between hibernation save attempts, doubled per attempt
const SAVE_BACKOFF: Duration = Duration::from_millis(250);

/// Room lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Persistence fetch in flight
    Loading,
    /// Tick loop running with at least one client
    Active,
    /// No clients; hibernation timer armed
    Draining,
    /// State persisted and the room evicted
    Hibernated,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Loading => "loading",
            Lifecycle::Active => "active",
            Lifecycle::Draining => "draining",
            Lifecycle::Hibernated => "hibernated",
        }
    }
}

/// Input applied at the next tick boundary, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum RoomInput {
    Join {
        client: String,
    },
    Leave {
        client: String,
    },
    Action {
        client: String,
        kind: String,
        payload: Value,
    },
    AiResult {
        ticket: u64,
        text: String,
        ok: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomCommand {
    Input(RoomInput),
    /// Recompile the room against its live state
    Reload {
        source: String,
        owner: Option<String>,
    },
    /// Persist and stop
    Shutdown,
}

/// Handle to a resident room
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub generation: u64,
    tx: mpsc::UnboundedSender<RoomCommand>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl RoomHandle {
    /// Queue a command; hands it back if the room task is gone
    pub fn send(&self, command: RoomCommand) -> Result<(), RoomCommand> {
        self.tx.send(command).map_err(|e| e.0)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }
}

/// Collaborators shared by every room
#[derive(Clone)]
pub struct RoomDeps {
    pub store: Arc<dyn RoomStore>,
    pub transport: Arc<dyn Transport>,
    pub ai: Arc<dyn AiClient>,
    pub config: EngineConfig,
}

/// Registry of all resident rooms
///
/// Senders hold the map guard while queueing, and a room only evicts itself
/// under the same guard after checking its queue is empty, so a command is
/// never queued into a room that has already decided to go away.
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    /// Queue a command for a resident room. Returns false if the room is
    /// not resident.
    pub fn send(&self, room_id: &str, command: RoomCommand) -> bool {
        match self.rooms.get(room_id) {
            Some(handle) => handle.send(command).is_ok(),
            None => false,
        }
    }

    /// Queue a command, starting the room first if it is not resident
    pub fn send_or_spawn<F>(&self, room_id: &str, command: RoomCommand, spawn: F)
    where
        F: FnOnce(u64) -> RoomHandle,
    {
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if let Err(command) = entry.get().send(command) {
                    let handle = spawn(self.next_generation.fetch_add(1, Ordering::Relaxed));
                    let _ = handle.send(command);
                    entry.insert(handle);
                }
            }
            Entry::Vacant(entry) => {
                let handle = spawn(self.next_generation.fetch_add(1, Ordering::Relaxed));
                let _ = handle.send(command);
                entry.insert(handle);
            }
        }
    }

    /// Drop a room's entry if it still belongs to that room task
    pub fn remove_generation(&self, room_id: &str, generation: u64) -> bool {
        self.rooms
            .remove_if(room_id, |_, handle| handle.generation == generation)
            .is_some()
    }

    /// Evict a room only if nothing was queued for it in the meantime
    pub fn evict_if_idle<F>(&self, room_id: &str, generation: u64, idle: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        self.rooms
            .remove_if(room_id, |_, handle| handle.generation == generation && idle())
            .is_some()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Start a room task and return its handle. The room begins in `Loading`.
pub fn spawn(
    room_id: &str,
    generation: u64,
    deps: RoomDeps,
    registry: Arc<RoomRegistry>,
) -> RoomHandle {
    let (link, handle) = open(room_id, generation, deps, registry);
    tokio::spawn(async move {
        if let Some(room) = Room::load(link).await {
            room.run().await;
        }
    });
    handle
}

fn open(
    room_id: &str,
    generation: u64,
    deps: RoomDeps,
    registry: Arc<RoomRegistry>,
) -> (RoomLink, RoomHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let lifecycle = Arc::new(Mutex::new(Lifecycle::Loading));

    let handle = RoomHandle {
        generation,
        tx: tx.clone(),
        lifecycle: lifecycle.clone(),
    };

    let link = RoomLink {
        room_id: room_id.to_string(),
        generation,
        deps,
        registry,
        tx,
        rx,
        lifecycle,
    };
    (link, handle)
}

/// Channel ends and shared cells of a room task, before its state loads
struct RoomLink {
    room_id: String,
    generation: u64,
    deps: RoomDeps,
    registry: Arc<RoomRegistry>,
    tx: mpsc::UnboundedSender<RoomCommand>,
    rx: mpsc::UnboundedReceiver<RoomCommand>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl RoomLink {
    fn set_lifecycle(&self, next: Lifecycle) {
        let mut current = self.lifecycle.lock();
        if *current != next {
            debug!(room_id = %self.room_id, from = current.as_str(), to = next.as_str(), "Lifecycle transition");
            *current = next;
        }
    }

    fn crash_notice(&self, reason: &str) {
        self.deps.transport.broadcast(
            &self.room_id,
            &ServerEnvelope::new(
                "room_crashed",
                json!({ "room_id": self.room_id, "reason": reason }),
            ),
        );
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Room {
    link: RoomLink,
    host: ScriptHost,
    /// Clients currently joined (bots are players but not members)
    members: HashSet<String>,
    owner: Option<String>,
    /// Compile error waiting for an owner to report it to
    pending_error: Option<String>,
    /// The state never ran `init`; it runs after the first successful load
    needs_init: bool,
    bot_actions: Vec<BotAction>,
    drain_deadline: Option<Instant>,
    /// Latest save requested by the room's logic; each waits for the one
    /// before it
    pending_save: Option<JoinHandle<()>>,
}

impl Room {
    // ========================================================================
    // Loading
    // ========================================================================

    async fn load(link: RoomLink) -> Option<Room> {
        let room_id = link.room_id.clone();
        info!(room_id = %room_id, generation = link.generation, "Loading room");

        let stored = match link.deps.store.load(&room_id).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(room_id = %room_id, error = %e, "Failed to load room state");
                link.crash_notice("room state could not be loaded");
                link.registry.remove_generation(&room_id, link.generation);
                return None;
            }
        };

        // A corrupted blob stops the room without saving over it
        let state = match stored.as_deref().map(RoomState::from_blob) {
            Some(Ok(state)) => Some(state),
            Some(Err(e)) => {
                let fatal = EngineError::Fatal(format!("corrupted room state: {}", e));
                error!(room_id = %room_id, error = %fatal, "Room crashed while loading");
                link.crash_notice(&fatal.to_string());
                link.registry.remove_generation(&room_id, link.generation);
                return None;
            }
            None => None,
        };
        let needs_init = state.is_none();

        let world = World::new(
            room_id.clone(),
            link.deps.config.clone(),
            state.unwrap_or_default(),
        );
        let mut room = Room {
            host: ScriptHost::new(world.shared()),
            link,
            members: HashSet::new(),
            owner: None,
            pending_error: None,
            needs_init,
            bot_actions: Vec::new(),
            drain_deadline: None,
            pending_save: None,
        };

        match room.link.deps.store.load_logic(&room_id).await {
            Ok(Some(source)) => room.install(&source),
            Ok(None) => debug!(room_id = %room_id, "Room has no published logic"),
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Failed to load room logic");
                room.pending_error = Some(format!("Room logic could not be loaded: {}", e));
            }
        }

        room.link.set_lifecycle(Lifecycle::Active);
        info!(room_id = %room_id, fresh = needs_init, "Room active");
        Some(room)
    }

    /// Compile a program against the live state, reporting failure to the
    /// owner
    fn install(&mut self, source: &str) {
        match self.host.load(source) {
            Ok(_) => {
                self.pending_error = None;
                if self.needs_init {
                    self.host.run_init();
                    self.needs_init = false;
                }
            }
            Err(e) => {
                warn!(room_id = %self.link.room_id, error = %e, "Room logic failed to compile");
                self.report_error(e.to_string());
            }
        }
    }

    fn report_error(&mut self, message: String) {
        match &self.owner {
            Some(owner) => self
                .link
                .deps
                .transport
                .send_to(owner, &ServerEnvelope::notification(message)),
            None => self.pending_error = Some(message),
        }
    }

    // ========================================================================
    // Tick loop
    // ========================================================================

    async fn run(mut self) {
        let config = &self.link.deps.config;
        let dt = tick_delta(config.tick_rate);
        let mut ticker = interval(tick_period(config.tick_rate));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if let Flow::Stop = self.drain_commands().await {
                return;
            }

            if let Err(e) = self.step(dt) {
                self.crash(e).await;
                return;
            }

            if let Flow::Stop = self.check_lifecycle().await {
                return;
            }
        }
    }

    async fn drain_commands(&mut self) -> Flow {
        for action in std::mem::take(&mut self.bot_actions) {
            self.host
                .handle_input(&action.bot, &action.kind, action.payload);
        }

        while let Ok(command) = self.link.rx.try_recv() {
            match command {
                RoomCommand::Input(input) => self.apply(input),
                RoomCommand::Reload { source, owner } => {
                    if owner.is_some() {
                        self.owner = owner;
                    }
                    info!(room_id = %self.link.room_id, "Reloading room logic");
                    self.install(&source);
                }
                RoomCommand::Shutdown => {
                    self.shutdown().await;
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    fn apply(&mut self, input: RoomInput) {
        match input {
            RoomInput::Join { client } => {
                let transport = &self.link.deps.transport;
                let map = self.host.world().lock().map_data();
                transport.send_to(&client, &ServerEnvelope::new("map_data", map));
                self.host.handle_join(&client);
                transport.send_to(
                    &client,
                    &ServerEnvelope::new("init_state", self.host.init_state(&client)),
                );
                self.members.insert(client.clone());
                info!(room_id = %self.link.room_id, client_id = %client, "Client joined");

                if self.owner.is_none() {
                    self.owner = Some(client);
                    if let Some(message) = self.pending_error.take() {
                        self.report_error(message);
                    }
                }
            }
            RoomInput::Leave { client } => {
                if !self.members.remove(&client) {
                    return;
                }
                self.host.handle_leave(&client);
                if self.owner.as_deref() == Some(client.as_str()) {
                    self.owner = None;
                }
                info!(room_id = %self.link.room_id, client_id = %client, "Client left");
            }
            RoomInput::Action {
                client,
                kind,
                payload,
            } => self.host.handle_input(&client, &kind, payload),
            RoomInput::AiResult { ticket, text, ok } => {
                self.host.deliver_ai_result(ticket, text, ok)
            }
        }
    }

    /// Run one tick and publish its effects
    fn step(&mut self, dt: f64) -> Result<(), EngineError> {
        let timer = Timer::new();
        self.host.update(dt)?;
        self.bot_actions = self.host.run_bots();

        let transport = &self.link.deps.transport;
        let room_id = &self.link.room_id;
        let snapshot = self.host.snapshot();
        let tick = snapshot.tick;
        match serde_json::to_value(&snapshot) {
            Ok(payload) => transport.broadcast(room_id, &ServerEnvelope::new("snapshot", payload)),
            Err(e) => warn!(room_id = %room_id, error = %e, "Failed to encode snapshot"),
        }

        let (outbox, ai_requests, save) = {
            let mut world = self.host.world().lock();
            (
                world.take_outbox(),
                world.take_ai_requests(),
                world.take_save_request(),
            )
        };
        for message in outbox {
            match message {
                Outbound::To {
                    client,
                    event,
                    payload,
                } => transport.send_to(&client, &ServerEnvelope::new(event, payload)),
                Outbound::Broadcast { event, payload } => {
                    transport.broadcast(room_id, &ServerEnvelope::new(event, payload))
                }
            }
        }
        for request in ai_requests {
            self.spawn_ai(request);
        }

        trace!(room_id = %room_id, tick, elapsed_us = timer.elapsed_micros(), "Tick complete");
        if save {
            self.spawn_save();
        }
        Ok(())
    }

    fn spawn_ai(&self, request: AiRequest) {
        let ai = self.link.deps.ai.clone();
        let tx = self.link.tx.clone();
        let room_id = self.link.room_id.clone();
        tokio::spawn(async move {
            let (text, ok) = match ai.generate(&request.prompt, &request.model).await {
                Ok(text) => (text, true),
                Err(e) => {
                    warn!(room_id = %room_id, ticket = request.ticket, error = %e, "AI request failed");
                    (fallback_text(&e), false)
                }
            };
            let _ = tx.send(RoomCommand::Input(RoomInput::AiResult {
                ticket: request.ticket,
                text,
                ok,
            }));
        });
    }

    fn serialize_state(&self) -> Option<String> {
        match self.host.world().lock().state.to_blob() {
            Ok(blob) => Some(blob),
            Err(e) => {
                error!(room_id = %self.link.room_id, error = %e, "Failed to serialize room state");
                None
            }
        }
    }

    /// Background save requested by the room's logic. Saves are chained so
    /// an older blob never lands after a newer one.
    fn spawn_save(&mut self) {
        let Some(blob) = self.serialize_state() else {
            return;
        };
        let store = self.link.deps.store.clone();
        let room_id = self.link.room_id.clone();
        let previous = self.pending_save.take();
        self.pending_save = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            match store.save(&room_id, blob).await {
                Ok(()) => debug!(room_id = %room_id, "Room saved"),
                Err(e) => warn!(room_id = %room_id, error = %e, "Room save failed"),
            }
        }));
    }

    /// Wait for background saves before writing a final blob
    async fn settle_saves(&mut self) {
        if let Some(pending) = self.pending_save.take() {
            debug!(room_id = %self.link.room_id, "Waiting for queued save");
            if let Err(e) = pending.await {
                warn!(room_id = %self.link.room_id, error = %e, "Queued save task failed");
            }
        }
    }

    /// Save with retries; returns whether any attempt succeeded
    async fn save_with_retry(&self) -> bool {
        let Some(blob) = self.serialize_state() else {
            return false;
        };
        let room_id = &self.link.room_id;
        let attempts = self.link.deps.config.save_retries + 1;
        for attempt in 1..=attempts {
            match self.link.deps.store.save(room_id, blob.clone()).await {
                Ok(()) => {
                    debug!(room_id = %room_id, attempt, "Room saved");
                    return true;
                }
                Err(e) => {
                    warn!(room_id = %room_id, attempt, error = %e, "Room save failed");
                    if attempt < attempts {
                        tokio::time::sleep(SAVE_BACKOFF * 2u32.pow(attempt - 1)).await;
                    }
                }
            }
        }
        false
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn check_lifecycle(&mut self) -> Flow {
        match (self.members.len(), self.drain_deadline) {
            (0, None) => {
                let grace = self.link.deps.config.hibernate_grace;
                self.drain_deadline = Some(Instant::now() + grace);
                self.link.set_lifecycle(Lifecycle::Draining);
                info!(room_id = %self.link.room_id, grace_secs = grace.as_secs_f64(), "Room empty, draining");
            }
            (0, Some(deadline)) if Instant::now() >= deadline => return self.hibernate().await,
            (0, Some(_)) => {}
            (_, Some(_)) => {
                self.drain_deadline = None;
                self.link.set_lifecycle(Lifecycle::Active);
                info!(room_id = %self.link.room_id, "Client rejoined, hibernation cancelled");
            }
            (_, None) => {}
        }
        Flow::Continue
    }

    async fn hibernate(&mut self) -> Flow {
        info!(room_id = %self.link.room_id, "Hibernating room");
        self.settle_saves().await;
        if !self.save_with_retry().await {
            error!(
                room_id = %self.link.room_id,
                "Hibernation save failed on every attempt; evicting anyway and unsaved changes are lost"
            );
        }

        let link = &self.link;
        let evicted = link
            .registry
            .evict_if_idle(&link.room_id, link.generation, || link.rx.is_empty());
        if evicted {
            link.set_lifecycle(Lifecycle::Hibernated);
            info!(room_id = %link.room_id, "Room hibernated");
            Flow::Stop
        } else {
            debug!(room_id = %link.room_id, "Commands arrived while hibernating, staying resident");
            self.drain_deadline = None;
            self.link.set_lifecycle(Lifecycle::Active);
            Flow::Continue
        }
    }

    async fn shutdown(&mut self) {
        self.settle_saves().await;
        if !self.save_with_retry().await {
            error!(room_id = %self.link.room_id, "Shutdown save failed; unsaved changes are lost");
        }
        self.link
            .registry
            .remove_generation(&self.link.room_id, self.link.generation);
        self.link.set_lifecycle(Lifecycle::Hibernated);
        info!(room_id = %self.link.room_id, "Room stopped");
    }

    async fn crash(&mut self, fatal: EngineError) {
        error!(room_id = %self.link.room_id, error = %fatal, "Room crashed");
        self.link.crash_notice(&fatal.to_string());
        self.settle_saves().await;
        if let Some(blob) = self.serialize_state() {
            if let Err(e) = self.link.deps.store.save(&self.link.room_id, blob).await {
                warn!(room_id = %self.link.room_id, error = %e, "Best-effort save after crash failed");
            }
        }
        self.link
            .registry
            .remove_generation(&self.link.room_id, self.link.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::DisabledAi;
    use crate::game::state::Entity;
    use crate::store::MemoryStore;
    use crate::ws::hub::recording::RecordingTransport;

    fn handle(generation: u64) -> (RoomHandle, mpsc::UnboundedReceiver<RoomCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RoomHandle {
            generation,
            tx,
            lifecycle: Arc::new(Mutex::new(Lifecycle::Active)),
        };
        (handle, rx)
    }

    fn join(client: &str) -> RoomCommand {
        RoomCommand::Input(RoomInput::Join {
            client: client.to_string(),
        })
    }

    #[test]
    fn eviction_waits_for_queued_commands() {
        let registry = RoomRegistry::new();
        let (h, mut rx) = handle(7);
        registry.send_or_spawn("lobby", join("ana"), |_| h.clone());
        assert!(!registry.evict_if_idle("lobby", 7, || rx.is_empty()));

        assert_eq!(rx.try_recv().unwrap(), join("ana"));
        assert!(!registry.evict_if_idle("lobby", 8, || rx.is_empty()));
        assert!(registry.evict_if_idle("lobby", 7, || rx.is_empty()));
        assert!(!registry.send("lobby", join("bo")));
    }

    #[test]
    fn dead_room_is_replaced_on_send() {
        let registry = RoomRegistry::new();
        let (old, old_rx) = handle(1);
        registry.send_or_spawn("lobby", join("ana"), |_| old.clone());
        drop(old_rx);
        drop(old);

        let (fresh, mut fresh_rx) = handle(2);
        registry.send_or_spawn("lobby", join("bo"), |_| fresh.clone());
        assert_eq!(registry.get("lobby").unwrap().generation, 2);
        assert_eq!(fresh_rx.try_recv().unwrap(), join("bo"));
        assert_eq!(registry.active_rooms(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn integrity_failure_mid_tick_crashes_the_room() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_logic("lobby", "fn on_update(room, dt) {}".to_string())
            .await
            .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let registry = Arc::new(RoomRegistry::new());
        let deps = RoomDeps {
            store: store.clone(),
            transport: transport.clone(),
            ai: Arc::new(DisabledAi),
            config: EngineConfig::default(),
        };

        let (link, handle) = open("lobby", 1, deps, registry.clone());
        registry.send_or_spawn("lobby", join("ana"), |_| handle);
        let room = Room::load(link).await.unwrap();

        // an entity the registry never created
        let stray: Entity = serde_json::from_value(json!({
            "id": 99, "type": "ghost", "x": 0, "y": 0, "w": 8, "h": 8
        }))
        .unwrap();
        room.host
            .world()
            .lock()
            .state
            .groups
            .entry("ghosts".to_string())
            .or_default()
            .push(stray);

        room.run().await;

        assert!(registry.get("lobby").is_none());
        assert!(transport
            .event_names("room:lobby")
            .contains(&"room_crashed".to_string()));
        assert_eq!(store.save_count(), 1);
        assert!(store.state("lobby").unwrap().contains("ghosts"));
    }
}
