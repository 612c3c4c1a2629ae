//! Per-room simulation context
//!
//! One `World` per room, shared between the host and the script API behind a
//! mutex. Nothing here calls into the script engine; callers collect the hooks
//! they need, release the lock and only then invoke them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rhai::{Dynamic, FnPtr};
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use crate::config::EngineConfig;

use super::entity::{Blueprint, EntityRegistry, Hook};
use super::physics::{block_index, BlockCell, PhysicsEngine};
use super::scheduler::Scheduler;
use super::signal::{Sender, SignalBus};
use super::snapshot::RenderCompiler;
use super::spatial::SpatialIndex;
use super::state::{BlockPlacement, BotSpawn, Entity, EntityId, PlayerRecord, RoomState};
use super::EngineError;

/// Nested signal deliveries allowed before emits are refused
pub const MAX_SIGNAL_DEPTH: usize = 16;

pub type SharedWorld = Arc<Mutex<World>>;

/// Whether script code may touch live state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Top-level statements of a freshly compiled program: registration only
    Setup,
    Live,
}

/// Message produced during a tick, flushed to the transport afterwards
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    To {
        client: String,
        event: String,
        payload: Value,
    },
    Broadcast {
        event: String,
        payload: Value,
    },
}

/// AI call requested by a script, answered at a later tick boundary
#[derive(Debug, Clone, PartialEq)]
pub struct AiRequest {
    pub ticket: u64,
    pub prompt: String,
    pub model: String,
}

/// Server-side bot: per-bot scratch memory plus its spawn config
#[derive(Debug, Clone)]
pub struct BotRuntime {
    pub memory: Arc<Mutex<rhai::Map>>,
    pub config: Dynamic,
}

/// Everything a compiled program registers; replaced wholesale on reload
#[derive(Debug, Default)]
pub struct Registrations {
    blueprints: HashMap<String, Arc<Blueprint>>,
    render: Option<RenderCompiler<Hook>>,
    listeners: HashMap<String, Vec<Hook>>,
    scheduler: Scheduler<Hook>,
}

pub struct World {
    pub room_id: String,
    pub config: EngineConfig,
    pub phase: Phase,
    pub tick: u64,
    pub state: RoomState,
    pub entities: EntityRegistry,
    pub bus: SignalBus,
    pub scheduler: Scheduler<Hook>,
    pub render: RenderCompiler<Hook>,
    /// Room-level signal listeners registered with `room.on`
    pub listeners: HashMap<String, Vec<Hook>>,
    /// Entities whose hook is currently running, innermost last
    pub writers: Vec<EntityId>,
    pub signal_depth: usize,
    pub bots: BTreeMap<String, BotRuntime>,
    pub rng: ChaCha8Rng,
    physics: PhysicsEngine,
    obstacles: SpatialIndex<BlockCell>,
    obstacles_dirty: bool,
    movers: SpatialIndex<EntityId>,
    movers_dirty: bool,
    outbox: Vec<Outbound>,
    ai_requests: Vec<AiRequest>,
    ai_callbacks: HashMap<u64, Hook>,
    next_ai_ticket: u64,
    save_requested: bool,
}

impl World {
    pub fn new(room_id: impl Into<String>, config: EngineConfig, state: RoomState) -> Self {
        let room_id = room_id.into();
        let seed = room_id
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3));
        Self {
            physics: PhysicsEngine::new(config.gravity, config.max_fall_speed),
            obstacles: SpatialIndex::new(config.grid_cell_size),
            obstacles_dirty: true,
            movers: SpatialIndex::new(config.grid_cell_size),
            movers_dirty: true,
            render: RenderCompiler::new(config.snapshot_precision),
            room_id,
            phase: Phase::Live,
            tick: 0,
            state,
            entities: EntityRegistry::new(),
            bus: SignalBus::new(),
            scheduler: Scheduler::new(),
            listeners: HashMap::new(),
            writers: Vec::new(),
            signal_depth: 0,
            bots: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            outbox: Vec::new(),
            ai_requests: Vec::new(),
            ai_callbacks: HashMap::new(),
            next_ai_ticket: 0,
            save_requested: false,
            config,
        }
    }

    pub fn shared(self) -> SharedWorld {
        Arc::new(Mutex::new(self))
    }

    /// Refuse live mutations while a program's top level is being evaluated
    pub fn require_live(&self, operation: &str) -> Result<(), String> {
        match self.phase {
            Phase::Live => Ok(()),
            Phase::Setup => Err(format!(
                "room.{} is not available while the program loads; call it from init(room) or a hook",
                operation
            )),
        }
    }

    // ========================================================================
    // Program swap
    // ========================================================================

    /// Move every registration aside and enter setup, so a new program's
    /// top level registers into empty tables
    pub fn begin_setup(&mut self) -> Registrations {
        self.phase = Phase::Setup;
        let precision = self.render.precision();
        Registrations {
            blueprints: self.entities.replace_blueprints(HashMap::new()),
            render: Some(std::mem::replace(
                &mut self.render,
                RenderCompiler::new(precision),
            )),
            listeners: std::mem::take(&mut self.listeners),
            scheduler: std::mem::take(&mut self.scheduler),
        }
    }

    /// Keep the new registrations and rebuild the engine internals (slots,
    /// channels) from the current state
    pub fn commit_setup(&mut self) -> usize {
        self.phase = Phase::Live;
        self.writers.clear();
        self.signal_depth = 0;
        self.ai_callbacks.clear();
        self.obstacles_dirty = true;
        self.movers_dirty = true;
        self.entities.adopt(&mut self.state, &mut self.bus)
    }

    /// Throw away whatever the failed program registered
    pub fn rollback_setup(&mut self, previous: Registrations) {
        self.phase = Phase::Live;
        self.entities.replace_blueprints(previous.blueprints);
        if let Some(render) = previous.render {
            self.render = render;
        }
        self.listeners = previous.listeners;
        self.scheduler = previous.scheduler;
        self.writers.clear();
        self.signal_depth = 0;
    }

    // ========================================================================
    // Entities
    // ========================================================================

    pub fn define(&mut self, mut blueprint: Blueprint) {
        blueprint.size = (
            self.clamp_size(blueprint.size.0),
            self.clamp_size(blueprint.size.1),
        );
        self.entities.define(blueprint, &mut self.state);
    }

    /// Entity edge length limited to `[0, max_entity_size]`
    pub fn clamp_size(&self, edge: f64) -> f64 {
        if edge.is_finite() {
            edge.clamp(0.0, self.config.max_entity_size)
        } else {
            0.0
        }
    }

    /// Instantiate an entity and return its `on_create` hook, if any
    pub fn create_entity(
        &mut self,
        kind: &str,
        x: f64,
        y: f64,
        vars: Map<String, Value>,
    ) -> Result<(EntityId, Option<Hook>), EngineError> {
        let id = self
            .entities
            .create(kind, x, y, vars, &mut self.state, &mut self.bus)?;
        self.movers_dirty = true;
        trace!(room_id = %self.room_id, entity_id = id, kind, "Entity created");
        Ok((id, self.entities.create_hook(id)))
    }

    pub fn destroy_entity(&mut self, id: EntityId) -> bool {
        let destroyed = self.entities.destroy(id, &mut self.state, &mut self.bus);
        if destroyed {
            self.movers_dirty = true;
            self.unbind_entity(id);
        }
        destroyed
    }

    /// Open the entity loop; destroys are deferred until `end_tick`
    pub fn begin_tick(&mut self) -> Vec<(EntityId, Hook)> {
        self.entities.begin_tick()
    }

    /// Sweep every entity destroyed during the tick
    pub fn end_tick(&mut self) -> Vec<EntityId> {
        let removed = self.entities.end_tick(&mut self.state, &mut self.bus);
        if !removed.is_empty() {
            self.movers_dirty = true;
            for id in &removed {
                self.unbind_entity(*id);
            }
            trace!(room_id = %self.room_id, removed = removed.len(), "Entities swept");
        }
        removed
    }

    pub fn verify(&self) -> Result<(), EngineError> {
        self.entities.verify(&self.state)
    }

    /// Alive entities in creation order
    pub fn live_entities(&self) -> Vec<Entity> {
        self.entities
            .live_ids()
            .iter()
            .filter_map(|id| self.entity(*id).cloned())
            .collect()
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        if !self.entities.is_alive(id) {
            return None;
        }
        self.entities.locate(&self.state, id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        if !self.entities.is_alive(id) {
            return None;
        }
        self.movers_dirty = true;
        self.entities.locate_mut(&mut self.state, id)
    }

    /// True only inside the entity's own hook invocation
    pub fn can_write(&self, id: EntityId) -> bool {
        self.writers.last() == Some(&id)
    }

    /// Ids of alive entities of a blueprint, or of a group when no
    /// blueprint has that name
    pub fn find(&self, kind_or_group: &str) -> Vec<EntityId> {
        let by_kind: Vec<EntityId> = self
            .entities
            .live_ids()
            .iter()
            .copied()
            .filter(|id| {
                self.entities.is_alive(*id)
                    && self
                        .entities
                        .blueprint_of(*id)
                        .is_some_and(|bp| bp.name == kind_or_group)
            })
            .collect();
        if !by_kind.is_empty() || self.entities.blueprint(kind_or_group).is_some() {
            return by_kind;
        }
        self.state
            .groups
            .get(kind_or_group)
            .map(|entities| {
                entities
                    .iter()
                    .map(|e| e.id)
                    .filter(|id| self.entities.is_alive(*id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn query_rect(&mut self, x: f64, y: f64, w: f64, h: f64) -> Vec<EntityId> {
        self.refresh_movers();
        let swept = super::state::Rect::new(x, y, w, h);
        self.movers
            .query_overlapping(&swept)
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| self.entities.is_alive(*id))
            .collect()
    }

    pub fn query_radius(&mut self, x: f64, y: f64, r: f64) -> Vec<EntityId> {
        self.refresh_movers();
        self.movers
            .query_radius(x, y, r)
            .into_iter()
            .filter(|id| self.entities.is_alive(*id))
            .collect()
    }

    /// Overlapping pairs for every entity with an `on_collide` hook
    pub fn collisions(&mut self) -> Vec<(EntityId, EntityId, Hook)> {
        self.refresh_movers();
        let mut pairs = Vec::new();
        for (id, hook) in self.entities.colliders() {
            let Some(rect) = self.entities.locate(&self.state, id).map(Entity::rect) else {
                continue;
            };
            for (other, _) in self.movers.query_overlapping(&rect) {
                if other != id && self.entities.is_alive(other) {
                    pairs.push((id, other, hook.clone()));
                }
            }
        }
        pairs
    }

    /// Rectangles of alive entities, for group-vs-group tests
    pub fn rects_of(&self, ids: &[EntityId]) -> Vec<(EntityId, super::state::Rect)> {
        ids.iter()
            .filter_map(|id| self.entity(*id).map(|e| (*id, e.rect())))
            .collect()
    }

    fn refresh_movers(&mut self) {
        if !self.movers_dirty {
            return;
        }
        self.movers.clear();
        for entities in self.state.groups.values() {
            for entity in entities {
                self.movers.insert(entity.id, entity.rect());
            }
        }
        self.movers_dirty = false;
    }

    // ========================================================================
    // Blocks and physics
    // ========================================================================

    pub fn set_block(&mut self, bx: i64, by: i64, kind: u8) -> bool {
        let changed = self.state.set_block(bx, by, kind);
        if changed {
            self.obstacles_dirty = true;
            self.outbox.push(Outbound::Broadcast {
                event: "block".into(),
                payload: json!({"x": bx, "y": by, "kind": kind}),
            });
        }
        changed
    }

    pub fn queue_blocks<I: IntoIterator<Item = BlockPlacement>>(&mut self, blocks: I) -> usize {
        let before = self.state.sys.build_queue.len();
        self.state.sys.build_queue.extend(blocks);
        self.state.sys.build_queue.len() - before
    }

    /// Place up to the configured number of queued blocks
    pub fn apply_build_queue(&mut self) -> usize {
        let mut placed = 0;
        while placed < self.config.build_blocks_per_tick {
            let Some(block) = self.state.sys.build_queue.pop_front() else {
                break;
            };
            self.set_block(block.x, block.y, block.kind);
            placed += 1;
        }
        placed
    }

    pub fn map_data(&self) -> Value {
        json!({
            "block_size": self.config.block_size,
            "blocks": self.state.blocks,
        })
    }

    /// Integrate every entity against the block layer, then rebuild the
    /// moving layer once for the rest of the tick
    pub fn step_physics(&mut self, dt: f64) {
        if self.obstacles_dirty {
            self.obstacles = block_index(
                self.state.iter_blocks().map(|(bx, by, _)| (bx, by)),
                self.config.block_size,
                self.config.grid_cell_size,
            );
            self.obstacles_dirty = false;
            debug!(room_id = %self.room_id, blocks = self.obstacles.len(), "Obstacle grid rebuilt");
        }
        let entities = self
            .state
            .groups
            .values_mut()
            .flat_map(|entities| entities.iter_mut());
        self.physics.integrate(entities, &self.obstacles, dt);
        self.movers_dirty = true;
        self.refresh_movers();
    }

    // ========================================================================
    // Players and bots
    // ========================================================================

    pub fn add_player(&mut self, client: &str, bot: bool) {
        let record = self.state.players.entry(client.to_string()).or_default();
        record.bot = bot;
    }

    pub fn remove_player(&mut self, client: &str) -> Option<PlayerRecord> {
        self.state.players.remove(client)
    }

    pub fn bind(&mut self, client: &str, entity: Option<EntityId>) -> bool {
        match self.state.players.get_mut(client) {
            Some(record) => {
                record.entity = entity;
                true
            }
            None => false,
        }
    }

    pub fn bound_entity(&self, client: &str) -> Option<EntityId> {
        self.state
            .players
            .get(client)
            .and_then(|record| record.entity)
            .filter(|id| self.entities.is_alive(*id))
    }

    fn unbind_entity(&mut self, id: EntityId) {
        for record in self.state.players.values_mut() {
            if record.entity == Some(id) {
                record.entity = None;
            }
        }
    }

    /// Apply queued bot spawns and kills
    pub fn drain_bot_queues(&mut self) -> (Vec<String>, Vec<String>) {
        let spawns: Vec<BotSpawn> = std::mem::take(&mut self.state.sys.spawn_bots);
        let kills: Vec<String> = std::mem::take(&mut self.state.sys.kill_bots);

        let mut spawned = Vec::new();
        for spawn in spawns {
            if self.state.players.get(&spawn.id).is_some_and(|p| !p.bot) {
                debug!(room_id = %self.room_id, bot_id = %spawn.id, "Bot id collides with a player");
                continue;
            }
            self.add_player(&spawn.id, true);
            self.bots.insert(
                spawn.id.clone(),
                BotRuntime {
                    memory: Arc::new(Mutex::new(rhai::Map::new())),
                    config: crate::script::convert::json_to_dynamic(&spawn.config),
                },
            );
            spawned.push(spawn.id);
        }

        let mut killed = Vec::new();
        for id in kills {
            if self.bots.remove(&id).is_some() {
                self.state.players.remove(&id);
                killed.push(id);
            }
        }
        (spawned, killed)
    }

    // ========================================================================
    // Outbound side effects
    // ========================================================================

    pub fn send_to(&mut self, client: &str, event: &str, payload: Value) {
        self.outbox.push(Outbound::To {
            client: client.to_string(),
            event: event.to_string(),
            payload,
        });
    }

    pub fn broadcast(&mut self, event: &str, payload: Value) {
        self.outbox.push(Outbound::Broadcast {
            event: event.to_string(),
            payload,
        });
    }

    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn request_ai(&mut self, prompt: String, model: String, callback: Hook) -> u64 {
        self.next_ai_ticket += 1;
        let ticket = self.next_ai_ticket;
        self.ai_requests.push(AiRequest {
            ticket,
            prompt,
            model,
        });
        self.ai_callbacks.insert(ticket, callback);
        ticket
    }

    pub fn take_ai_requests(&mut self) -> Vec<AiRequest> {
        std::mem::take(&mut self.ai_requests)
    }

    pub fn take_ai_callback(&mut self, ticket: u64) -> Option<Hook> {
        self.ai_callbacks.remove(&ticket)
    }

    pub fn request_save(&mut self) {
        self.save_requested = true;
    }

    pub fn take_save_request(&mut self) -> bool {
        std::mem::take(&mut self.save_requested)
    }

    /// Room-level listeners for a signal name
    pub fn listeners_for(&self, name: &str) -> Vec<FnPtr> {
        self.listeners.get(name).cloned().unwrap_or_default()
    }

    /// Route a signal and resolve each recipient's handler. Recipients
    /// without a handler for `name` are skipped.
    pub fn signal_deliveries(
        &self,
        sender: Option<EntityId>,
        target: Option<&str>,
        name: &str,
    ) -> Vec<(EntityId, Hook)> {
        let channels_out = sender
            .and_then(|id| self.entity(id))
            .map(|e| e.channels_out.clone())
            .unwrap_or_default();
        let from = Sender {
            id: sender,
            channels_out: &channels_out,
        };

        self.bus
            .route(&from, target)
            .into_iter()
            .filter_map(|id| self.entities.signal_hook(id, name).map(|hook| (id, hook)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::Body;

    fn world() -> World {
        let mut world = World::new("test-room", EngineConfig::default(), RoomState::default());
        let mut crate_bp = Blueprint::new("crate");
        crate_bp.body = Some(Body::default());
        crate_bp.size = (30.0, 30.0);
        world.define(crate_bp);
        world
    }

    #[test]
    fn setup_phase_refuses_live_mutations() {
        let mut world = world();
        let previous = world.begin_setup();
        assert!(world.require_live("create").is_err());
        assert_eq!(world.entities.blueprint_count(), 0);
        world.rollback_setup(previous);
        assert!(world.require_live("create").is_ok());
        assert!(world.entities.blueprint("crate").is_some());
    }

    #[test]
    fn build_queue_places_a_bounded_number_per_tick() {
        let mut world = world();
        world.queue_blocks((0..5).map(|x| BlockPlacement { x, y: 0, kind: 1 }));
        assert_eq!(world.apply_build_queue(), 2);
        assert_eq!(world.apply_build_queue(), 2);
        assert_eq!(world.apply_build_queue(), 1);
        assert_eq!(world.apply_build_queue(), 0);
        assert_eq!(world.state.blocks.len(), 5);
        let block_events = world
            .take_outbox()
            .into_iter()
            .filter(|m| matches!(m, Outbound::Broadcast { event, .. } if event == "block"))
            .count();
        assert_eq!(block_events, 5);
    }

    #[test]
    fn crate_lands_on_freshly_placed_floor() {
        let mut world = world();
        for bx in -1..=1 {
            world.set_block(bx, 0, 1);
        }
        let (id, _) = world.create_entity("crate", 0.0, -40.0, Map::new()).unwrap();
        world.entities.activate(id);

        for _ in 0..30 {
            world.step_physics(1.0 / 60.0);
        }
        let crate_entity = world.entity(id).unwrap();
        assert!(crate_entity.on_ground);
        assert_eq!(crate_entity.vy, 0.0);
        assert!((crate_entity.y - -30.0).abs() < 1e-9);
        assert_eq!(world.query_radius(15.0, -15.0, 1.0), vec![id]);
    }

    #[test]
    fn blueprint_sizes_are_capped() {
        let mut world = world();
        let mut wall = Blueprint::new("wall");
        wall.size = (1.0e9, f64::NAN);
        world.define(wall);
        let (id, _) = world.create_entity("wall", 0.0, 0.0, Map::new()).unwrap();
        let entity = world.entity(id).unwrap();
        assert_eq!((entity.w, entity.h), (world.config.max_entity_size, 0.0));
    }

    #[test]
    fn writing_window_tracks_innermost_hook() {
        let mut world = world();
        world.writers.push(1);
        world.writers.push(2);
        assert!(world.can_write(2));
        assert!(!world.can_write(1));
        world.writers.pop();
        assert!(world.can_write(1));
    }

    #[test]
    fn destroying_a_bound_entity_unbinds_the_player() {
        let mut world = world();
        world.add_player("ana", false);
        let (id, _) = world.create_entity("crate", 0.0, 0.0, Map::new()).unwrap();
        assert!(world.bind("ana", Some(id)));
        assert_eq!(world.bound_entity("ana"), Some(id));
        assert!(world.destroy_entity(id));
        assert_eq!(world.bound_entity("ana"), None);
        assert!(world.state.players["ana"].entity.is_none());
    }

    #[test]
    fn bot_queues_spawn_and_kill() {
        let mut world = world();
        world.state.sys.spawn_bots.push(BotSpawn {
            id: "bot-1".into(),
            config: json!({"aggro": 2}),
        });
        let (spawned, _) = world.drain_bot_queues();
        assert_eq!(spawned, vec!["bot-1"]);
        assert!(world.state.players["bot-1"].bot);

        world.state.sys.kill_bots.push("bot-1".into());
        let (_, killed) = world.drain_bot_queues();
        assert_eq!(killed, vec!["bot-1"]);
        assert!(world.bots.is_empty());
        assert!(!world.state.players.contains_key("bot-1"));
    }
}
