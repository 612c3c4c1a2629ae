//! Script host - compiles room logic and drives its hooks
//!
//! The host owns the rhai engine and the compiled program for one room.
//! Loading is a two-phase swap: the new program's top level registers into
//! empty tables on the live world, and only a clean run replaces the
//! previous program. Until a program loads successfully every hook is a
//! no-op.

use rhai::{CallFnOptions, Dynamic, Engine, FuncArgs, Map, Scope, AST, FLOAT};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::game::scheduler::Scheduler;
use crate::game::entity::Hook;
use crate::game::snapshot::SnapshotPacket;
use crate::game::state::Entity;
use crate::game::{EngineError, SharedWorld};

use super::api::{self, BotMemory, EntityRef, RoomApi};
use super::convert::{dynamic_map_to_json, json_map_to_dynamic, json_to_dynamic};
use super::{call_entity_hook, contain, Caller, RhaiResult, ScriptError};

const MAX_STRING_SIZE: usize = 1 << 20;
const MAX_ARRAY_SIZE: usize = 100_000;
const MAX_MAP_SIZE: usize = 100_000;

/// Action produced by `on_bot`, applied as that bot's input next tick
#[derive(Debug, Clone, PartialEq)]
pub struct BotAction {
    pub bot: String,
    pub kind: String,
    pub payload: Value,
}

pub struct ScriptHost {
    engine: Engine,
    program: Option<AST>,
    world: SharedWorld,
    room_id: String,
}

impl ScriptHost {
    pub fn new(world: SharedWorld) -> Self {
        let (room_id, config) = {
            let w = world.lock();
            (w.room_id.clone(), w.config.clone())
        };

        let mut engine = Engine::new();
        engine.set_max_operations(config.script_max_operations);
        engine.set_max_call_levels(config.script_max_call_levels);
        engine.set_max_string_size(MAX_STRING_SIZE);
        engine.set_max_array_size(MAX_ARRAY_SIZE);
        engine.set_max_map_size(MAX_MAP_SIZE);
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        engine.disable_symbol("eval");

        let print_room = room_id.clone();
        engine.on_print(move |text| info!(room_id = %print_room, "script: {}", text));
        let debug_room = room_id.clone();
        engine.on_debug(move |text, _source, pos| {
            debug!(room_id = %debug_room, position = %pos, "script: {}", text)
        });

        api::register(&mut engine);

        Self {
            engine,
            program: None,
            world,
            room_id,
        }
    }

    pub fn world(&self) -> &SharedWorld {
        &self.world
    }

    pub fn is_loaded(&self) -> bool {
        self.program.is_some()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Compile and install a program against the current state.
    ///
    /// On failure the previous program (or the no-op program) stays live
    /// with all of its registrations. Returns the number of entities adopted
    /// from the state.
    pub fn load(&mut self, source: &str) -> Result<usize, ScriptError> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        let previous = self.world.lock().begin_setup();
        let mut scope = Scope::new();
        scope.push("room", RoomApi::new(&self.world));

        match self.engine.run_ast_with_scope(&mut scope, &ast) {
            Ok(()) => {
                let (adopted, timers) = {
                    let mut world = self.world.lock();
                    (world.commit_setup(), world.scheduler.len())
                };
                self.program = Some(ast);
                info!(room_id = %self.room_id, entities = adopted, timers, "Room logic loaded");
                Ok(adopted)
            }
            Err(e) => {
                self.world.lock().rollback_setup(previous);
                Err(ScriptError::Compile(e.to_string()))
            }
        }
    }

    /// Run `init(room)` for a room starting from empty state
    pub fn run_init(&self) {
        if let Some(result) = self.call_room_fn("init", 1, (RoomApi::new(&self.world),)) {
            contain("init", &self.room_id, result);
        }
    }

    fn caller(&self) -> Option<Caller<'_>> {
        self.program.as_ref().map(|ast| Caller::Host {
            engine: &self.engine,
            ast,
        })
    }

    fn has_fn(&self, name: &str, arity: usize) -> bool {
        self.program.as_ref().is_some_and(|ast| {
            ast.iter_functions()
                .any(|f| f.name == name && f.params.len() == arity)
        })
    }

    /// Call a room-level script function; `None` when the program has none
    fn call_room_fn(
        &self,
        name: &str,
        arity: usize,
        args: impl FuncArgs,
    ) -> Option<RhaiResult<Dynamic>> {
        if !self.has_fn(name, arity) {
            return None;
        }
        let ast = self.program.as_ref()?;
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        Some(
            self.engine
                .call_fn_with_options::<Dynamic>(options, &mut scope, ast, name, args),
        )
    }

    // ========================================================================
    // Inputs (applied at the tick boundary, in arrival order)
    // ========================================================================

    pub fn handle_join(&self, client: &str) {
        self.world.lock().add_player(client, false);
        if let Some(result) =
            self.call_room_fn("on_join", 2, (client.to_string(), RoomApi::new(&self.world)))
        {
            contain("on_join", &self.room_id, result);
        }
    }

    pub fn handle_leave(&self, client: &str) {
        if let Some(result) =
            self.call_room_fn("on_leave", 2, (client.to_string(), RoomApi::new(&self.world)))
        {
            contain("on_leave", &self.room_id, result);
        }
        self.world.lock().remove_player(client);
    }

    /// Feed one action to `on_input`, then to the client's bound entity
    pub fn handle_input(&self, client: &str, kind: &str, payload: Value) {
        let bound = {
            let world = self.world.lock();
            if !world.state.players.contains_key(client) {
                debug!(room_id = %self.room_id, client_id = %client, "Input from a client not in the room");
                return;
            }
            world.bound_entity(client)
        };

        let mut map = match payload {
            Value::Object(object) => json_map_to_dynamic(&object),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), json_to_dynamic(&other));
                map
            }
        };
        map.insert("type".into(), kind.into());
        map.insert("id".into(), client.into());
        let payload = Dynamic::from_map(map);

        if let Some(result) =
            self.call_room_fn("on_input", 2, (payload.clone(), RoomApi::new(&self.world)))
        {
            contain("on_input", &self.room_id, result);
        }

        if let (Some(id), Some(caller)) = (bound, self.caller()) {
            if let Err(e) = api::dispatch_input(&caller, &self.world, id, payload) {
                warn!(room_id = %self.room_id, entity_id = id, error = %e, "Entity input failed");
            }
        }
    }

    /// Run the callback of a finished AI request. Results for requests made
    /// by a replaced program have no callback and are dropped.
    pub fn deliver_ai_result(&self, ticket: u64, text: String, ok: bool) {
        let Some(callback) = self.world.lock().take_ai_callback(ticket) else {
            debug!(room_id = %self.room_id, ticket, "AI result has no pending callback");
            return;
        };
        let Some(caller) = self.caller() else {
            return;
        };
        let args = (text, ok, RoomApi::new(&self.world));
        contain("ai callback", &self.room_id, caller.call(&callback, args));
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Advance the room by one tick: queues, timers, room and entity
    /// updates, physics, collisions, then the sweep.
    pub fn update(&self, dt: f64) -> Result<(), EngineError> {
        {
            let mut world = self.world.lock();
            world.tick += 1;
            let (spawned, killed) = world.drain_bot_queues();
            for bot in &spawned {
                info!(room_id = %self.room_id, bot_id = %bot, "Bot spawned");
            }
            for bot in &killed {
                info!(room_id = %self.room_id, bot_id = %bot, "Bot removed");
            }
            world.apply_build_queue();
        }

        let Some(caller) = self.caller() else {
            self.world.lock().step_physics(dt);
            return Ok(());
        };

        let due = self.world.lock().scheduler.advance(dt);
        Scheduler::run_due(&due, |callback| {
            caller
                .call(callback, (RoomApi::new(&self.world),))
                .map(|_| ())
        });

        if let Some(result) =
            self.call_room_fn("on_update", 2, (RoomApi::new(&self.world), dt as FLOAT))
        {
            contain("on_update", &self.room_id, result);
        }

        let updates = self.world.lock().begin_tick();
        for (id, hook) in updates {
            if !self.world.lock().entities.is_alive(id) {
                continue;
            }
            let args = (
                EntityRef::new(&self.world, id),
                dt as FLOAT,
                RoomApi::new(&self.world),
            );
            contain(
                "on_update",
                &self.room_id,
                call_entity_hook(&caller, &self.world, id, &hook, args),
            );
        }

        let collisions = {
            let mut world = self.world.lock();
            world.step_physics(dt);
            world.collisions()
        };
        for (id, other, hook) in collisions {
            {
                let world = self.world.lock();
                if !world.entities.is_alive(id) || !world.entities.is_alive(other) {
                    continue;
                }
            }
            let args = (
                EntityRef::new(&self.world, id),
                EntityRef::new(&self.world, other),
                RoomApi::new(&self.world),
            );
            let result = contain(
                "on_collide",
                &self.room_id,
                call_entity_hook(&caller, &self.world, id, &hook, args),
            );
            if result.and_then(|v| v.as_bool().ok()) == Some(false) {
                self.world.lock().destroy_entity(id);
            }
        }

        let mut world = self.world.lock();
        world.end_tick();
        world.verify()
    }

    /// Ask every bot for its next action
    pub fn run_bots(&self) -> Vec<BotAction> {
        if !self.has_fn("on_bot", 3) {
            return Vec::new();
        }
        let bots: Vec<(String, BotMemory, Dynamic)> = self
            .world
            .lock()
            .bots
            .iter()
            .map(|(id, bot)| (id.clone(), BotMemory::new(bot.memory.clone()), bot.config.clone()))
            .collect();

        let mut actions = Vec::new();
        for (bot, memory, config) in bots {
            let args = (RoomApi::new(&self.world), memory, config);
            let Some(result) = self.call_room_fn("on_bot", 3, args) else {
                break;
            };
            match result {
                Ok(value) => {
                    let Some(action) = value.try_cast::<Map>() else {
                        continue;
                    };
                    let kind = action
                        .get("type")
                        .and_then(|v| v.clone().into_immutable_string().ok())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "bot".to_string());
                    let mut payload = dynamic_map_to_json(&action);
                    payload.remove("type");
                    actions.push(BotAction {
                        bot,
                        kind,
                        payload: Value::Object(payload),
                    });
                }
                Err(e) => {
                    warn!(room_id = %self.room_id, bot_id = %bot, error = %e, "Bot hook failed");
                }
            }
        }
        actions
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Run `on_sync` hooks and build this tick's snapshot. Pending effects
    /// are consumed.
    pub fn snapshot(&self) -> SnapshotPacket {
        let caller = self.caller();

        if let Some(caller) = &caller {
            let syncs = self.world.lock().entities.sync_hooks();
            for (id, hook) in syncs {
                let args = (EntityRef::new(&self.world, id), RoomApi::new(&self.world));
                contain(
                    "on_sync",
                    &self.room_id,
                    call_entity_hook(caller, &self.world, id, &hook, args),
                );
            }
        }

        let (render, tick, entities, globals, effects) = {
            let mut world = self.world.lock();
            let effects = std::mem::take(&mut world.state.effects);
            (
                world.render.clone(),
                world.tick,
                world.live_entities(),
                world.state.globals.clone(),
                effects,
            )
        };

        let compute = |callback: &Hook, entity: &Entity| -> RhaiResult<serde_json::Map<String, Value>> {
            let Some(caller) = &caller else {
                return Ok(serde_json::Map::new());
            };
            let args = (EntityRef::new(&self.world, entity.id), RoomApi::new(&self.world));
            let value = caller.call(callback, args)?;
            match value.try_cast::<Map>() {
                Some(derived) => Ok(dynamic_map_to_json(&derived)),
                None => Err("compute must return a map".into()),
            }
        };
        render.compile(tick, &entities, globals, effects, compute)
    }

    /// Payload of `init_state`, sent once to a client that just joined
    pub fn init_state(&self, client: &str) -> Value {
        let world = self.world.lock();
        json!({
            "room_id": world.room_id,
            "client": client,
            "tick": world.tick,
            "players": world.state.players.keys().collect::<Vec<_>>(),
            "globals": world.state.globals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::game::{RoomState, World};

    const DT: f64 = 1.0 / 60.0;

    fn host_for(state: RoomState, source: &str) -> ScriptHost {
        let world = World::new("room-1", EngineConfig::default(), state).shared();
        let mut host = ScriptHost::new(world);
        host.load(source).unwrap();
        host
    }

    fn host_with(source: &str) -> ScriptHost {
        host_for(RoomState::default(), source)
    }

    const INPUT_LOG: &str = r#"
        fn init(room) { room.set_global("log", []); }

        fn on_input(payload, room) {
            let log = room.global("log");
            log.push(payload["type"] + ":" + payload["id"]);
            room.set_global("log", log);
        }

        fn on_update(room, dt) {
            let log = room.global("log");
            log.push("update");
            room.set_global("log", log);
        }
    "#;

    const MOTES: &str = r#"
        room.define("mote", #{
            group: "motes",
            vars: #{ ticks: 0, doomed: false },
            on_update: |e, dt, room| {
                e["ticks"] += 1;
                if e["doomed"] == true { room.destroy(e); }
            }
        });
        room.render_rule("mote", #{ fields: ["x", "ticks"] });

        fn init(room) {
            for i in 0..4 {
                room.create("mote", i * 10, 0, #{ doomed: i % 2 == 0 });
            }
        }
    "#;

    #[test]
    fn inputs_run_in_arrival_order_before_update() {
        let host = host_with(INPUT_LOG);
        host.run_init();
        host.handle_join("p1");
        host.handle_input("p1", "move", json!({"dx": 5}));
        host.handle_input("p1", "shoot", Value::Null);
        host.update(DT).unwrap();

        let log = host.world().lock().state.globals["log"].clone();
        assert_eq!(log, json!(["move:p1", "shoot:p1", "update"]));
    }

    #[test]
    fn input_from_unknown_client_is_ignored() {
        let host = host_with(INPUT_LOG);
        host.run_init();
        host.handle_input("ghost", "move", Value::Null);
        assert_eq!(host.world().lock().state.globals["log"], json!([]));
    }

    #[test]
    fn entities_destroyed_mid_tick_leave_state_and_snapshot() {
        let host = host_with(MOTES);
        host.run_init();
        host.update(DT).unwrap();

        let world = host.world().lock();
        let motes = &world.state.groups["motes"];
        assert_eq!(motes.len(), 2);
        assert!(motes.iter().all(|m| m.vars["ticks"] == json!(1)));
        assert!(motes.iter().all(|m| m.vars["doomed"] == json!(false)));
        drop(world);

        let packet = host.snapshot();
        assert_eq!(packet.entities.len(), 2);
        assert!(packet.entities.iter().all(|e| e["visual"] == json!("mote")));
    }

    #[test]
    fn state_survives_a_save_and_reload() {
        let host = host_with(MOTES);
        host.run_init();
        let blob = host.world().lock().state.to_blob().unwrap();
        let groups = host.world().lock().state.groups.clone();

        let restored = host_for(RoomState::from_blob(&blob).unwrap(), MOTES);
        let world = restored.world().lock();
        assert_eq!(world.state.groups, groups);
        assert_eq!(world.entities.len(), 4);
        assert_eq!(world.state.next_entity_id, 4);
    }

    #[test]
    fn runaway_geometry_is_kept_finite_and_bounded() {
        let host = host_with(
            r#"
            room.define("blob", #{
                body: false,
                on_update: |e, dt, room| {
                    e.vx = 1.0 / 0.0;
                    e.w = 120000.0;
                    e.h = 120000.0;
                    e.x = 0.0 / 0.0;
                }
            });

            fn init(room) { room.create("blob", 0, 0); }

            fn on_update(room, dt) {
                room.set_global("seen", room.query_rect(-1.0e7, -1.0e7, 2.0e7, 2.0e7).len());
            }
            "#,
        );
        host.run_init();
        host.update(DT).unwrap();
        host.update(DT).unwrap();

        let blob = host.world().lock().state.to_blob().unwrap();
        let restored = RoomState::from_blob(&blob).unwrap();
        let entity = &restored.groups["blob"][0];
        let limit = EngineConfig::default().max_entity_size;
        assert!(entity.is_finite());
        assert_eq!(entity.vx, 0.0);
        assert_eq!((entity.w, entity.h), (limit, limit));
        assert_eq!(host.world().lock().state.globals["seen"], json!(1));
    }

    #[test]
    fn failed_reload_keeps_the_previous_program() {
        let mut host = host_with(INPUT_LOG);
        host.run_init();

        assert!(matches!(
            host.load("fn on_update(room, dt) {"),
            Err(ScriptError::Compile(_))
        ));
        assert!(matches!(
            host.load(r#"room.define("x", #{}); throw "boom";"#),
            Err(ScriptError::Compile(_))
        ));
        assert!(host.world().lock().entities.blueprint("x").is_none());

        host.update(DT).unwrap();
        assert_eq!(host.world().lock().state.globals["log"], json!(["update"]));
    }

    #[test]
    fn top_level_cannot_touch_live_state() {
        let world = World::new("room-1", EngineConfig::default(), RoomState::default()).shared();
        let mut host = ScriptHost::new(world);
        let result = host.load(r#"room.define("box", #{}); room.create("box", 0, 0);"#);
        assert!(result.is_err());
        assert!(!host.is_loaded());
        host.update(DT).unwrap();
        assert!(host.snapshot().entities.is_empty());
    }

    #[test]
    fn only_the_entitys_own_hook_may_write_it() {
        let host = host_with(
            r#"
            room.define("box", #{ vars: #{ hp: 3 } });
            room.define("mover", #{ on_update: |e, dt, room| { e.x = 7.0; } });

            fn init(room) {
                room.create("box", 0, 0);
                room.create("mover", 0, 0);
            }

            fn on_update(room, dt) {
                for b in room.find("box") {
                    b.x = 500.0;
                    b["hp"] = 0;
                }
            }
            "#,
        );
        host.run_init();
        host.update(DT).unwrap();

        let world = host.world().lock();
        let boxed = &world.state.groups["box"][0];
        assert_eq!(boxed.x, 0.0);
        assert_eq!(boxed.vars["hp"], json!(3));
        assert_eq!(world.state.groups["mover"][0].x, 7.0);
    }

    #[test]
    fn targeted_signal_reaches_every_member_including_sender() {
        let host = host_with(
            r#"
            room.define("enemy", #{
                group: "enemies",
                vars: #{ hits: 0 },
                on_input: |e, payload, room| e.emit_to("enemies", "hit", #{ dmg: 5 }),
                on_signal: #{ hit: |e, data, sender, room| { e["hits"] += data.dmg; } }
            });
            room.define("ally", #{
                group: "allies",
                vars: #{ hits: 0 },
                on_signal: #{ hit: |e, data, sender, room| { e["hits"] += data.dmg; } }
            });

            fn init(room) {
                room.create("enemy", 0, 0);
                room.create("enemy", 50, 0);
                room.create("ally", 100, 0);
            }

            fn on_join(client, room) {
                room.bind(client, room.find("enemy")[0]);
            }
            "#,
        );
        host.run_init();
        host.handle_join("p1");
        host.handle_input("p1", "fire", Value::Null);

        let world = host.world().lock();
        for enemy in &world.state.groups["enemies"] {
            assert_eq!(enemy.vars["hits"], json!(5));
        }
        assert_eq!(world.state.groups["allies"][0].vars["hits"], json!(0));
    }

    #[test]
    fn bots_keep_memory_between_turns() {
        let host = host_with(
            r#"
            fn init(room) { room.spawn_bot("bot-1", #{ speed: 2 }); }

            fn on_bot(room, memory, config) {
                let turns = if memory.contains("turns") { memory["turns"] } else { 0 };
                memory["turns"] = turns + 1;
                #{ "type": "move", dx: config.speed, turn: turns + 1 }
            }
            "#,
        );
        host.run_init();
        host.update(DT).unwrap();

        let first = host.run_bots();
        assert_eq!(
            first,
            vec![BotAction {
                bot: "bot-1".into(),
                kind: "move".into(),
                payload: json!({"dx": 2, "turn": 1}),
            }]
        );
        assert_eq!(host.run_bots()[0].payload["turn"], json!(2));
        assert!(host.world().lock().state.players["bot-1"].bot);
    }

    #[test]
    fn ai_results_reach_callbacks_until_the_program_changes() {
        let source = r#"
            fn init(room) {
                room.ai("name a colour", |text, ok, room| room.set_global("ai", text));
            }
        "#;
        let mut host = host_with(source);
        host.run_init();
        let requests = host.world().lock().take_ai_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, EngineConfig::default().default_ai_model);

        host.deliver_ai_result(requests[0].ticket, "teal".into(), true);
        assert_eq!(host.world().lock().state.globals["ai"], json!("teal"));

        host.run_init();
        let stale = host.world().lock().take_ai_requests();
        host.load(source).unwrap();
        host.deliver_ai_result(stale[0].ticket, "ochre".into(), true);
        assert_eq!(host.world().lock().state.globals["ai"], json!("teal"));
    }

    #[test]
    fn timers_fire_with_the_room() {
        let host = host_with(
            r#"
            room.wait(0.01, |room| room.set_global("rang", true));
            "#,
        );
        host.update(DT).unwrap();
        assert_eq!(host.world().lock().state.globals["rang"], json!(true));
    }
}
