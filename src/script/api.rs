//! Capability surface exposed to room logic
//!
//! Scripts only ever see three handle types: `Room`, `Entity` and
//! `BotMemory`. Every native function locks the room's world for the
//! shortest possible span and never calls back into the script while
//! holding it.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rhai::{Array, Dynamic, Engine, FnPtr, ImmutableString, Map, NativeCallContext, FLOAT, INT};
use serde_json::Value;
use tracing::{debug, info};

use crate::ai::strip_code_fences;
use crate::game::entity::{Blueprint, Hook};
use crate::game::physics::collide_groups;
use crate::game::snapshot::RenderRule;
use crate::game::state::{Body, BlockPlacement, BotSpawn, Entity};
use crate::game::world::{Phase, MAX_SIGNAL_DEPTH};
use crate::game::{EntityId, SharedWorld};

use super::convert::{dynamic_map_to_json, dynamic_to_json, json_map_to_dynamic, json_to_dynamic, number};
use super::{call_entity_hook, contain, is_falsy, Caller, RhaiResult};

/// Handle to the room a hook runs in
#[derive(Clone)]
pub struct RoomApi {
    world: SharedWorld,
}

/// Handle to one entity; reads always work, writes only inside the
/// entity's own hook
#[derive(Clone)]
pub struct EntityRef {
    world: SharedWorld,
    id: EntityId,
}

/// Per-bot scratch map that survives between `on_bot` calls
#[derive(Clone)]
pub struct BotMemory {
    inner: Arc<Mutex<Map>>,
}

impl RoomApi {
    pub fn new(world: &SharedWorld) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl EntityRef {
    pub fn new(world: &SharedWorld, id: EntityId) -> Self {
        Self {
            world: world.clone(),
            id,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    fn read<T>(&self, f: impl FnOnce(&Entity) -> T) -> Option<T> {
        self.world.lock().entity(self.id).map(f)
    }

    /// Apply a write if the writing window is open, otherwise drop it
    fn write(&self, field: &str, f: impl FnOnce(&mut Entity)) {
        let mut world = self.world.lock();
        if !world.can_write(self.id) {
            debug!(entity_id = self.id, field, "Write outside the entity's hook ignored");
            return;
        }
        if let Some(entity) = world.entity_mut(self.id) {
            f(entity);
        }
    }

    /// Write one geometry field; sizes are clamped to the room's limit
    fn set_geometry(&self, field: &str, value: f64) {
        let value = match field {
            "w" | "h" => self.world.lock().clamp_size(value),
            _ => value,
        };
        self.write(field, |e| match field {
            "x" => e.x = value,
            "y" => e.y = value,
            "w" => e.w = value,
            "h" => e.h = value,
            "vx" => e.vx = value,
            "vy" => e.vy = value,
            _ => {}
        });
    }
}

impl BotMemory {
    pub fn new(inner: Arc<Mutex<Map>>) -> Self {
        Self { inner }
    }
}

fn err<T>(message: impl Into<String>) -> RhaiResult<T> {
    let message: String = message.into();
    Err(message.into())
}

fn num(value: &Dynamic, what: &str) -> RhaiResult<f64> {
    match number(value) {
        Some(v) if v.is_finite() => Ok(v),
        Some(v) => err(format!("{} must be finite, got {}", what, v)),
        None => err(format!("{} must be a number, got {}", what, value.type_name())),
    }
}

fn finite(value: &Dynamic) -> Option<f64> {
    number(value).filter(|v| v.is_finite())
}

/// Accept a function pointer or the name of a script function
fn callable(value: &Dynamic, what: &str) -> RhaiResult<Option<FnPtr>> {
    if value.is_unit() {
        return Ok(None);
    }
    if let Some(ptr) = value.clone().try_cast::<FnPtr>() {
        return Ok(Some(ptr));
    }
    if let Ok(name) = value.clone().into_immutable_string() {
        return FnPtr::new(name.as_str()).map(Some);
    }
    err(format!("{} must be a function, got {}", what, value.type_name()))
}

fn strings(value: &Dynamic, what: &str) -> RhaiResult<Vec<String>> {
    if value.is_unit() {
        return Ok(Vec::new());
    }
    let Some(items) = value.clone().try_cast::<Array>() else {
        return err(format!("{} must be an array of strings", what));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item.into_immutable_string() {
            Ok(s) => out.push(s.to_string()),
            Err(_) => return err(format!("{} must only contain strings", what)),
        }
    }
    Ok(out)
}

/// Turn a `define` map into a blueprint
fn blueprint_from_map(name: &str, desc: &Map) -> RhaiResult<Blueprint> {
    let mut blueprint = Blueprint::new(name);
    let field = |key: &str| desc.get(key).cloned().unwrap_or(Dynamic::UNIT);

    if let Ok(group) = field("group").into_immutable_string() {
        blueprint.group = group.to_string();
    }
    if let Some(vars) = field("vars").try_cast::<Map>() {
        blueprint.defaults = dynamic_map_to_json(&vars);
    }
    if let Some(size) = field("size").try_cast::<Array>() {
        if size.len() != 2 {
            return err("size must be [w, h]");
        }
        blueprint.size = (num(&size[0], "size[0]")?, num(&size[1], "size[1]")?);
    }
    blueprint.channels = strings(&field("channels"), "channels")?;
    blueprint.emits = strings(&field("emits"), "emits")?;
    blueprint.auto_destroy = field("auto_destroy").as_bool().unwrap_or(false);

    let body = field("body");
    if let Ok(enabled) = body.as_bool() {
        blueprint.body = enabled.then(Body::default);
    } else if let Some(settings) = body.try_cast::<Map>() {
        let mut parsed = Body::default();
        if let Some(gravity) = settings.get("gravity").and_then(|v| v.as_bool().ok()) {
            parsed.gravity = gravity;
        }
        if let Some(friction) = settings.get("friction").and_then(finite) {
            parsed.friction = friction;
        }
        parsed.restitution = settings.get("restitution").and_then(finite);
        blueprint.body = Some(parsed);
    }

    let hooks = &mut blueprint.hooks;
    hooks.on_create = callable(&field("on_create"), "on_create")?;
    hooks.on_update = callable(&field("on_update"), "on_update")?;
    hooks.on_collide = callable(&field("on_collide"), "on_collide")?;
    hooks.on_input = callable(&field("on_input"), "on_input")?;
    hooks.on_sync = callable(&field("on_sync"), "on_sync")?;
    if let Some(handlers) = field("on_signal").try_cast::<Map>() {
        for (signal, handler) in handlers {
            if let Some(hook) = callable(&handler, &format!("on_signal.{}", signal))? {
                hooks.on_signal.insert(signal.to_string(), hook);
            }
        }
    }
    Ok(blueprint)
}

fn render_rule_from_map(kind: &str, desc: &Map) -> RhaiResult<RenderRule<Hook>> {
    let visual = desc
        .get("visual")
        .and_then(|v| v.clone().into_immutable_string().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| kind.to_string());
    let fields = strings(
        &desc.get("fields").cloned().unwrap_or(Dynamic::UNIT),
        "fields",
    )?;
    let compute = callable(
        &desc.get("compute").cloned().unwrap_or(Dynamic::UNIT),
        "compute",
    )?;
    Ok(RenderRule {
        visual,
        fields,
        compute,
    })
}

fn block_from(value: &Dynamic) -> RhaiResult<BlockPlacement> {
    let coords = if let Some(map) = value.clone().try_cast::<Map>() {
        let get = |k: &str| map.get(k).and_then(finite);
        (get("x"), get("y"), get("kind").or(Some(1.0)))
    } else if let Some(items) = value.clone().try_cast::<Array>() {
        let get = |i: usize| items.get(i).and_then(finite);
        (get(0), get(1), get(2).or(Some(1.0)))
    } else {
        (None, None, None)
    };
    match coords {
        (Some(x), Some(y), Some(kind)) => Ok(BlockPlacement {
            x: x.floor() as i64,
            y: y.floor() as i64,
            kind: kind.clamp(0.0, 255.0) as u8,
        }),
        _ => err("blocks are #{x, y, kind} or [x, y, kind]"),
    }
}

fn entity_refs(world: &SharedWorld, ids: Vec<EntityId>) -> Array {
    ids.into_iter()
        .map(|id| Dynamic::from(EntityRef::new(world, id)))
        .collect()
}

// ============================================================================
// Shared operations (also used by the host)
// ============================================================================

/// Create an entity, run its `on_create`, then mark it active
pub fn create_entity(
    caller: &Caller<'_>,
    world: &SharedWorld,
    kind: &str,
    x: f64,
    y: f64,
    vars: serde_json::Map<String, Value>,
) -> RhaiResult<EntityRef> {
    let (id, on_create, room_id) = {
        let mut w = world.lock();
        w.require_live("create")?;
        let (id, hook) = w
            .create_entity(kind, x, y, vars)
            .map_err(|e| e.to_string())?;
        (id, hook, w.room_id.clone())
    };
    if let Some(hook) = on_create {
        let args = (EntityRef::new(world, id), RoomApi::new(world));
        contain("on_create", &room_id, call_entity_hook(caller, world, id, &hook, args));
    }
    world.lock().entities.activate(id);
    Ok(EntityRef::new(world, id))
}

/// Run an entity's `on_input`; returns false when it has none
pub fn dispatch_input(
    caller: &Caller<'_>,
    world: &SharedWorld,
    id: EntityId,
    payload: Dynamic,
) -> RhaiResult<bool> {
    let (hook, room_id) = {
        let w = world.lock();
        (w.entities.input_hook(id), w.room_id.clone())
    };
    let Some(hook) = hook else {
        return Ok(false);
    };
    let args = (EntityRef::new(world, id), payload, RoomApi::new(world));
    contain("on_input", &room_id, call_entity_hook(caller, world, id, &hook, args));
    Ok(true)
}

/// Deliver a signal to entity handlers and room listeners. Handler errors
/// are contained; exceeding the nesting depth is an error for the emitter.
pub fn emit_signal(
    caller: &Caller<'_>,
    world: &SharedWorld,
    sender: Option<EntityId>,
    target: Option<&str>,
    name: &str,
    data: Dynamic,
) -> RhaiResult<INT> {
    let (deliveries, listeners, room_id) = {
        let mut w = world.lock();
        w.require_live("emit")?;
        if w.signal_depth >= MAX_SIGNAL_DEPTH {
            return err(format!(
                "signal '{}' nested deeper than {} deliveries",
                name, MAX_SIGNAL_DEPTH
            ));
        }
        let deliveries = w.signal_deliveries(sender, target, name);
        let listeners = w.listeners_for(name);
        w.signal_depth += 1;
        (deliveries, listeners, w.room_id.clone())
    };

    let from = sender
        .map(|id| Dynamic::from(EntityRef::new(world, id)))
        .unwrap_or(Dynamic::UNIT);
    for (id, hook) in &deliveries {
        let args = (
            EntityRef::new(world, *id),
            data.clone(),
            from.clone(),
            RoomApi::new(world),
        );
        contain(name, &room_id, call_entity_hook(caller, world, *id, hook, args));
    }
    for listener in &listeners {
        let args = (data.clone(), from.clone(), RoomApi::new(world));
        contain(name, &room_id, caller.call(listener, args));
    }

    world.lock().signal_depth -= 1;
    Ok(deliveries.len() as INT)
}

// ============================================================================
// Registration
// ============================================================================

pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<RoomApi>("Room");
    engine.register_type_with_name::<EntityRef>("Entity");
    engine.register_type_with_name::<BotMemory>("BotMemory");

    register_entity(engine);
    register_room(engine);
    register_bot_memory(engine);
}

fn register_entity(engine: &mut Engine) {
    engine.register_get("id", |e: &mut EntityRef| e.id as INT);
    engine.register_get("type", |e: &mut EntityRef| {
        e.read(|x| x.kind.clone()).unwrap_or_default()
    });
    engine.register_get("kind", |e: &mut EntityRef| {
        e.read(|x| x.kind.clone()).unwrap_or_default()
    });
    engine.register_get("alive", |e: &mut EntityRef| e.read(|_| ()).is_some());
    engine.register_get("on_ground", |e: &mut EntityRef| {
        e.read(|x| x.on_ground).unwrap_or(false)
    });

    macro_rules! geometry {
        ($($field:ident),*) => {$(
            engine.register_get(stringify!($field), |e: &mut EntityRef| {
                e.read(|x| x.$field as FLOAT).unwrap_or(0.0)
            });
            engine.register_set(stringify!($field), |e: &mut EntityRef, value: Dynamic| {
                match finite(&value) {
                    Some(v) => e.set_geometry(stringify!($field), v),
                    None => debug!(entity_id = e.id, "Non-finite {} ignored", stringify!($field)),
                }
            });
        )*};
    }
    geometry!(x, y, w, h, vx, vy);

    engine.register_indexer_get(|e: &mut EntityRef, key: ImmutableString| {
        e.read(|x| x.vars.get(key.as_str()).map(json_to_dynamic))
            .flatten()
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_indexer_set(|e: &mut EntityRef, key: ImmutableString, value: Dynamic| {
        let value = dynamic_to_json(&value);
        e.write(key.as_str(), |x| {
            x.vars.insert(key.to_string(), value);
        });
    });
    engine.register_fn("vars", |e: &mut EntityRef| {
        e.read(|x| json_map_to_dynamic(&x.vars)).unwrap_or_default()
    });

    engine.register_fn("subscribe", |e: &mut EntityRef, channel: ImmutableString| {
        let mut world = e.world.lock();
        if !world.can_write(e.id) {
            return false;
        }
        let Some(entity) = world.entity_mut(e.id) else {
            return false;
        };
        if entity.channels_in.iter().any(|c| c == channel.as_str()) {
            return false;
        }
        entity.channels_in.push(channel.to_string());
        world.bus.subscribe(e.id, &[channel.as_str()]);
        true
    });
    engine.register_fn("unsubscribe", |e: &mut EntityRef, channel: ImmutableString| {
        let mut world = e.world.lock();
        if !world.can_write(e.id) {
            return false;
        }
        let Some(entity) = world.entity_mut(e.id) else {
            return false;
        };
        let before = entity.channels_in.len();
        entity.channels_in.retain(|c| c != channel.as_str());
        let removed = entity.channels_in.len() != before;
        world.bus.unsubscribe(e.id, channel.as_str());
        removed
    });

    engine.register_fn(
        "emit",
        |ctx: NativeCallContext, e: &mut EntityRef, name: ImmutableString, data: Dynamic| {
            entity_emit(&ctx, e, None, &name, data)
        },
    );
    engine.register_fn(
        "emit",
        |ctx: NativeCallContext, e: &mut EntityRef, name: ImmutableString| {
            entity_emit(&ctx, e, None, &name, Dynamic::UNIT)
        },
    );
    engine.register_fn(
        "emit_to",
        |ctx: NativeCallContext,
         e: &mut EntityRef,
         channel: ImmutableString,
         name: ImmutableString,
         data: Dynamic| { entity_emit(&ctx, e, Some(channel.as_str()), &name, data) },
    );

    engine.register_fn("to_string", |e: &mut EntityRef| {
        let kind = e.read(|x| x.kind.clone()).unwrap_or_else(|| "destroyed".into());
        format!("Entity(#{} {})", e.id, kind)
    });
    engine.register_fn("==", |a: EntityRef, b: EntityRef| a.id == b.id);
    engine.register_fn("!=", |a: EntityRef, b: EntityRef| a.id != b.id);
}

fn entity_emit(
    ctx: &NativeCallContext,
    e: &EntityRef,
    channel: Option<&str>,
    name: &str,
    data: Dynamic,
) -> RhaiResult<INT> {
    if !e.world.lock().can_write(e.id) {
        debug!(entity_id = e.id, signal = name, "Emit outside the entity's hook ignored");
        return Ok(0);
    }
    emit_signal(&Caller::Native(ctx), &e.world, Some(e.id), channel, name, data)
}

fn register_room(engine: &mut Engine) {
    engine.register_get("id", |r: &mut RoomApi| r.world.lock().room_id.clone());
    engine.register_get("tick", |r: &mut RoomApi| r.world.lock().tick as INT);

    // registration
    engine.register_fn("define", |r: &mut RoomApi, name: ImmutableString, desc: Map| -> RhaiResult<()> {
        let blueprint = blueprint_from_map(&name, &desc)?;
        let mut world = r.world.lock();
        if world.phase != Phase::Setup {
            return err("blueprints can only be defined while the program loads");
        }
        if world.entities.blueprint(&name).is_some() {
            return err(format!("blueprint '{}' is already defined", name));
        }
        world.define(blueprint);
        Ok(())
    });
    engine.register_fn("render_rule", |r: &mut RoomApi, kind: ImmutableString, desc: Map| -> RhaiResult<()> {
        let rule = render_rule_from_map(&kind, &desc)?;
        r.world.lock().render.register_rule(kind.to_string(), rule);
        Ok(())
    });
    engine.register_fn("on", |r: &mut RoomApi, signal: ImmutableString, handler: FnPtr| {
        r.world
            .lock()
            .listeners
            .entry(signal.to_string())
            .or_default()
            .push(handler);
    });
    engine.register_fn("wait", |r: &mut RoomApi, seconds: Dynamic, callback: FnPtr| -> RhaiResult<INT> {
        let seconds = num(&seconds, "seconds")?;
        Ok(r.world.lock().scheduler.wait(seconds, callback) as INT)
    });
    engine.register_fn("every", |r: &mut RoomApi, seconds: Dynamic, callback: FnPtr| -> RhaiResult<INT> {
        let seconds = num(&seconds, "seconds")?;
        if seconds <= 0.0 {
            return err("every() needs a positive period");
        }
        Ok(r.world.lock().scheduler.every(seconds, callback) as INT)
    });
    engine.register_fn("cancel", |r: &mut RoomApi, timer: INT| {
        r.world.lock().scheduler.cancel(timer.max(0) as u64)
    });

    // entities
    engine.register_fn(
        "create",
        |ctx: NativeCallContext, r: &mut RoomApi, kind: ImmutableString, x: Dynamic, y: Dynamic| {
            let (x, y) = (num(&x, "x")?, num(&y, "y")?);
            create_entity(&Caller::Native(&ctx), &r.world, &kind, x, y, Default::default())
        },
    );
    engine.register_fn(
        "create",
        |ctx: NativeCallContext,
         r: &mut RoomApi,
         kind: ImmutableString,
         x: Dynamic,
         y: Dynamic,
         vars: Map| {
            let (x, y) = (num(&x, "x")?, num(&y, "y")?);
            let vars = dynamic_map_to_json(&vars);
            create_entity(&Caller::Native(&ctx), &r.world, &kind, x, y, vars)
        },
    );
    engine.register_fn("destroy", |r: &mut RoomApi, target: EntityRef| -> RhaiResult<bool> {
        let mut world = r.world.lock();
        world.require_live("destroy")?;
        Ok(world.destroy_entity(target.id))
    });
    engine.register_fn("destroy", |r: &mut RoomApi, id: INT| -> RhaiResult<bool> {
        let mut world = r.world.lock();
        world.require_live("destroy")?;
        Ok(world.destroy_entity(id.max(0) as EntityId))
    });
    engine.register_fn("entity", |r: &mut RoomApi, id: INT| {
        let id = id.max(0) as EntityId;
        if r.world.lock().entity(id).is_some() {
            Dynamic::from(EntityRef::new(&r.world, id))
        } else {
            Dynamic::UNIT
        }
    });
    engine.register_fn("find", |r: &mut RoomApi, kind: ImmutableString| {
        let ids = r.world.lock().find(&kind);
        entity_refs(&r.world, ids)
    });
    engine.register_fn(
        "query_rect",
        |r: &mut RoomApi, x: Dynamic, y: Dynamic, w: Dynamic, h: Dynamic| -> RhaiResult<Array> {
            let (x, y, w, h) = (num(&x, "x")?, num(&y, "y")?, num(&w, "w")?, num(&h, "h")?);
            let ids = r.world.lock().query_rect(x, y, w, h);
            Ok(entity_refs(&r.world, ids))
        },
    );
    engine.register_fn(
        "query_radius",
        |r: &mut RoomApi, x: Dynamic, y: Dynamic, radius: Dynamic| -> RhaiResult<Array> {
            let (x, y, radius) = (num(&x, "x")?, num(&y, "y")?, num(&radius, "radius")?);
            let ids = r.world.lock().query_radius(x, y, radius);
            Ok(entity_refs(&r.world, ids))
        },
    );
    engine.register_fn(
        "collide_groups",
        |ctx: NativeCallContext,
         r: &mut RoomApi,
         a: ImmutableString,
         b: ImmutableString,
         on_hit: FnPtr|
         -> RhaiResult<INT> {
            let (a_rects, b_rects, cell_size, room_id) = {
                let world = r.world.lock();
                world.require_live("collide_groups")?;
                let a_ids = world.find(&a);
                let b_ids = world.find(&b);
                (
                    world.rects_of(&a_ids),
                    world.rects_of(&b_ids),
                    world.config.grid_cell_size,
                    world.room_id.clone(),
                )
            };
            let caller = Caller::Native(&ctx);
            let consumed = collide_groups(&a_rects, &b_rects, cell_size, |a_id, b_id| {
                if a_id == b_id {
                    return true;
                }
                let args = (
                    EntityRef::new(&r.world, a_id),
                    EntityRef::new(&r.world, b_id),
                    RoomApi::new(&r.world),
                );
                match contain("collide_groups", &room_id, caller.call(&on_hit, args)) {
                    Some(keep) => !is_falsy(&keep),
                    None => true,
                }
            });
            let mut world = r.world.lock();
            for id in &consumed {
                world.destroy_entity(*id);
            }
            Ok(consumed.len() as INT)
        },
    );
    engine.register_fn(
        "dispatch_input",
        |ctx: NativeCallContext, r: &mut RoomApi, target: EntityRef, payload: Dynamic| {
            dispatch_input(&Caller::Native(&ctx), &r.world, target.id, payload)
        },
    );
    engine.register_fn(
        "dispatch_input",
        |ctx: NativeCallContext, r: &mut RoomApi, id: INT, payload: Dynamic| {
            dispatch_input(&Caller::Native(&ctx), &r.world, id.max(0) as EntityId, payload)
        },
    );
    engine.register_fn("bind", |r: &mut RoomApi, client: ImmutableString, target: EntityRef| -> RhaiResult<bool> {
        let mut world = r.world.lock();
        world.require_live("bind")?;
        Ok(world.bind(&client, Some(target.id)))
    });
    engine.register_fn("bind", |r: &mut RoomApi, client: ImmutableString, _none: ()| -> RhaiResult<bool> {
        let mut world = r.world.lock();
        world.require_live("bind")?;
        Ok(world.bind(&client, None))
    });

    // signals
    engine.register_fn(
        "emit",
        |ctx: NativeCallContext, r: &mut RoomApi, name: ImmutableString, data: Dynamic| {
            emit_signal(&Caller::Native(&ctx), &r.world, None, Some(crate::game::signal::GLOBAL_CHANNEL), &name, data)
        },
    );
    engine.register_fn(
        "emit_to",
        |ctx: NativeCallContext,
         r: &mut RoomApi,
         channel: ImmutableString,
         name: ImmutableString,
         data: Dynamic| {
            emit_signal(&Caller::Native(&ctx), &r.world, None, Some(channel.as_str()), &name, data)
        },
    );

    // clients
    engine.register_fn(
        "send_to",
        |r: &mut RoomApi, client: ImmutableString, event: ImmutableString, payload: Dynamic| -> RhaiResult<()> {
            let mut world = r.world.lock();
            world.require_live("send_to")?;
            world.send_to(&client, &event, dynamic_to_json(&payload));
            Ok(())
        },
    );
    engine.register_fn(
        "broadcast",
        |r: &mut RoomApi, event: ImmutableString, payload: Dynamic| -> RhaiResult<()> {
            let mut world = r.world.lock();
            world.require_live("broadcast")?;
            world.broadcast(&event, dynamic_to_json(&payload));
            Ok(())
        },
    );
    engine.register_fn("effect", |r: &mut RoomApi, effect: Dynamic| -> RhaiResult<()> {
        let mut world = r.world.lock();
        world.require_live("effect")?;
        world.state.effects.push(dynamic_to_json(&effect));
        Ok(())
    });

    // state
    engine.register_fn("global", |r: &mut RoomApi, key: ImmutableString| {
        r.world
            .lock()
            .state
            .globals
            .get(key.as_str())
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("set_global", |r: &mut RoomApi, key: ImmutableString, value: Dynamic| -> RhaiResult<()> {
        let mut world = r.world.lock();
        world.require_live("set_global")?;
        world.state.globals.insert(key.to_string(), dynamic_to_json(&value));
        Ok(())
    });
    engine.register_fn("players", |r: &mut RoomApi| {
        r.world
            .lock()
            .state
            .players
            .keys()
            .map(|id| Dynamic::from(id.clone()))
            .collect::<Array>()
    });
    engine.register_fn("player", |r: &mut RoomApi, client: ImmutableString| {
        let world = r.world.lock();
        let Some(record) = world.state.players.get(client.as_str()) else {
            return Dynamic::UNIT;
        };
        let mut out = Map::new();
        out.insert(
            "entity".into(),
            record.entity.map(|id| Dynamic::from(id as INT)).unwrap_or(Dynamic::UNIT),
        );
        out.insert("bot".into(), record.bot.into());
        out.insert("data".into(), json_map_to_dynamic(&record.data).into());
        out.into()
    });
    engine.register_fn(
        "set_player",
        |r: &mut RoomApi, client: ImmutableString, key: ImmutableString, value: Dynamic| -> RhaiResult<bool> {
            let mut world = r.world.lock();
            world.require_live("set_player")?;
            let Some(record) = world.state.players.get_mut(client.as_str()) else {
                return Ok(false);
            };
            record.data.insert(key.to_string(), dynamic_to_json(&value));
            Ok(true)
        },
    );

    // blocks
    engine.register_fn("set_block", |r: &mut RoomApi, x: INT, y: INT, kind: INT| -> RhaiResult<bool> {
        let mut world = r.world.lock();
        world.require_live("set_block")?;
        Ok(world.set_block(x, y, kind.clamp(0, 255) as u8))
    });
    engine.register_fn("clear_block", |r: &mut RoomApi, x: INT, y: INT| -> RhaiResult<bool> {
        let mut world = r.world.lock();
        world.require_live("clear_block")?;
        Ok(world.set_block(x, y, 0))
    });
    engine.register_fn("block", |r: &mut RoomApi, x: INT, y: INT| {
        r.world.lock().state.block(x, y) as INT
    });
    engine.register_fn("queue_blocks", |r: &mut RoomApi, blocks: Array| -> RhaiResult<INT> {
        let placements = blocks.iter().map(block_from).collect::<RhaiResult<Vec<_>>>()?;
        let mut world = r.world.lock();
        world.require_live("queue_blocks")?;
        Ok(world.queue_blocks(placements) as INT)
    });

    // bots
    engine.register_fn("spawn_bot", |r: &mut RoomApi, id: ImmutableString, config: Dynamic| -> RhaiResult<()> {
        let mut world = r.world.lock();
        world.require_live("spawn_bot")?;
        world.state.sys.spawn_bots.push(BotSpawn {
            id: id.to_string(),
            config: dynamic_to_json(&config),
        });
        Ok(())
    });
    engine.register_fn("spawn_bot", |r: &mut RoomApi, id: ImmutableString| -> RhaiResult<()> {
        let mut world = r.world.lock();
        world.require_live("spawn_bot")?;
        world.state.sys.spawn_bots.push(BotSpawn {
            id: id.to_string(),
            config: Value::Null,
        });
        Ok(())
    });
    engine.register_fn("kill_bot", |r: &mut RoomApi, id: ImmutableString| -> RhaiResult<()> {
        let mut world = r.world.lock();
        world.require_live("kill_bot")?;
        world.state.sys.kill_bots.push(id.to_string());
        Ok(())
    });

    // external collaborators
    engine.register_fn(
        "ai",
        |r: &mut RoomApi, prompt: ImmutableString, model: ImmutableString, callback: FnPtr| -> RhaiResult<INT> {
            let mut world = r.world.lock();
            world.require_live("ai")?;
            Ok(world.request_ai(prompt.to_string(), model.to_string(), callback) as INT)
        },
    );
    engine.register_fn("ai", |r: &mut RoomApi, prompt: ImmutableString, callback: FnPtr| -> RhaiResult<INT> {
        let mut world = r.world.lock();
        world.require_live("ai")?;
        let model = world.config.default_ai_model.clone();
        Ok(world.request_ai(prompt.to_string(), model, callback) as INT)
    });
    engine.register_fn("save", |r: &mut RoomApi| -> RhaiResult<()> {
        let mut world = r.world.lock();
        world.require_live("save")?;
        world.request_save();
        Ok(())
    });

    // helpers
    engine.register_fn("parse_json", |_r: &mut RoomApi, text: ImmutableString| {
        match serde_json::from_str::<Value>(strip_code_fences(&text)) {
            Ok(value) => json_to_dynamic(&value),
            Err(e) => {
                debug!(error = %e, "parse_json failed");
                Dynamic::UNIT
            }
        }
    });
    engine.register_fn("log", |r: &mut RoomApi, message: Dynamic| {
        let room_id = r.world.lock().room_id.clone();
        info!(room_id = %room_id, "script: {}", message);
    });
    engine.register_fn("random", |r: &mut RoomApi| r.world.lock().rng.gen::<FLOAT>());
    engine.register_fn("random", |r: &mut RoomApi, lo: INT, hi: INT| -> RhaiResult<INT> {
        if hi <= lo {
            return err("random(lo, hi) needs lo < hi");
        }
        Ok(r.world.lock().rng.gen_range(lo..hi))
    });
}

fn register_bot_memory(engine: &mut Engine) {
    engine.register_indexer_get(|m: &mut BotMemory, key: ImmutableString| {
        m.inner.lock().get(key.as_str()).cloned().unwrap_or(Dynamic::UNIT)
    });
    engine.register_indexer_set(|m: &mut BotMemory, key: ImmutableString, value: Dynamic| {
        m.inner.lock().insert(key.as_str().into(), value);
    });
    engine.register_fn("contains", |m: &mut BotMemory, key: ImmutableString| {
        m.inner.lock().contains_key(key.as_str())
    });
    engine.register_fn("remove", |m: &mut BotMemory, key: ImmutableString| {
        m.inner.lock().remove(key.as_str()).unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("clear", |m: &mut BotMemory| m.inner.lock().clear());
}
