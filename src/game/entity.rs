//! Blueprint-driven entity lifecycle
//!
//! Entities live in the room state's group arrays; the registry keeps an
//! id-indexed slot per entity (lifecycle + blueprint) and the creation-ordered
//! live list. Every mutation goes through both so the two never disagree.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rhai::FnPtr;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::signal::{SignalBus, GLOBAL_CHANNEL};
use super::state::{Body, Entity, EntityId, RoomState};
use super::EngineError;

/// A script callable attached to a blueprint
pub type Hook = FnPtr;

/// Behavior hooks, resolved once when the blueprint is defined
#[derive(Debug, Clone, Default)]
pub struct HookTable {
    pub on_create: Option<Hook>,
    pub on_update: Option<Hook>,
    pub on_collide: Option<Hook>,
    pub on_input: Option<Hook>,
    pub on_sync: Option<Hook>,
    /// Signal name -> handler
    pub on_signal: HashMap<String, Hook>,
}

/// Named entity template
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub name: String,
    /// Key of the state array holding these entities
    pub group: String,
    /// Default `vars`, overlaid by per-instance extras
    pub defaults: Map<String, Value>,
    pub size: (f64, f64),
    /// Extra channels subscribed on creation
    pub channels: Vec<String>,
    /// Outbound channels for channel-less emits
    pub emits: Vec<String>,
    /// Destroy the entity once it has no subscriptions left
    pub auto_destroy: bool,
    pub body: Option<Body>,
    pub hooks: HookTable,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            group: name.clone(),
            name,
            defaults: Map::new(),
            size: (32.0, 32.0),
            channels: Vec::new(),
            emits: Vec::new(),
            auto_destroy: false,
            body: None,
            hooks: HookTable::default(),
        }
    }
}

/// Created -> Active -> PendingDestroy; a removed entity has no slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Instantiated, `on_create` not yet finished
    Created,
    Active,
    /// Destroyed while the tick loop was iterating; swept at `end_tick`
    PendingDestroy,
}

#[derive(Debug, Clone)]
struct Slot {
    blueprint: Arc<Blueprint>,
    lifecycle: Lifecycle,
}

#[derive(Debug, Default)]
pub struct EntityRegistry {
    blueprints: HashMap<String, Arc<Blueprint>>,
    slots: HashMap<EntityId, Slot>,
    /// Live ids in creation order
    live: Vec<EntityId>,
    ticking: bool,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blueprint and make sure its group array exists
    pub fn define(&mut self, blueprint: Blueprint, state: &mut RoomState) {
        state.groups.entry(blueprint.group.clone()).or_default();
        debug!(blueprint = %blueprint.name, group = %blueprint.group, "Blueprint defined");
        self.blueprints
            .insert(blueprint.name.clone(), Arc::new(blueprint));
    }

    pub fn blueprint(&self, kind: &str) -> Option<&Arc<Blueprint>> {
        self.blueprints.get(kind)
    }

    pub fn blueprint_of(&self, id: EntityId) -> Option<&Arc<Blueprint>> {
        self.slots.get(&id).map(|slot| &slot.blueprint)
    }

    pub fn blueprint_count(&self) -> usize {
        self.blueprints.len()
    }

    /// Swap out the whole blueprint table, returning the previous one
    pub fn replace_blueprints(
        &mut self,
        blueprints: HashMap<String, Arc<Blueprint>>,
    ) -> HashMap<String, Arc<Blueprint>> {
        std::mem::replace(&mut self.blueprints, blueprints)
    }

    /// Instantiate a blueprint. The entity starts `Created`; the caller runs
    /// `on_create` and then calls `activate`.
    pub fn create(
        &mut self,
        kind: &str,
        x: f64,
        y: f64,
        extra: Map<String, Value>,
        state: &mut RoomState,
        bus: &mut SignalBus,
    ) -> Result<EntityId, EngineError> {
        let blueprint = self
            .blueprints
            .get(kind)
            .cloned()
            .ok_or_else(|| EngineError::UnknownBlueprint(kind.to_string()))?;

        let mut vars = blueprint.defaults.clone();
        vars.extend(extra);

        let mut channels_in = Vec::with_capacity(blueprint.channels.len() + 2);
        for channel in [blueprint.group.as_str(), GLOBAL_CHANNEL]
            .into_iter()
            .chain(blueprint.channels.iter().map(String::as_str))
        {
            if !channels_in.iter().any(|c: &String| c == channel) {
                channels_in.push(channel.to_string());
            }
        }

        let id = state.allocate_id();
        let entity = Entity {
            id,
            kind: blueprint.name.clone(),
            x,
            y,
            w: blueprint.size.0,
            h: blueprint.size.1,
            vx: 0.0,
            vy: 0.0,
            vars,
            channels_in,
            channels_out: blueprint.emits.clone(),
            on_ground: false,
            body: blueprint.body,
        };

        bus.subscribe(id, &entity.channels_in);
        state
            .groups
            .entry(blueprint.group.clone())
            .or_default()
            .push(entity);
        self.slots.insert(
            id,
            Slot {
                blueprint,
                lifecycle: Lifecycle::Created,
            },
        );
        self.live.push(id);
        Ok(id)
    }

    pub fn activate(&mut self, id: EntityId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            if slot.lifecycle == Lifecycle::Created {
                slot.lifecycle = Lifecycle::Active;
            }
        }
    }

    pub fn lifecycle(&self, id: EntityId) -> Option<Lifecycle> {
        self.slots.get(&id).map(|slot| slot.lifecycle)
    }

    /// Alive means present and not waiting to be swept
    pub fn is_alive(&self, id: EntityId) -> bool {
        matches!(
            self.lifecycle(id),
            Some(Lifecycle::Created | Lifecycle::Active)
        )
    }

    /// Destroy an entity. While the tick loop runs removal is deferred to
    /// `end_tick`; otherwise the entity leaves state, registry and bus now.
    pub fn destroy(&mut self, id: EntityId, state: &mut RoomState, bus: &mut SignalBus) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        if slot.lifecycle == Lifecycle::PendingDestroy {
            return false;
        }
        if self.ticking {
            slot.lifecycle = Lifecycle::PendingDestroy;
        } else {
            self.remove(id, state, bus);
        }
        true
    }

    /// Start the entity loop: marks the registry as iterating and returns
    /// every active entity with an `on_update` hook, in creation order.
    pub fn begin_tick(&mut self) -> Vec<(EntityId, Hook)> {
        self.ticking = true;
        self.live
            .iter()
            .filter_map(|id| {
                let slot = self.slots.get(id)?;
                if slot.lifecycle != Lifecycle::Active {
                    return None;
                }
                slot.blueprint.hooks.on_update.clone().map(|hook| (*id, hook))
            })
            .collect()
    }

    /// The single sweep point of a tick. Auto-destroy entities with no
    /// subscriptions left are marked, then every pending entity is removed
    /// from both the state arrays and the live list. Returns removed ids.
    pub fn end_tick(&mut self, state: &mut RoomState, bus: &mut SignalBus) -> Vec<EntityId> {
        for entities in state.groups.values() {
            for entity in entities {
                if !entity.channels_in.is_empty() {
                    continue;
                }
                if let Some(slot) = self.slots.get_mut(&entity.id) {
                    if slot.blueprint.auto_destroy && slot.lifecycle == Lifecycle::Active {
                        slot.lifecycle = Lifecycle::PendingDestroy;
                    }
                }
            }
        }

        let doomed: Vec<EntityId> = self
            .live
            .iter()
            .copied()
            .filter(|id| self.lifecycle(*id) == Some(Lifecycle::PendingDestroy))
            .collect();
        for id in &doomed {
            self.remove(*id, state, bus);
        }
        self.ticking = false;
        doomed
    }

    /// Rebuild slots and subscriptions from persisted state after a load or
    /// recompilation. Entities whose blueprint no longer exists are dropped.
    pub fn adopt(&mut self, state: &mut RoomState, bus: &mut SignalBus) -> usize {
        self.slots.clear();
        self.live.clear();
        self.ticking = false;
        bus.clear();

        let mut max_id = state.next_entity_id;
        let mut seen = BTreeSet::new();
        for (group, entities) in state.groups.iter_mut() {
            entities.retain(|entity| {
                let Some(blueprint) = self.blueprints.get(&entity.kind) else {
                    warn!(entity_id = entity.id, kind = %entity.kind, group = %group, "Dropping entity with no blueprint");
                    return false;
                };
                if !seen.insert(entity.id) {
                    warn!(entity_id = entity.id, "Dropping duplicate entity id");
                    return false;
                }
                self.slots.insert(
                    entity.id,
                    Slot {
                        blueprint: blueprint.clone(),
                        lifecycle: Lifecycle::Active,
                    },
                );
                true
            });
            for entity in entities.iter() {
                bus.subscribe(entity.id, &entity.channels_in);
                max_id = max_id.max(entity.id);
            }
        }
        for blueprint in self.blueprints.values() {
            state.groups.entry(blueprint.group.clone()).or_default();
        }

        state.next_entity_id = max_id;
        self.live = seen.into_iter().collect();
        self.live.len()
    }

    /// Check that state arrays and the live list hold exactly the same ids,
    /// each exactly once
    pub fn verify(&self, state: &RoomState) -> Result<(), EngineError> {
        let mut in_state = BTreeSet::new();
        for (group, entities) in &state.groups {
            for entity in entities {
                if !in_state.insert(entity.id) {
                    return Err(EngineError::Fatal(format!(
                        "entity {} appears more than once (group {})",
                        entity.id, group
                    )));
                }
                if !self.slots.contains_key(&entity.id) {
                    return Err(EngineError::Fatal(format!(
                        "entity {} in group {} is unknown to the registry",
                        entity.id, group
                    )));
                }
            }
        }
        if in_state.len() != self.live.len() || self.slots.len() != self.live.len() {
            return Err(EngineError::Fatal(format!(
                "registry tracks {} entities but state holds {}",
                self.live.len(),
                in_state.len()
            )));
        }
        Ok(())
    }

    pub fn live_ids(&self) -> &[EntityId] {
        &self.live
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn input_hook(&self, id: EntityId) -> Option<Hook> {
        self.alive_hooks(id)?.on_input.clone()
    }

    pub fn create_hook(&self, id: EntityId) -> Option<Hook> {
        self.alive_hooks(id)?.on_create.clone()
    }

    pub fn collide_hook(&self, id: EntityId) -> Option<Hook> {
        self.alive_hooks(id)?.on_collide.clone()
    }

    /// Signal handler for `name`, if the entity's blueprint has one
    pub fn signal_hook(&self, id: EntityId, name: &str) -> Option<Hook> {
        self.alive_hooks(id)?.on_signal.get(name).cloned()
    }

    /// Alive entities with an `on_sync` hook, in creation order
    pub fn sync_hooks(&self) -> Vec<(EntityId, Hook)> {
        self.live
            .iter()
            .filter_map(|id| self.alive_hooks(*id)?.on_sync.clone().map(|h| (*id, h)))
            .collect()
    }

    /// Alive entities whose blueprint reacts to collisions
    pub fn colliders(&self) -> Vec<(EntityId, Hook)> {
        self.live
            .iter()
            .filter_map(|id| self.collide_hook(*id).map(|h| (*id, h)))
            .collect()
    }

    pub fn locate<'s>(&self, state: &'s RoomState, id: EntityId) -> Option<&'s Entity> {
        let slot = self.slots.get(&id)?;
        state
            .groups
            .get(&slot.blueprint.group)?
            .iter()
            .find(|e| e.id == id)
            .or_else(|| {
                state
                    .groups
                    .values()
                    .flat_map(|entities| entities.iter())
                    .find(|e| e.id == id)
            })
    }

    pub fn locate_mut<'s>(&self, state: &'s mut RoomState, id: EntityId) -> Option<&'s mut Entity> {
        self.slots.get(&id)?;
        state
            .groups
            .values_mut()
            .flat_map(|entities| entities.iter_mut())
            .find(|e| e.id == id)
    }

    fn alive_hooks(&self, id: EntityId) -> Option<&HookTable> {
        let slot = self.slots.get(&id)?;
        if slot.lifecycle == Lifecycle::PendingDestroy {
            return None;
        }
        Some(&slot.blueprint.hooks)
    }

    fn remove(&mut self, id: EntityId, state: &mut RoomState, bus: &mut SignalBus) {
        if self.slots.remove(&id).is_none() {
            return;
        }
        self.live.retain(|live| *live != id);
        for entities in state.groups.values_mut() {
            if let Some(pos) = entities.iter().position(|e| e.id == id) {
                let entity = entities.remove(pos);
                bus.unsubscribe_all(id, &entity.channels_in);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hook(name: &str) -> Hook {
        FnPtr::new(name).unwrap()
    }

    fn setup() -> (EntityRegistry, RoomState, SignalBus) {
        let mut registry = EntityRegistry::new();
        let mut state = RoomState::default();

        let mut enemy = Blueprint::new("slime");
        enemy.group = "enemies".into();
        enemy.defaults = json!({"hp": 3}).as_object().cloned().unwrap();
        enemy.channels = vec!["hostile".into()];
        enemy.hooks.on_update = Some(hook("slime_update"));
        enemy
            .hooks
            .on_signal
            .insert("hit".into(), hook("slime_hit"));
        registry.define(enemy, &mut state);

        let mut spark = Blueprint::new("spark");
        spark.auto_destroy = true;
        registry.define(spark, &mut state);

        (registry, state, SignalBus::new())
    }

    #[test]
    fn create_wires_state_registry_and_channels() {
        let (mut registry, mut state, mut bus) = setup();
        let extra = json!({"hp": 9, "tag": "boss"}).as_object().cloned().unwrap();
        let id = registry
            .create("slime", 10.0, 20.0, extra, &mut state, &mut bus)
            .unwrap();

        let entity = registry.locate(&state, id).unwrap();
        assert_eq!(entity.vars["hp"], json!(9));
        assert_eq!(entity.vars["tag"], json!("boss"));
        assert_eq!(entity.channels_in, vec!["enemies", "global", "hostile"]);
        assert_eq!(state.groups["enemies"].len(), 1);
        assert_eq!(bus.subscribers("hostile"), vec![id]);
        assert_eq!(registry.lifecycle(id), Some(Lifecycle::Created));
        registry.activate(id);
        assert_eq!(registry.lifecycle(id), Some(Lifecycle::Active));
        assert!(registry.signal_hook(id, "hit").is_some());
        assert!(registry.signal_hook(id, "heal").is_none());
    }

    #[test]
    fn unknown_blueprint_is_rejected() {
        let (mut registry, mut state, mut bus) = setup();
        let err = registry
            .create("dragon", 0.0, 0.0, Map::new(), &mut state, &mut bus)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownBlueprint(kind) if kind == "dragon"));
    }

    #[test]
    fn destroy_during_tick_is_deferred_to_the_sweep() {
        let (mut registry, mut state, mut bus) = setup();
        let ids: Vec<EntityId> = (0..3)
            .map(|i| {
                let id = registry
                    .create("slime", i as f64, 0.0, Map::new(), &mut state, &mut bus)
                    .unwrap();
                registry.activate(id);
                id
            })
            .collect();

        let updates = registry.begin_tick();
        assert_eq!(updates.len(), 3);

        // the first entity's behavior kills its neighbour mid-iteration
        assert!(registry.destroy(ids[1], &mut state, &mut bus));
        assert!(!registry.destroy(ids[1], &mut state, &mut bus));
        assert!(!registry.is_alive(ids[1]));
        assert_eq!(state.groups["enemies"].len(), 3, "still present mid-tick");
        assert_eq!(registry.live_ids(), ids.as_slice());

        let removed = registry.end_tick(&mut state, &mut bus);
        assert_eq!(removed, vec![ids[1]]);
        assert_eq!(registry.live_ids(), &[ids[0], ids[2]]);
        assert!(state.groups["enemies"].iter().all(|e| e.id != ids[1]));
        assert!(!bus.subscribers("hostile").contains(&ids[1]));
        registry.verify(&state).unwrap();
    }

    #[test]
    fn destroy_outside_tick_is_immediate() {
        let (mut registry, mut state, mut bus) = setup();
        let id = registry
            .create("slime", 0.0, 0.0, Map::new(), &mut state, &mut bus)
            .unwrap();
        assert!(registry.destroy(id, &mut state, &mut bus));
        assert!(state.groups["enemies"].is_empty());
        assert!(registry.is_empty());
        assert!(!bus.has_channel("hostile"));
    }

    #[test]
    fn channel_less_auto_destroy_entities_are_swept() {
        let (mut registry, mut state, mut bus) = setup();
        let id = registry
            .create("spark", 0.0, 0.0, Map::new(), &mut state, &mut bus)
            .unwrap();
        registry.activate(id);

        registry.begin_tick();
        assert!(registry.end_tick(&mut state, &mut bus).is_empty());

        let spark = registry.locate_mut(&mut state, id).unwrap();
        let channels = std::mem::take(&mut spark.channels_in);
        bus.unsubscribe_all(id, &channels);

        registry.begin_tick();
        assert_eq!(registry.end_tick(&mut state, &mut bus), vec![id]);
        assert!(state.groups["spark"].is_empty());
    }

    #[test]
    fn adopt_rebuilds_from_reloaded_state() {
        let (mut registry, mut state, mut bus) = setup();
        let a = registry
            .create("slime", 1.0, 2.0, Map::new(), &mut state, &mut bus)
            .unwrap();
        let b = registry
            .create("spark", 3.0, 4.0, Map::new(), &mut state, &mut bus)
            .unwrap();

        let blob = state.to_blob().unwrap();
        let mut reloaded = RoomState::from_blob(&blob).unwrap();
        let (mut fresh, _, mut fresh_bus) = setup();
        // blueprints re-registered by the recompiled logic
        for bp in ["slime", "spark"] {
            let blueprint = registry.blueprint(bp).unwrap().as_ref().clone();
            fresh.define(blueprint, &mut reloaded);
        }

        assert_eq!(fresh.adopt(&mut reloaded, &mut fresh_bus), 2);
        assert_eq!(reloaded.groups, state.groups);
        assert_eq!(fresh.live_ids(), &[a, b]);
        assert_eq!(fresh_bus.subscribers("hostile"), vec![a]);
        fresh.verify(&reloaded).unwrap();

        let next = fresh
            .create("spark", 0.0, 0.0, Map::new(), &mut reloaded, &mut fresh_bus)
            .unwrap();
        assert!(next > b);
    }

    #[test]
    fn verify_flags_entities_the_registry_does_not_know() {
        let (mut registry, mut state, mut bus) = setup();
        let id = registry
            .create("slime", 0.0, 0.0, Map::new(), &mut state, &mut bus)
            .unwrap();
        let mut ghost = registry.locate(&state, id).unwrap().clone();
        ghost.id = 999;
        state.groups.get_mut("enemies").unwrap().push(ghost);
        assert!(matches!(
            registry.verify(&state),
            Err(EngineError::Fatal(_))
        ));
    }
}
