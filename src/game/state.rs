//! Room state - the authoritative, serializable game state
//!
//! Everything in here round-trips through JSON. Live engine structures
//! (spatial grids, channel sets, timers) never live in `RoomState`; they are
//! rebuilt from it after a load or a recompilation.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Room-unique entity identifier
pub type EntityId = u64;

/// Axis-aligned rectangle, origin at the top-left corner (y grows downward)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> f64 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.h
    }

    /// Exact overlap test; rectangles that only share an edge do not overlap
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.right()
            && self.right() > other.x
            && self.y < other.bottom()
            && self.bottom() > other.y
    }

    /// Distance from a point to the closest point of the rectangle;
    /// infinite for a rectangle with non-finite bounds
    pub fn distance_to(&self, px: f64, py: f64) -> f64 {
        if ![self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite()) {
            return f64::INFINITY;
        }
        let dx = (self.x - px).max(px - self.right()).max(0.0);
        let dy = (self.y - py).max(py - self.bottom()).max(0.0);
        (dx * dx + dy * dy).sqrt()
    }
}

/// Physical body settings copied from the blueprint at creation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Body {
    /// Whether gravity accelerates this body
    #[serde(default = "default_true")]
    pub gravity: bool,
    /// Horizontal velocity multiplier applied every tick (1.0 = frictionless)
    #[serde(default = "default_friction")]
    pub friction: f64,
    /// Bounce factor; `None` stops the body dead on contact
    #[serde(default)]
    pub restitution: Option<f64>,
}

impl Default for Body {
    fn default() -> Self {
        Self {
            gravity: true,
            friction: 1.0,
            restitution: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_friction() -> f64 {
    1.0
}

/// JSON has no form for NaN or infinity and writes them as `null`
fn number_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}

/// A live game object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// Blueprint name
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "number_or_zero")]
    pub x: f64,
    #[serde(deserialize_with = "number_or_zero")]
    pub y: f64,
    #[serde(deserialize_with = "number_or_zero")]
    pub w: f64,
    #[serde(deserialize_with = "number_or_zero")]
    pub h: f64,
    #[serde(default, deserialize_with = "number_or_zero")]
    pub vx: f64,
    #[serde(default, deserialize_with = "number_or_zero")]
    pub vy: f64,
    #[serde(default)]
    pub vars: Map<String, Value>,
    /// Channels this entity is subscribed to
    #[serde(default)]
    pub channels_in: Vec<String>,
    /// Channels a channel-less `emit` from this entity goes to
    #[serde(default)]
    pub channels_out: Vec<String>,
    #[serde(default)]
    pub on_ground: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

impl Entity {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }

    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.w, self.h, self.vx, self.vy]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Zero every non-finite geometry field. Returns true if anything changed.
    pub fn scrub_non_finite(&mut self) -> bool {
        let mut changed = false;
        for v in [
            &mut self.x,
            &mut self.y,
            &mut self.w,
            &mut self.h,
            &mut self.vx,
            &mut self.vy,
        ] {
            if !v.is_finite() {
                *v = 0.0;
                changed = true;
            }
        }
        changed
    }

    /// Look up a field by name: built-in geometry first, then `vars`
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "id" => Value::from(self.id),
            "type" | "kind" => Value::from(self.kind.clone()),
            "x" => Value::from(self.x),
            "y" => Value::from(self.y),
            "w" => Value::from(self.w),
            "h" => Value::from(self.h),
            "vx" => Value::from(self.vx),
            "vy" => Value::from(self.vy),
            "on_ground" => Value::from(self.on_ground),
            _ => return self.vars.get(name).cloned(),
        };
        Some(value)
    }
}

/// A connected client or bot as seen by game logic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Entity driven by this player's input, if bound
    #[serde(default)]
    pub entity: Option<EntityId>,
    #[serde(default)]
    pub bot: bool,
    /// Free-form data owned by game logic
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// One block waiting in the build queue
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockPlacement {
    pub x: i64,
    pub y: i64,
    pub kind: u8,
}

/// Request to add a server-side bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSpawn {
    pub id: String,
    #[serde(default)]
    pub config: Value,
}

/// Internal control queues, reset whenever a room is loaded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysQueues {
    #[serde(default)]
    pub spawn_bots: Vec<BotSpawn>,
    #[serde(default)]
    pub kill_bots: Vec<String>,
    #[serde(default)]
    pub build_queue: VecDeque<BlockPlacement>,
}

/// The persisted state of one room
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    #[serde(default)]
    pub players: BTreeMap<String, PlayerRecord>,
    /// Entity arrays keyed by blueprint group
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<Entity>>,
    /// UI values attached verbatim to every snapshot
    #[serde(default)]
    pub globals: Map<String, Value>,
    /// One-shot effects pending delivery with the next snapshot
    #[serde(default)]
    pub effects: Vec<Value>,
    /// Sparse block map, `"bx,by" -> kind`
    #[serde(default)]
    pub blocks: BTreeMap<String, u8>,
    #[serde(default, rename = "_sys")]
    pub sys: SysQueues,
    #[serde(default)]
    pub next_entity_id: EntityId,
}

impl RoomState {
    /// Serialize for persistence. Non-finite entity geometry is written as 0
    /// so the blob always loads again.
    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        let finite = self.groups.values().flatten().all(Entity::is_finite);
        if finite {
            return serde_json::to_string(self);
        }
        let mut clean = self.clone();
        for entity in clean.groups.values_mut().flatten() {
            entity.scrub_non_finite();
        }
        serde_json::to_string(&clean)
    }

    /// Restore from persistence; internal queues and bots start empty
    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        let mut state: Self = serde_json::from_str(blob)?;
        state.sys = SysQueues::default();
        state.players.retain(|_, player| !player.bot);
        Ok(state)
    }

    /// Hand out the next entity id
    pub fn allocate_id(&mut self) -> EntityId {
        self.next_entity_id += 1;
        self.next_entity_id
    }

    pub fn block(&self, bx: i64, by: i64) -> u8 {
        self.blocks.get(&block_key(bx, by)).copied().unwrap_or(0)
    }

    /// Place a block; kind 0 clears the cell. Returns true if the map changed.
    pub fn set_block(&mut self, bx: i64, by: i64, kind: u8) -> bool {
        let key = block_key(bx, by);
        if kind == 0 {
            self.blocks.remove(&key).is_some()
        } else {
            self.blocks.insert(key, kind) != Some(kind)
        }
    }

    /// Iterate blocks as `(bx, by, kind)`, skipping malformed keys
    pub fn iter_blocks(&self) -> impl Iterator<Item = (i64, i64, u8)> + '_ {
        self.blocks
            .iter()
            .filter_map(|(key, kind)| parse_block_key(key).map(|(bx, by)| (bx, by, *kind)))
    }
}

pub fn block_key(bx: i64, by: i64) -> String {
    format!("{},{}", bx, by)
}

fn parse_block_key(key: &str) -> Option<(i64, i64)> {
    let (x, y) = key.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}
