//! Snapshot building: live entities -> whitelisted, rounded wire packet
//!
//! Every tick ships a full snapshot; there is no delta encoding.

use std::collections::HashMap;
use std::fmt::Display;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::state::Entity;

/// How one entity type is shown to clients
#[derive(Debug, Clone)]
pub struct RenderRule<C> {
    /// Name the client renderer knows this entity by
    pub visual: String,
    /// Entity fields copied into the snapshot
    pub fields: Vec<String>,
    /// Optional derived-field callback
    pub compute: Option<C>,
}

/// Packet broadcast to every client of a room once per tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotPacket {
    pub tick: u64,
    pub globals: Map<String, Value>,
    pub entities: Vec<Value>,
    pub effects: Vec<Value>,
}

/// Builds snapshots for network transmission
#[derive(Debug, Clone)]
pub struct RenderCompiler<C> {
    rules: HashMap<String, RenderRule<C>>,
    precision: u32,
}

impl<C: Clone> RenderCompiler<C> {
    pub fn new(precision: u32) -> Self {
        Self {
            rules: HashMap::new(),
            precision,
        }
    }

    pub fn register_rule(&mut self, kind: impl Into<String>, rule: RenderRule<C>) {
        self.rules.insert(kind.into(), rule);
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Build a snapshot.
    ///
    /// Entities whose type has no rule never leave the server. `compute`
    /// evaluates a rule's derived-field callback; its fields are merged over
    /// the base object. A failing callback is logged and the entity is
    /// still sent with its base fields.
    pub fn compile<'a, I, F, E>(
        &self,
        tick: u64,
        entities: I,
        globals: Map<String, Value>,
        effects: Vec<Value>,
        mut compute: F,
    ) -> SnapshotPacket
    where
        I: IntoIterator<Item = &'a Entity>,
        F: FnMut(&C, &Entity) -> Result<Map<String, Value>, E>,
        E: Display,
    {
        let mut out = Vec::new();
        for entity in entities {
            let Some(rule) = self.rules.get(&entity.kind) else {
                continue;
            };

            let mut object = Map::new();
            object.insert("id".into(), Value::from(entity.id));
            object.insert("visual".into(), Value::from(rule.visual.clone()));
            for field in &rule.fields {
                if let Some(value) = entity.field(field) {
                    object.insert(field.clone(), self.round_value(value));
                }
            }

            if let Some(callback) = &rule.compute {
                match compute(callback, entity) {
                    Ok(derived) => {
                        for (key, value) in derived {
                            object.insert(key, self.round_value(value));
                        }
                    }
                    Err(e) => {
                        warn!(entity_id = entity.id, kind = %entity.kind, error = %e, "Render compute failed");
                    }
                }
            }

            out.push(Value::Object(object));
        }

        SnapshotPacket {
            tick,
            globals,
            entities: out,
            effects,
        }
    }

    /// Round floating-point numbers; integers and non-numbers pass through
    fn round_value(&self, value: Value) -> Value {
        match &value {
            Value::Number(n) if n.is_f64() => n
                .as_f64()
                .map(|f| Value::from(round_to(f, self.precision)))
                .unwrap_or(value),
            _ => value,
        }
    }
}

/// Round to `precision` decimal places
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: u64, kind: &str, x: f64) -> Entity {
        Entity {
            id,
            kind: kind.into(),
            x,
            y: 1.0 / 3.0,
            w: 10.0,
            h: 10.0,
            vx: 0.0,
            vy: 0.0,
            vars: json!({"hp": 7, "name": "Ana", "secret": 42})
                .as_object()
                .cloned()
                .unwrap(),
            channels_in: vec![],
            channels_out: vec![],
            on_ground: false,
            body: None,
        }
    }

    fn compiler() -> RenderCompiler<&'static str> {
        let mut compiler = RenderCompiler::new(2);
        compiler.register_rule(
            "hero",
            RenderRule {
                visual: "hero_sprite".into(),
                fields: vec!["x".into(), "y".into(), "hp".into(), "name".into()],
                compute: None,
            },
        );
        compiler
    }

    fn no_compute(_: &&'static str, _: &Entity) -> Result<Map<String, Value>, String> {
        Ok(Map::new())
    }

    #[test]
    fn unregistered_types_are_omitted_and_fields_whitelisted() {
        let compiler = compiler();
        let entities = [entity(1, "hero", 10.5551), entity(2, "trigger", 0.0)];
        let packet = compiler.compile(
            9,
            &entities,
            json!({"round": 3}).as_object().cloned().unwrap(),
            vec![json!({"kind": "boom"})],
            no_compute,
        );

        assert_eq!(packet.tick, 9);
        assert_eq!(packet.entities.len(), 1);
        let hero = &packet.entities[0];
        assert_eq!(hero["id"], json!(1));
        assert_eq!(hero["visual"], json!("hero_sprite"));
        assert_eq!(hero["x"], json!(10.56));
        assert_eq!(hero["y"], json!(0.33));
        assert_eq!(hero["hp"], json!(7));
        assert_eq!(hero["name"], json!("Ana"));
        assert!(hero.get("secret").is_none());
        assert_eq!(packet.globals["round"], json!(3));
        assert_eq!(packet.effects, vec![json!({"kind": "boom"})]);
    }

    #[test]
    fn compute_output_merges_over_base_and_failures_are_contained() {
        let mut compiler = compiler();
        compiler.register_rule(
            "slime",
            RenderRule {
                visual: "slime".into(),
                fields: vec!["x".into()],
                compute: Some("broken"),
            },
        );
        compiler.register_rule(
            "bat",
            RenderRule {
                visual: "bat".into(),
                fields: vec!["x".into()],
                compute: Some("health"),
            },
        );

        let entities = [entity(1, "slime", 1.0), entity(2, "bat", 2.0)];
        let packet = compiler.compile(0, &entities, Map::new(), vec![], |cb, e| {
            if *cb == "broken" {
                return Err(format!("no hp bar for {}", e.id));
            }
            let mut derived = Map::new();
            derived.insert("hp_pct".into(), json!(2.0 / 3.0));
            derived.insert("x".into(), json!(99));
            Ok(derived)
        });

        assert_eq!(packet.entities.len(), 2);
        assert_eq!(packet.entities[0]["x"], json!(1.0));
        assert_eq!(packet.entities[1]["hp_pct"], json!(0.67));
        assert_eq!(packet.entities[1]["x"], json!(99));
    }

    #[test]
    fn precision_is_configuration() {
        assert_eq!(round_to(10.5551, 2), 10.56);
        assert_eq!(round_to(10.5551, 0), 11.0);
        assert_eq!(round_to(-1.23456, 3), -1.235);
    }
}
