//! Sandboxed game logic
//!
//! Room logic is a rhai program. Its top level registers blueprints, render
//! rules, listeners and timers; named functions (`on_update`, `on_input`,
//! `on_bot`, `on_join`, `on_leave`, `init`) are the room-level hooks.

pub mod api;
pub mod convert;
pub mod host;

pub use host::{BotAction, ScriptHost};

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, FuncArgs, NativeCallContext, AST};
use tracing::warn;

use crate::game::{EntityId, SharedWorld};

pub type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Errors surfaced by the script host
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The program failed to parse or its top level failed to run
    #[error("Compile error: {0}")]
    Compile(String),
}

/// Where a script callable is invoked from.
///
/// Host code calls against the compiled program; native functions already
/// running inside a script call through their call context so nested calls
/// share the caller's limits and function library.
pub enum Caller<'a> {
    Host { engine: &'a Engine, ast: &'a AST },
    Native(&'a NativeCallContext<'a>),
}

impl Caller<'_> {
    pub fn call(&self, hook: &FnPtr, args: impl FuncArgs) -> RhaiResult<Dynamic> {
        match self {
            Caller::Host { engine, ast } => hook.call::<Dynamic>(engine, ast, args),
            Caller::Native(context) => hook.call_within_context::<Dynamic>(context, args),
        }
    }
}

/// Invoke an entity hook with the entity's writing window open
pub fn call_entity_hook(
    caller: &Caller<'_>,
    world: &SharedWorld,
    id: EntityId,
    hook: &FnPtr,
    args: impl FuncArgs,
) -> RhaiResult<Dynamic> {
    world.lock().writers.push(id);
    let result = caller.call(hook, args);
    world.lock().writers.pop();
    result
}

/// Run a hook and log instead of propagating its error
pub fn contain(hook: &str, room_id: &str, result: RhaiResult<Dynamic>) -> Option<Dynamic> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(room_id = %room_id, hook, error = %e, "Script hook failed");
            None
        }
    }
}

/// Loose truthiness used for callbacks that answer "keep going?"
pub fn is_falsy(value: &Dynamic) -> bool {
    if value.is_unit() {
        return true;
    }
    if let Ok(b) = value.as_bool() {
        return !b;
    }
    if let Ok(i) = value.as_int() {
        return i == 0;
    }
    if let Ok(f) = value.as_float() {
        return f == 0.0;
    }
    if let Ok(s) = value.clone().into_immutable_string() {
        return s.is_empty();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsy_values() {
        assert!(is_falsy(&Dynamic::UNIT));
        assert!(is_falsy(&Dynamic::FALSE));
        assert!(is_falsy(&Dynamic::from(0_i64)));
        assert!(is_falsy(&Dynamic::from("")));
        assert!(!is_falsy(&Dynamic::TRUE));
        assert!(!is_falsy(&Dynamic::from(2.5_f64)));
        assert!(!is_falsy(&Dynamic::from(rhai::Map::new())));
    }
}
