//! Room simulation modules

pub mod entity;
pub mod physics;
pub mod scheduler;
pub mod signal;
pub mod snapshot;
pub mod spatial;
pub mod state;
pub mod world;

pub use state::{EntityId, RoomState};
pub use world::{SharedWorld, World};

/// Errors raised by the engine itself rather than by game logic
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown blueprint: {0}")]
    UnknownBlueprint(String),

    /// Internal invariant violated; the room cannot keep running
    #[error("Engine invariant violated: {0}")]
    Fatal(String),
}
