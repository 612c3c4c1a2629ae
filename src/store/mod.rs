//! Room persistence
//!
//! A room is persisted as two blobs: its serialized state and the source of
//! its logic. Stores are shared by every room task, so the trait hands out
//! boxed futures that are `Send`.

pub mod memory;
pub mod rooms;
pub mod supabase;

pub use memory::MemoryStore;
pub use rooms::SupabaseStore;
pub use supabase::{SupabaseClient, SupabaseError};

use futures::future::BoxFuture;

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Supabase error: {0}")]
    Supabase(#[from] SupabaseError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub trait RoomStore: Send + Sync {
    /// Serialized state of a room, `None` if it was never saved
    fn load<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    fn save<'a>(&'a self, room_id: &'a str, blob: String) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Published logic source of a room
    fn load_logic<'a>(
        &'a self,
        room_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    fn save_logic<'a>(
        &'a self,
        room_id: &'a str,
        source: String,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}
