//! Resident rooms: lifecycle, tick loop and the manager routing work to them

pub mod manager;
pub mod room;

pub use manager::RoomManager;

use crate::store::StoreError;

/// Room manager errors
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Room ids are 1-64 characters of `[A-Za-z0-9_-]`
pub fn validate_room_id(room_id: &str) -> Result<(), RoomError> {
    let valid = !room_id.is_empty()
        && room_id.len() <= 64
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RoomError::InvalidRoomId(room_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_ids() {
        assert!(validate_room_id("lobby-1_b").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("../etc").is_err());
        assert!(validate_room_id(&"a".repeat(65)).is_err());
    }
}
