//! Room rows in Supabase
//!
//! Table `rooms`: `id text primary key`, `state text`, `logic text`,
//! `updated_at timestamptz`.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use super::supabase::SupabaseClient;
use super::{RoomStore, StoreError};

const TABLE: &str = "rooms";

#[derive(Debug, Deserialize)]
struct StateRow {
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogicRow {
    logic: Option<String>,
}

/// Partial row; absent columns are left untouched by the upsert
#[derive(Debug, Serialize)]
struct RoomUpsert<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logic: Option<&'a str>,
    updated_at: DateTime<Utc>,
}

/// Room persistence backed by Supabase
#[derive(Clone)]
pub struct SupabaseStore {
    client: SupabaseClient,
}

impl SupabaseStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    async fn get_state(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let query = format!("id=eq.{}&select=state", room_id);
        let row: Option<StateRow> = self.client.get_one(TABLE, &query).await?;
        Ok(row.and_then(|row| row.state))
    }

    async fn get_logic(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let query = format!("id=eq.{}&select=logic", room_id);
        let row: Option<LogicRow> = self.client.get_one(TABLE, &query).await?;
        Ok(row.and_then(|row| row.logic))
    }

    async fn put(&self, row: RoomUpsert<'_>) -> Result<(), StoreError> {
        self.client.upsert(TABLE, &row, "id").await?;
        Ok(())
    }
}

impl RoomStore for SupabaseStore {
    fn load<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        self.get_state(room_id).boxed()
    }

    fn save<'a>(&'a self, room_id: &'a str, blob: String) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.put(RoomUpsert {
                id: room_id,
                state: Some(&blob),
                logic: None,
                updated_at: Utc::now(),
            })
            .await
        }
        .boxed()
    }

    fn load_logic<'a>(
        &'a self,
        room_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        self.get_logic(room_id).boxed()
    }

    fn save_logic<'a>(
        &'a self,
        room_id: &'a str,
        source: String,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.put(RoomUpsert {
                id: room_id,
                state: None,
                logic: Some(&source),
                updated_at: Utc::now(),
            })
            .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_rows_only_carry_present_columns() {
        let row = RoomUpsert {
            id: "lobby",
            state: Some("{}"),
            logic: None,
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["id"], "lobby");
        assert_eq!(value["state"], "{}");
        assert!(value.get("logic").is_none());
        assert!(value["updated_at"].is_string());
    }
}
