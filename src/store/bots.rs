//! Bot operator records - persisted status for visibility and crash recovery

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::{PgRestClient, StoreError};

/// Bot archetype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    Host,
    Player,
}

/// Bot lifecycle status as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Idle,
    Running,
    Stopping,
}

/// Bot row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRow {
    pub id: Uuid,
    pub kind: BotKind,
    pub status: BotStatus,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct BotUpsert {
    id: Uuid,
    kind: BotKind,
    status: BotStatus,
}

#[derive(Debug, Clone, Serialize)]
struct BotStatusUpdate {
    status: BotStatus,
}

/// Bot store operations
#[derive(Clone)]
pub struct BotStore {
    client: PgRestClient,
}

impl BotStore {
    pub fn new(client: PgRestClient) -> Self {
        Self { client }
    }

    pub async fn list_bots(&self) -> Result<Vec<BotRow>, StoreError> {
        self.client.get("bots", "order=updated_at.asc").await
    }

    pub async fn create_bot(&self, id: Uuid, kind: BotKind) -> Result<BotRow, StoreError> {
        self.client
            .insert(
                "bots",
                &BotUpsert {
                    id,
                    kind,
                    status: BotStatus::Idle,
                },
            )
            .await
    }

    pub async fn set_status(&self, id: Uuid, status: BotStatus) -> Result<(), StoreError> {
        let query = format!("id=eq.{}", id);
        self.client
            .update("bots", &query, &BotStatusUpdate { status })
            .await
    }

    /// Crash recovery: never trust in-memory bot state across a restart.
    /// Any record left non-idle belongs to a dead process.
    pub async fn reset_active_bots(&self) -> Result<(), StoreError> {
        self.client
            .update(
                "bots",
                "status=neq.idle",
                &BotStatusUpdate {
                    status: BotStatus::Idle,
                },
            )
            .await
    }
}
