//! Session and participant rows

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ws::protocol::{Facing, SessionStatus, Visibility};

use super::client::{PgRestClient, StoreError};

/// Durable session row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: Uuid,
    pub name: String,
    pub visibility: Visibility,
    pub password: Option<String>,
    pub capacity: u32,
    pub min_level: u32,
    pub max_level: u32,
    pub map_id: String,
    pub turn_seconds: u32,
    pub status: SessionStatus,
    pub in_combat: bool,
    pub round: u32,
    /// Advisory copy of the turn pointer; the cache is authoritative
    pub turn_index: u32,
    pub host_user_id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// New session for insertion
#[derive(Debug, Clone, Serialize)]
pub struct NewSession {
    pub id: Uuid,
    pub name: String,
    pub visibility: Visibility,
    pub password: Option<String>,
    pub capacity: u32,
    pub min_level: u32,
    pub max_level: u32,
    pub map_id: String,
    pub turn_seconds: u32,
    pub status: SessionStatus,
    pub host_user_id: Uuid,
}

/// Partial session update
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_combat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_user_id: Option<Uuid>,
}

/// Durable participant row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub character_id: Option<Uuid>,
    pub is_host: bool,
    pub is_bot: bool,
    pub ready: bool,
    pub connected: bool,
    pub x: i32,
    pub y: i32,
    pub elevation: i32,
    pub facing: Facing,
    pub hp: i32,
    pub max_hp: i32,
    pub ap: i32,
    pub max_ap: i32,
    pub in_combat: bool,
    pub dead: bool,
    pub initiative: i32,
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

/// Partial participant update
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParticipantUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facing: Option<Facing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ap: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_combat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiative: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_host: Option<bool>,
}

#[derive(Serialize)]
struct HostTransferArgs {
    p_session_id: Uuid,
    p_from_user: Uuid,
    p_to_user: Uuid,
}

/// Session store operations
#[derive(Clone)]
pub struct SessionStore {
    client: PgRestClient,
}

impl SessionStore {
    pub fn new(client: PgRestClient) -> Self {
        Self { client }
    }

    pub async fn create_session(&self, session: &NewSession) -> Result<SessionRow, StoreError> {
        self.client.insert("sessions", session).await
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<SessionRow>, StoreError> {
        let query = format!("id=eq.{}", id);
        self.client.get_one("sessions", &query).await
    }

    /// Query shape: by status + visibility (lobby browsing, host bot top-up)
    pub async fn list_sessions(
        &self,
        status: SessionStatus,
        visibility: Visibility,
    ) -> Result<Vec<SessionRow>, StoreError> {
        let status = match status {
            SessionStatus::Lobby => "lobby",
            SessionStatus::Playing => "playing",
            SessionStatus::Finished => "finished",
        };
        let visibility = match visibility {
            Visibility::Public => "public",
            Visibility::Private => "private",
        };
        let query = format!(
            "status=eq.{}&visibility=eq.{}&order=created_at.asc",
            status, visibility
        );
        self.client.get("sessions", &query).await
    }

    pub async fn update_session(&self, id: Uuid, update: &SessionUpdate) -> Result<(), StoreError> {
        let query = format!("id=eq.{}", id);
        self.client.update("sessions", &query, update).await
    }

    pub async fn insert_participant(
        &self,
        participant: &ParticipantRow,
    ) -> Result<ParticipantRow, StoreError> {
        self.client.insert("participants", participant).await
    }

    /// Query shape: by session + identity pair
    pub async fn get_participant(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ParticipantRow>, StoreError> {
        let query = format!("session_id=eq.{}&user_id=eq.{}", session_id, user_id);
        self.client.get_one("participants", &query).await
    }

    pub async fn list_participants(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ParticipantRow>, StoreError> {
        let query = format!("session_id=eq.{}&order=joined_at.asc", session_id);
        self.client.get("participants", &query).await
    }

    pub async fn update_participant(
        &self,
        id: Uuid,
        update: &ParticipantUpdate,
    ) -> Result<(), StoreError> {
        let query = format!("id=eq.{}", id);
        self.client.update("participants", &query, update).await
    }

    pub async fn delete_participant(&self, id: Uuid) -> Result<(), StoreError> {
        let query = format!("id=eq.{}", id);
        self.client.delete("participants", &query).await
    }

    /// Atomic host transfer: clears the old host flag, sets the new one,
    /// and repoints the session row in a single transaction server-side.
    pub async fn transfer_host(
        &self,
        session_id: Uuid,
        from_user: Uuid,
        to_user: Uuid,
    ) -> Result<(), StoreError> {
        self.client
            .rpc(
                "transfer_session_host",
                &HostTransferArgs {
                    p_session_id: session_id,
                    p_from_user: from_user,
                    p_to_user: to_user,
                },
            )
            .await
    }

    /// Startup safety net: connection maps are in-process only, so any
    /// `connected` flag left over from a previous process is a lie.
    pub async fn reset_connected_flags(&self) -> Result<(), StoreError> {
        let update = ParticipantUpdate {
            connected: Some(false),
            ..Default::default()
        };
        self.client
            .update("participants", "connected=eq.true", &update)
            .await
    }
}
