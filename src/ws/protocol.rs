//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::ChangeRecord;

/// Session visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Lobby,
    Playing,
    Finished,
}

/// Tile-grid facing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    North,
    East,
    South,
    West,
}

impl Default for Facing {
    fn default() -> Self {
        Self::South
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    /// First message on every connection; carries the identity token
    #[serde(rename = "auth")]
    Auth { token: String },

    /// Join a session as a participant
    #[serde(rename = "session:join")]
    SessionJoin {
        session_id: Uuid,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        character_id: Option<Uuid>,
    },

    /// Leave the current session
    #[serde(rename = "session:leave")]
    SessionLeave,

    /// Toggle readiness in the lobby
    #[serde(rename = "session:ready")]
    SessionReady { ready: bool },

    /// Move to a tile (costs AP per tile stepped)
    #[serde(rename = "action:move")]
    ActionMove {
        x: i32,
        y: i32,
        #[serde(default)]
        facing: Facing,
    },

    /// Attack another participant
    #[serde(rename = "action:attack")]
    ActionAttack { target_id: Uuid },

    /// Use an item, optionally on another participant
    #[serde(rename = "action:use-item")]
    ActionUseItem {
        item_id: String,
        #[serde(default)]
        target_id: Option<Uuid>,
    },

    /// Interact with a map object
    #[serde(rename = "action:interact")]
    ActionInteract { object_id: String },

    /// End the current turn (only valid for the turn holder)
    #[serde(rename = "turn:end")]
    TurnEnd,

    /// Relay a chat line to the session
    #[serde(rename = "chat:message")]
    ChatSend { text: String },

    /// Request a re-sync: full snapshot, or a delta since a timestamp
    #[serde(rename = "sync:request")]
    SyncRequest {
        #[serde(default)]
        since: Option<u64>,
    },

    /// Ping for latency measurement
    #[serde(rename = "ping")]
    Ping { t: u64 },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    #[serde(rename = "auth:success")]
    AuthSuccess { user_id: Uuid, username: String },

    #[serde(rename = "auth:error")]
    AuthError { message: String },

    /// Sent to the old socket when the same identity logs in again
    #[serde(rename = "connection:superseded")]
    Superseded,

    /// Confirmation of session join, carrying the baseline snapshot
    #[serde(rename = "session:joined")]
    SessionJoined { state: FullState },

    #[serde(rename = "player:connected")]
    PlayerConnected { participant: ParticipantPublic },

    #[serde(rename = "player:disconnected")]
    PlayerDisconnected { participant_id: Uuid },

    #[serde(rename = "player:ready-changed")]
    PlayerReadyChanged { participant_id: Uuid, ready: bool },

    /// Participant left or was kicked from the session
    #[serde(rename = "player:left")]
    PlayerLeft { participant_id: Uuid, kicked: bool },

    #[serde(rename = "session:host-changed")]
    HostChanged { participant_id: Uuid },

    #[serde(rename = "turn:start")]
    TurnStart {
        participant_id: Uuid,
        round: u32,
        ap: i32,
        /// Absolute deadline, Unix milliseconds
        deadline: u64,
    },

    #[serde(rename = "turn:end")]
    TurnEnded {
        participant_id: Uuid,
        /// True when the turn was ended by timer expiry
        timeout: bool,
    },

    #[serde(rename = "combat:started")]
    CombatStarted { order: Vec<Uuid>, round: u32 },

    #[serde(rename = "combat:new-round")]
    NewRound { round: u32 },

    #[serde(rename = "combat:ended")]
    CombatEnded { winner_participant_id: Option<Uuid> },

    #[serde(rename = "game:ended")]
    GameEnded { session_id: Uuid },

    #[serde(rename = "sync:full-state")]
    SyncFullState { state: FullState },

    #[serde(rename = "sync:delta")]
    SyncDelta {
        changes: Vec<ChangeRecord>,
        /// True when the retained change window does not reach back to
        /// the requested timestamp; the client must take a full snapshot.
        truncated: bool,
    },

    #[serde(rename = "chat:message")]
    ChatMessage {
        participant_id: Uuid,
        username: String,
        text: String,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "pong")]
    Pong { t: u64 },
}

/// Public participant fields as seen by every viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPublic {
    pub id: Uuid,
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
}

/// Public session fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPublic {
    pub id: Uuid,
    pub name: String,
    pub visibility: Visibility,
    pub capacity: u32,
    pub min_level: u32,
    pub max_level: u32,
    pub map_id: String,
    pub turn_seconds: u32,
    pub status: SessionStatus,
    pub in_combat: bool,
    pub round: u32,
    pub host_user_id: Uuid,
}

/// Current turn pointer as seen by viewers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnView {
    pub order: Vec<Uuid>,
    pub current_participant_id: Uuid,
    pub round: u32,
    /// Milliseconds left on the current turn clock
    pub remaining_millis: u64,
}

/// Full-state snapshot: the baseline a viewer uses after joining or
/// reconnecting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullState {
    pub session: SessionPublic,
    pub participants: Vec<ParticipantPublic>,
    pub turn: Option<TurnView>,
    /// Server timestamp the snapshot was assembled at, Unix milliseconds
    pub taken_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_msg_wire_names_round_trip() {
        let json = r#"{"type":"session:join","session_id":"6f6b3a68-34a4-4b2f-9d0c-0d9adbd1a001"}"#;
        let msg: ClientMsg = serde_json::from_str(json).unwrap();
        match msg {
            ClientMsg::SessionJoin {
                password,
                character_id,
                ..
            } => {
                assert!(password.is_none());
                assert!(character_id.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let end = serde_json::to_string(&ClientMsg::TurnEnd).unwrap();
        assert_eq!(end, r#"{"type":"turn:end"}"#);
    }

    #[test]
    fn server_msg_carries_type_tag() {
        let msg = ServerMsg::NewRound { round: 3 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"combat:new-round""#));
        assert!(json.contains(r#""round":3"#));
    }
}
