//! Authoritative in-memory session state, owned by the session runtime

use uuid::Uuid;

use crate::store::characters::CharacterRow;
use crate::store::sessions::{ParticipantRow, SessionRow};
use crate::ws::protocol::{Facing, ParticipantPublic, SessionPublic, SessionStatus, Visibility};

/// Combat-relevant stats, fixed at join time from the source character
#[derive(Debug, Clone, Copy)]
pub struct StatBlock {
    /// Perception-derived; decides initiative
    pub sequence: i32,
    /// Secondary initiative tiebreak
    pub luck: i32,
    pub agility: i32,
    pub strength: i32,
}

impl StatBlock {
    pub fn from_character(character: &CharacterRow) -> Self {
        Self {
            sequence: character.sequence(),
            luck: character.luck,
            agility: character.agility,
            strength: character.strength,
        }
    }

    /// Stats for participants without a character (bots, spectating hosts)
    pub fn baseline() -> Self {
        Self {
            sequence: 10,
            luck: 5,
            agility: 6,
            strength: 5,
        }
    }
}

/// One joined identity within a session
#[derive(Debug, Clone)]
pub struct Participant {
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
    /// Fixed at combat start from the sequence stat
    pub initiative: i32,

    pub stats: StatBlock,
}

impl Participant {
    pub fn alive(&self) -> bool {
        !self.dead
    }

    pub fn hp_fraction(&self) -> f64 {
        if self.max_hp <= 0 {
            return 0.0;
        }
        (self.hp.max(0) as f64) / (self.max_hp as f64)
    }

    /// Public fields as broadcast to viewers
    pub fn public(&self) -> ParticipantPublic {
        ParticipantPublic {
            id: self.id,
            user_id: self.user_id,
            username: self.username.clone(),
            character_id: self.character_id,
            is_host: self.is_host,
            is_bot: self.is_bot,
            ready: self.ready,
            connected: self.connected,
            x: self.x,
            y: self.y,
            elevation: self.elevation,
            facing: self.facing,
            hp: self.hp,
            max_hp: self.max_hp,
            ap: self.ap,
            max_ap: self.max_ap,
            in_combat: self.in_combat,
            dead: self.dead,
            initiative: self.initiative,
        }
    }

    pub fn to_row(&self, session_id: Uuid) -> ParticipantRow {
        ParticipantRow {
            id: self.id,
            session_id,
            user_id: self.user_id,
            username: self.username.clone(),
            character_id: self.character_id,
            is_host: self.is_host,
            is_bot: self.is_bot,
            ready: self.ready,
            connected: self.connected,
            x: self.x,
            y: self.y,
            elevation: self.elevation,
            facing: self.facing,
            hp: self.hp,
            max_hp: self.max_hp,
            ap: self.ap,
            max_ap: self.max_ap,
            in_combat: self.in_combat,
            dead: self.dead,
            initiative: self.initiative,
            joined_at: chrono::Utc::now(),
        }
    }

    pub fn from_row(row: &ParticipantRow, character: Option<&CharacterRow>) -> Self {
        let stats = character
            .map(StatBlock::from_character)
            .unwrap_or_else(StatBlock::baseline);
        Self {
            id: row.id,
            user_id: row.user_id,
            username: row.username.clone(),
            character_id: row.character_id,
            is_host: row.is_host,
            is_bot: row.is_bot,
            ready: row.ready,
            connected: row.connected,
            x: row.x,
            y: row.y,
            elevation: row.elevation,
            facing: row.facing,
            hp: row.hp,
            max_hp: row.max_hp,
            ap: row.ap,
            max_ap: row.max_ap,
            in_combat: row.in_combat,
            dead: row.dead,
            initiative: row.initiative,
            stats,
        }
    }
}

/// Authoritative session state. `participants` stays in join order; that
/// order is the final initiative tiebreak, so it must never be reshuffled.
#[derive(Debug, Clone)]
pub struct SessionState {
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
    pub host_user_id: Uuid,
    pub participants: Vec<Participant>,
}

impl SessionState {
    pub fn from_rows(session: &SessionRow, participants: Vec<Participant>) -> Self {
        Self {
            id: session.id,
            name: session.name.clone(),
            visibility: session.visibility,
            password: session.password.clone(),
            capacity: session.capacity,
            min_level: session.min_level,
            max_level: session.max_level,
            map_id: session.map_id.clone(),
            turn_seconds: session.turn_seconds,
            status: session.status,
            in_combat: session.in_combat,
            round: session.round,
            host_user_id: session.host_user_id,
            participants,
        }
    }

    pub fn participant(&self, id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: Uuid) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn participant_by_user(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_by_user_mut(&mut self, user_id: Uuid) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn living_humans(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.alive() && !p.is_bot)
            .count()
    }

    pub fn living_bots(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.alive() && p.is_bot)
            .count()
    }

    pub fn public(&self) -> SessionPublic {
        SessionPublic {
            id: self.id,
            name: self.name.clone(),
            visibility: self.visibility,
            capacity: self.capacity,
            min_level: self.min_level,
            max_level: self.max_level,
            map_id: self.map_id.clone(),
            turn_seconds: self.turn_seconds,
            status: self.status,
            in_combat: self.in_combat,
            round: self.round,
            host_user_id: self.host_user_id,
        }
    }
}
