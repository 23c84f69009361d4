//! Shared test fixtures

use uuid::Uuid;

use crate::session::state::{Participant, SessionState, StatBlock};
use crate::ws::protocol::{Facing, SessionStatus, Visibility};

pub fn session_state(visibility: Visibility, capacity: u32) -> SessionState {
    SessionState {
        id: Uuid::new_v4(),
        name: "test-session".into(),
        visibility,
        password: None,
        capacity,
        min_level: 1,
        max_level: 99,
        map_id: "quarry".into(),
        turn_seconds: 30,
        status: SessionStatus::Lobby,
        in_combat: false,
        round: 0,
        host_user_id: Uuid::new_v4(),
        participants: Vec::new(),
    }
}

pub fn participant(name: &str, is_bot: bool) -> Participant {
    participant_with_stats(name, is_bot, 10, 5)
}

pub fn participant_with_stats(name: &str, is_bot: bool, sequence: i32, luck: i32) -> Participant {
    Participant {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        username: name.to_string(),
        character_id: None,
        is_host: false,
        is_bot,
        ready: true,
        connected: true,
        x: 0,
        y: 0,
        elevation: 0,
        facing: Facing::South,
        hp: 30,
        max_hp: 30,
        ap: 8,
        max_ap: 8,
        in_combat: false,
        dead: false,
        initiative: 0,
        stats: StatBlock {
            sequence,
            luck,
            agility: 6,
            strength: 5,
        },
    }
}
