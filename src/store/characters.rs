//! Character rows - the stat source for participants

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::{PgRestClient, StoreError};

/// Character row; stats feed initiative, HP and AP at join/combat start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub level: u32,
    pub perception: i32,
    pub luck: i32,
    pub agility: i32,
    pub endurance: i32,
    pub strength: i32,
}

impl CharacterRow {
    /// Perception-derived sequence stat; fixed at combat start
    pub fn sequence(&self) -> i32 {
        self.perception * 2
    }

    pub fn max_hp(&self) -> i32 {
        15 + self.endurance * 3 + self.level as i32 * 2
    }

    pub fn max_ap(&self) -> i32 {
        5 + self.agility / 2
    }
}

/// Character store operations
#[derive(Clone)]
pub struct CharacterStore {
    client: PgRestClient,
}

impl CharacterStore {
    pub fn new(client: PgRestClient) -> Self {
        Self { client }
    }

    pub async fn get_character(&self, id: Uuid) -> Result<Option<CharacterRow>, StoreError> {
        let query = format!("id=eq.{}", id);
        self.client.get_one("characters", &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(perception: i32, luck: i32) -> CharacterRow {
        CharacterRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "test".into(),
            level: 3,
            perception,
            luck,
            agility: 6,
            endurance: 5,
            strength: 5,
        }
    }

    #[test]
    fn sequence_follows_perception() {
        assert!(character(8, 1).sequence() > character(5, 9).sequence());
    }
}
