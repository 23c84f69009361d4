//! Account win/play counters

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::{PgRestClient, StoreError};

/// Account row (identity lives elsewhere; this is gameplay bookkeeping)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRow {
    pub id: Uuid,
    pub username: String,
    pub games_played: u32,
    pub games_won: u32,
}

#[derive(Serialize)]
struct BumpStatsArgs {
    p_user_id: Uuid,
    p_won: bool,
}

/// Account store operations
#[derive(Clone)]
pub struct AccountStore {
    client: PgRestClient,
}

impl AccountStore {
    pub fn new(client: PgRestClient) -> Self {
        Self { client }
    }

    pub async fn get_account(&self, id: Uuid) -> Result<Option<AccountRow>, StoreError> {
        let query = format!("id=eq.{}", id);
        self.client.get_one("accounts", &query).await
    }

    /// Increment games_played (and games_won when `won`) atomically
    pub async fn bump_stats(&self, user_id: Uuid, won: bool) -> Result<(), StoreError> {
        self.client
            .rpc(
                "bump_account_stats",
                &BumpStatsArgs {
                    p_user_id: user_id,
                    p_won: won,
                },
            )
            .await
    }
}
