//! Bot manager: supervises bot instances and keeps their persisted
//! status honest across restarts.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::SessionCache;
use crate::config::Config;
use crate::session::SessionService;
use crate::store::bots::{BotKind, BotStatus};
use crate::store::{BotStore, StoreError};

use super::host::HostBot;
use super::player::PlayerBot;

struct BotHandle {
    kind: BotKind,
    task: JoinHandle<()>,
}

pub struct BotManager {
    store: BotStore,
    service: Arc<SessionService>,
    cache: SessionCache,
    config: Arc<Config>,
    bots: DashMap<Uuid, BotHandle>,
}

impl BotManager {
    pub fn new(
        store: BotStore,
        service: Arc<SessionService>,
        cache: SessionCache,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            service,
            cache,
            config,
            bots: DashMap::new(),
        }
    }

    /// Crash recovery, run once at process startup: any bot record left
    /// in a non-idle status belongs to a previous process.
    pub async fn recover(&self) {
        if let Err(e) = self.store.reset_active_bots().await {
            warn!(error = %e, "Bot status recovery failed");
        }
    }

    pub fn running(&self) -> usize {
        self.bots.len()
    }

    pub fn list(&self) -> Vec<(Uuid, BotKind)> {
        self.bots
            .iter()
            .map(|entry| (*entry.key(), entry.value().kind))
            .collect()
    }

    /// Spawn one bot of the given kind under a fresh identity
    pub async fn start_bot(&self, kind: BotKind) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let username = format!("Bot_{}", &id.to_string()[..8]);

        self.store.create_bot(id, kind).await?;
        self.store.set_status(id, BotStatus::Running).await?;

        let task = match kind {
            BotKind::Host => tokio::spawn(
                HostBot::new(
                    id,
                    username.clone(),
                    self.service.clone(),
                    self.config.clone(),
                )
                .run(),
            ),
            BotKind::Player => tokio::spawn(
                PlayerBot::new(
                    id,
                    username.clone(),
                    self.service.clone(),
                    self.cache.clone(),
                    self.config.clone(),
                    0.7,
                    0.8,
                )
                .run(),
            ),
        };

        self.bots.insert(id, BotHandle { kind, task });
        info!(bot_id = %id, ?kind, "Bot started");
        Ok(id)
    }

    /// Stop one bot; returns false if it was not running
    pub async fn stop_bot(&self, id: Uuid) -> Result<bool, StoreError> {
        let Some((_, handle)) = self.bots.remove(&id) else {
            return Ok(false);
        };

        self.store.set_status(id, BotStatus::Stopping).await?;
        handle.task.abort();

        // The bot may still hold a seat somewhere; give it back
        let _ = self.service.leave(id).await;

        self.store.set_status(id, BotStatus::Idle).await?;
        info!(bot_id = %id, "Bot stopped");
        Ok(true)
    }

    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.bots.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Err(e) = self.stop_bot(id).await {
                warn!(bot_id = %id, error = %e, "Bot stop failed");
            }
        }
    }
}
