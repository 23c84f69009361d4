//! Application state shared across routes

use std::sync::Arc;

use crate::bots::BotManager;
use crate::cache::{MemoryCache, SessionCache};
use crate::config::Config;
use crate::session::SessionService;
use crate::store::{AccountStore, BotStore, CharacterStore, PgRestClient, SessionStore};
use crate::ws::ConnectionRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub session_store: SessionStore,
    pub connections: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionService>,
    pub bots: Arc<BotManager>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // Store clients over the shared REST client
        let client = PgRestClient::new(&config);
        let session_store = SessionStore::new(client.clone());
        let character_store = CharacterStore::new(client.clone());
        let account_store = AccountStore::new(client.clone());
        let bot_store = BotStore::new(client);

        // Fast cache and the in-process connection maps
        let cache = SessionCache::new(Arc::new(MemoryCache::new()));
        let connections = Arc::new(ConnectionRegistry::new());

        let sessions = Arc::new(SessionService::new(
            config.clone(),
            session_store.clone(),
            character_store,
            account_store,
            cache.clone(),
            connections.clone(),
        ));

        let bots = Arc::new(BotManager::new(
            bot_store,
            sessions.clone(),
            cache,
            config.clone(),
        ));

        Self {
            config,
            session_store,
            connections,
            sessions,
            bots,
        }
    }
}
