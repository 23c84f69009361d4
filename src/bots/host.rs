//! Host bot: keeps public lobbies available, starts them when humans are
//! ready, abandons them when nobody shows up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::session::{CreateSessionParams, SessionError, SessionService};
use crate::ws::protocol::{SessionStatus, Visibility};

/// Humans required before the host bot starts its lobby
const MIN_HUMANS_TO_START: usize = 1;

const LOBBY_MAPS: &[&str] = &["quarry", "rooftops", "depot", "undercroft"];

pub struct HostBot {
    user_id: Uuid,
    username: String,
    service: Arc<SessionService>,
    config: Arc<Config>,
    lobby: Option<Uuid>,
    lobby_opened_at: Option<Instant>,
    rng: ChaCha8Rng,
}

impl HostBot {
    pub fn new(
        user_id: Uuid,
        username: String,
        service: Arc<SessionService>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            user_id,
            username,
            service,
            config,
            lobby: None,
            lobby_opened_at: None,
            rng: ChaCha8Rng::seed_from_u64(rand::random()),
        }
    }

    pub async fn run(mut self) {
        info!(bot = %self.username, "Host bot started");
        let mut ticker = interval(Duration::from_millis(self.config.bot_poll_millis));
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll().await {
                debug!(bot = %self.username, error = %e, "Host bot poll skipped");
            }
        }
    }

    async fn poll(&mut self) -> Result<(), SessionError> {
        match self.lobby {
            None => self.maybe_open_lobby().await,
            Some(session_id) => self.tend_lobby(session_id).await,
        }
    }

    async fn maybe_open_lobby(&mut self) -> Result<(), SessionError> {
        let lobbies = self.service.list_public_lobbies().await?;
        if lobbies.len() >= self.config.bot_min_public_lobbies {
            return Ok(());
        }

        let map = LOBBY_MAPS[self.rng.gen_range(0..LOBBY_MAPS.len())];
        let params = CreateSessionParams {
            name: format!("{}'s skirmish", self.username),
            visibility: Visibility::Public,
            password: None,
            capacity: 8,
            min_level: 1,
            max_level: 99,
            map_id: map.to_string(),
            turn_seconds: None,
            character_id: None,
        };

        let session = self
            .service
            .create_session(self.user_id, self.username.clone(), true, params)
            .await?;
        info!(bot = %self.username, session_id = %session.id, "Host bot opened a lobby");
        self.lobby = Some(session.id);
        self.lobby_opened_at = Some(Instant::now());
        Ok(())
    }

    async fn tend_lobby(&mut self, session_id: Uuid) -> Result<(), SessionError> {
        let snapshot = match self.service.snapshot(session_id).await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                // The session is gone; open another one next poll
                self.lobby = None;
                self.lobby_opened_at = None;
                return Ok(());
            }
        };

        if snapshot.session.status != SessionStatus::Lobby {
            self.lobby = None;
            self.lobby_opened_at = None;
            return Ok(());
        }

        let humans = snapshot
            .participants
            .iter()
            .filter(|p| !p.is_bot)
            .count();
        let all_ready = snapshot.participants.iter().all(|p| p.ready);

        if humans >= MIN_HUMANS_TO_START && all_ready {
            self.service.start(session_id, self.user_id).await?;
            info!(bot = %self.username, session_id = %session_id, "Host bot started its lobby");
            self.lobby = None;
            self.lobby_opened_at = None;
            return Ok(());
        }

        let waited_out = self
            .lobby_opened_at
            .map(|t| t.elapsed() > Duration::from_secs(self.config.bot_lobby_wait_secs))
            .unwrap_or(false);
        if humans == 0 && waited_out {
            // Nobody came; leaving as host winds the lobby down
            self.service.leave(self.user_id).await?;
            info!(bot = %self.username, session_id = %session_id, "Host bot abandoned an idle lobby");
            self.lobby = None;
            self.lobby_opened_at = None;
        }

        Ok(())
    }
}
