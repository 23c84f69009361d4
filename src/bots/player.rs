//! Player bot: finds a public lobby, readies up, and plays its turns
//! through the same session service entry points a socket client uses.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::SessionCache;
use crate::config::Config;
use crate::session::{SessionError, SessionService};
use crate::ws::protocol::{Facing, SessionStatus};

use super::policy::{BotAction, CombatPolicy, ExplorationPolicy, PolicyView, TurnPolicy};

/// How many lobbies one poll tick will attempt before giving up
const JOIN_ATTEMPTS_PER_POLL: usize = 3;

pub struct PlayerBot {
    user_id: Uuid,
    username: String,
    service: Arc<SessionService>,
    cache: SessionCache,
    config: Arc<Config>,
    combat: CombatPolicy,
    explore: ExplorationPolicy,
    rng: ChaCha8Rng,
}

impl PlayerBot {
    pub fn new(
        user_id: Uuid,
        username: String,
        service: Arc<SessionService>,
        cache: SessionCache,
        config: Arc<Config>,
        aggressiveness: f64,
        skill: f64,
    ) -> Self {
        Self {
            user_id,
            username,
            service,
            cache,
            config,
            combat: CombatPolicy::new(aggressiveness, skill),
            explore: ExplorationPolicy::new(),
            rng: ChaCha8Rng::seed_from_u64(rand::random()),
        }
    }

    /// Polling loop, deliberately coarser than human reaction time. Any
    /// rejection means skip this attempt and try again next poll - the
    /// loop itself never dies.
    pub async fn run(mut self) {
        info!(bot = %self.username, "Player bot started");
        let mut ticker = interval(Duration::from_millis(self.config.bot_poll_millis));
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll().await {
                debug!(bot = %self.username, error = %e, "Player bot poll skipped");
            }
        }
    }

    async fn poll(&mut self) -> Result<(), SessionError> {
        match self.service.session_of(self.user_id) {
            None => self.find_and_join().await,
            Some(session_id) => self.play(session_id).await,
        }
    }

    async fn find_and_join(&mut self) -> Result<(), SessionError> {
        let lobbies = self.service.list_public_lobbies().await?;
        for lobby in lobbies.into_iter().take(JOIN_ATTEMPTS_PER_POLL) {
            match self
                .service
                .join(lobby.id, self.user_id, self.username.clone(), None, None, true)
                .await
            {
                Ok(_) => {
                    info!(bot = %self.username, session_id = %lobby.id, "Player bot joined lobby");
                    self.service.set_ready(self.user_id, true).await?;
                    return Ok(());
                }
                Err(e) => {
                    debug!(bot = %self.username, session_id = %lobby.id, error = %e, "Lobby join attempt failed");
                }
            }
        }
        Ok(())
    }

    async fn play(&mut self, session_id: Uuid) -> Result<(), SessionError> {
        let snapshot = self.service.snapshot(session_id).await?;
        let me = match snapshot
            .participants
            .iter()
            .find(|p| p.user_id == self.user_id)
        {
            Some(me) => me.clone(),
            None => return Ok(()),
        };

        match snapshot.session.status {
            SessionStatus::Lobby => {
                if !me.ready {
                    self.service.set_ready(self.user_id, true).await?;
                }
                Ok(())
            }
            SessionStatus::Finished => Ok(()),
            SessionStatus::Playing => {
                if me.dead {
                    return Ok(());
                }

                if snapshot.session.in_combat {
                    // The cache-resident turn record is the only truth
                    // for "whose turn is it" - same read a client does.
                    let holder = self
                        .cache
                        .turn_record(session_id)
                        .and_then(|t| t.order.get(t.index).copied());
                    if holder != Some(me.id) {
                        return Ok(());
                    }
                    let view = PolicyView::new(&snapshot, &me);
                    let action = self.combat.decide(&view, &mut self.rng);
                    self.submit(action).await
                } else {
                    let view = PolicyView::new(&snapshot, &me);
                    let action = self.explore.decide(&view, &mut self.rng);
                    self.submit(action).await
                }
            }
        }
    }

    async fn submit(&self, action: BotAction) -> Result<(), SessionError> {
        match action {
            BotAction::Move { x, y } => {
                self.service
                    .move_to(self.user_id, x, y, Facing::default())
                    .await
            }
            BotAction::Attack { target_id } => self.service.attack(self.user_id, target_id).await,
            BotAction::Heal => {
                self.service
                    .use_item(self.user_id, "medkit".to_string(), None)
                    .await
            }
            BotAction::EndTurn => self.service.end_turn(self.user_id).await,
        }
    }
}
