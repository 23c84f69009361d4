//! Per-session runtime: one task owns all mutation for its session.
//!
//! Every caller - socket handler, HTTP route, bot, timer callback -
//! submits a command into the mailbox and the runtime processes them one
//! at a time. That single consumer is the per-session mutual exclusion:
//! manual end-turn, timer expiry and lobby edits can never interleave,
//! and broadcast order always matches mutation order.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{SessionCache, TurnRecord, TurnTimer};
use crate::game::{actions, turns, Effect, TurnEndReason};
use crate::store::sessions::{ParticipantUpdate, SessionUpdate};
use crate::store::{AccountStore, SessionStore};
use crate::sync;
use crate::util::time::{millis_until, unix_millis};
use crate::ws::protocol::{Facing, FullState, ServerMsg};
use crate::ws::registry::ConnectionRegistry;

use super::error::SessionError;
use super::lifecycle::{self, JoinArgs};
use super::state::SessionState;

/// Extra delay past the deadline before the timeout callback fires, so a
/// turn ending right at the wire is seen by the freshness re-check.
const TIMER_FIRE_BUFFER_MS: u64 = 500;

const MAILBOX_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Commands accepted by a session runtime
pub enum SessionCommand {
    Join {
        args: JoinArgs,
        reply: Reply<FullState>,
    },
    Leave {
        user_id: Uuid,
        reply: Reply<()>,
    },
    Ready {
        user_id: Uuid,
        ready: bool,
        reply: Reply<()>,
    },
    Start {
        user_id: Uuid,
        reply: Reply<()>,
    },
    Kick {
        user_id: Uuid,
        target_participant: Uuid,
        reply: Reply<()>,
    },
    Move {
        user_id: Uuid,
        x: i32,
        y: i32,
        facing: Facing,
        reply: Reply<()>,
    },
    Attack {
        user_id: Uuid,
        target_id: Uuid,
        reply: Reply<()>,
    },
    UseItem {
        user_id: Uuid,
        item_id: String,
        target_id: Option<Uuid>,
        reply: Reply<()>,
    },
    Interact {
        user_id: Uuid,
        object_id: String,
        reply: Reply<()>,
    },
    EndTurn {
        user_id: Uuid,
        reply: Reply<()>,
    },
    Chat {
        user_id: Uuid,
        text: String,
    },
    SyncRequest {
        user_id: Uuid,
        since: Option<u64>,
    },
    Snapshot {
        reply: oneshot::Sender<FullState>,
    },
    Disconnected {
        user_id: Uuid,
    },
    Reconnected {
        user_id: Uuid,
    },
    TimerFired {
        generation: u64,
    },
}

/// Handle to a running session task
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub tx: mpsc::Sender<SessionCommand>,
}

/// The session actor
pub struct SessionRuntime {
    state: SessionState,
    turn: Option<TurnRecord>,
    rx: mpsc::Receiver<SessionCommand>,
    self_tx: mpsc::Sender<SessionCommand>,
    cache: SessionCache,
    store: SessionStore,
    accounts: AccountStore,
    connections: Arc<ConnectionRegistry>,
    timer_generation: u64,
    timer_task: Option<JoinHandle<()>>,
    rng: ChaCha8Rng,
    finished: bool,
}

impl SessionRuntime {
    pub fn new(
        state: SessionState,
        cache: SessionCache,
        store: SessionStore,
        accounts: AccountStore,
        connections: Arc<ConnectionRegistry>,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = SessionHandle {
            id: state.id,
            tx: tx.clone(),
        };

        // A revived session picks its turn pointer back up from the cache
        let turn = cache.turn_record(state.id);

        let runtime = Self {
            state,
            turn,
            rx,
            self_tx: tx,
            cache,
            store,
            accounts,
            connections,
            timer_generation: 0,
            timer_task: None,
            rng: ChaCha8Rng::seed_from_u64(rand::random()),
            finished: false,
        };
        (runtime, handle)
    }

    pub async fn run(mut self) {
        info!(session_id = %self.state.id, "Session runtime started");

        // A revived combat session needs its clock re-armed
        if let Some(holder) = turns::current_holder(&self.turn) {
            if self.cache.timer(self.state.id).is_none() && self.state.in_combat {
                let round = self.turn.as_ref().map(|t| t.round).unwrap_or(0);
                let now = unix_millis();
                let timer = TurnTimer {
                    participant_id: holder,
                    started_at: now,
                    deadline: now + self.state.turn_seconds as u64 * 1000,
                    seconds: self.state.turn_seconds,
                };
                let ap = self.state.participant(holder).map(|p| p.ap).unwrap_or(0);
                let deadline = timer.deadline;
                self.arm_timer(timer);
                self.connections.broadcast(
                    self.state.id,
                    &ServerMsg::TurnStart {
                        participant_id: holder,
                        round,
                        ap,
                        deadline,
                    },
                    None,
                );
            }
        }

        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd).await;
            if self.finished {
                break;
            }
        }

        if let Some(task) = self.timer_task.take() {
            task.abort();
        }
        self.cache.purge_session(self.state.id);
        info!(session_id = %self.state.id, "Session runtime stopped");
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join { args, reply } => {
                let user_id = args.user_id;
                let result = lifecycle::apply_join(&mut self.state, args);
                let result = match result {
                    Ok((_, effects)) => {
                        self.connections.subscribe(self.state.id, user_id);
                        self.apply_effects(effects).await;
                        Ok(self.full_state())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            SessionCommand::Leave { user_id, reply } => {
                let result = self.handle_leave(user_id, false).await;
                let _ = reply.send(result);
            }

            SessionCommand::Ready {
                user_id,
                ready,
                reply,
            } => {
                let result = match lifecycle::apply_ready(&mut self.state, user_id, ready) {
                    Ok(effects) => {
                        self.apply_effects(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            SessionCommand::Start { user_id, reply } => {
                let result = match lifecycle::apply_start(&mut self.state, user_id) {
                    Ok(effects) => {
                        self.apply_effects(effects).await;
                        let effects = turns::begin_combat(&mut self.state, &mut self.turn);
                        self.apply_effects(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            SessionCommand::Kick {
                user_id,
                target_participant,
                reply,
            } => {
                let result =
                    match lifecycle::apply_kick(&mut self.state, user_id, target_participant) {
                        Ok((effects, outcome)) => {
                            self.apply_effects(effects).await;
                            self.connections.unsubscribe(self.state.id, outcome.user_id);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                let _ = reply.send(result);
            }

            SessionCommand::Move {
                user_id,
                x,
                y,
                facing,
                reply,
            } => {
                let result =
                    match actions::handle_move(&mut self.state, &self.turn, user_id, x, y, facing) {
                        Ok(effects) => {
                            self.apply_effects(effects).await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                let _ = reply.send(result);
            }

            SessionCommand::Attack {
                user_id,
                target_id,
                reply,
            } => {
                let result = match actions::handle_attack(
                    &mut self.state,
                    &self.turn,
                    user_id,
                    target_id,
                    &mut self.rng,
                ) {
                    Ok(effects) => {
                        self.apply_effects(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            SessionCommand::UseItem {
                user_id,
                item_id,
                target_id,
                reply,
            } => {
                let result = match actions::handle_use_item(
                    &mut self.state,
                    &self.turn,
                    user_id,
                    &item_id,
                    target_id,
                ) {
                    Ok(effects) => {
                        self.apply_effects(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            SessionCommand::Interact {
                user_id,
                object_id,
                reply,
            } => {
                let result = match actions::handle_interact(
                    &mut self.state,
                    &self.turn,
                    user_id,
                    &object_id,
                ) {
                    Ok(effects) => {
                        self.apply_effects(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            SessionCommand::EndTurn { user_id, reply } => {
                let result = match turns::ensure_holder(&self.state, &self.turn, user_id) {
                    Ok(_) => {
                        let effects =
                            turns::advance_turn(&mut self.state, &mut self.turn, TurnEndReason::Manual);
                        self.apply_effects(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            SessionCommand::Chat { user_id, text } => {
                if let Some(p) = self.state.participant_by_user(user_id) {
                    let msg = ServerMsg::ChatMessage {
                        participant_id: p.id,
                        username: p.username.clone(),
                        text,
                    };
                    self.connections.broadcast(self.state.id, &msg, None);
                }
            }

            SessionCommand::SyncRequest { user_id, since } => {
                let msg = match since {
                    Some(since) => sync::delta_since(&self.cache, self.state.id, since),
                    None => ServerMsg::SyncFullState {
                        state: self.full_state(),
                    },
                };
                self.connections.unicast(user_id, msg);
            }

            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.full_state());
            }

            SessionCommand::Disconnected { user_id } => {
                // A drop flips the flag and continues the clock; the turn
                // may expire and pass to someone who is offline.
                if let Some(p) = self.state.participant_by_user_mut(user_id) {
                    p.connected = false;
                    let participant_id = p.id;
                    self.persist_participant(participant_id).await;
                    self.connections.broadcast(
                        self.state.id,
                        &ServerMsg::PlayerDisconnected { participant_id },
                        None,
                    );
                }
                self.connections.unsubscribe(self.state.id, user_id);
            }

            SessionCommand::Reconnected { user_id } => {
                if let Some(p) = self.state.participant_by_user_mut(user_id) {
                    p.connected = true;
                    let participant_id = p.id;
                    let public = self
                        .state
                        .participant(participant_id)
                        .expect("participant exists")
                        .public();
                    self.persist_participant(participant_id).await;
                    self.connections.subscribe(self.state.id, user_id);
                    self.connections.broadcast(
                        self.state.id,
                        &ServerMsg::PlayerConnected { participant: public },
                        None,
                    );
                    // Reconnection recovery baseline
                    self.connections.unicast(
                        user_id,
                        ServerMsg::SyncFullState {
                            state: self.full_state(),
                        },
                    );
                }
            }

            SessionCommand::TimerFired { generation } => {
                if !timeout_is_current(
                    generation,
                    self.timer_generation,
                    self.cache.timer(self.state.id).as_ref(),
                    unix_millis(),
                ) {
                    return;
                }
                let effects =
                    turns::advance_turn(&mut self.state, &mut self.turn, TurnEndReason::Timeout);
                self.apply_effects(effects).await;
            }
        }
    }

    async fn handle_leave(&mut self, user_id: Uuid, kicked: bool) -> Result<(), SessionError> {
        let was_holder = turns::current_holder(&self.turn)
            .and_then(|id| self.state.participant(id))
            .map(|p| p.user_id == user_id)
            .unwrap_or(false);

        let (effects, outcome) = lifecycle::apply_leave(&mut self.state, user_id, kicked)?;
        self.apply_effects(effects).await;
        self.connections.unsubscribe(self.state.id, user_id);

        if outcome.session_finished {
            if self.state.in_combat {
                let effects = turns::end_combat(&mut self.state, &mut self.turn, None);
                self.apply_effects(effects).await;
            } else {
                self.state.status = crate::ws::protocol::SessionStatus::Finished;
                self.persist_session().await;
                self.connections.broadcast(
                    self.state.id,
                    &ServerMsg::GameEnded {
                        session_id: self.state.id,
                    },
                    None,
                );
                self.finished = true;
            }
        } else if was_holder && self.turn.is_some() {
            // The leaver held the turn; pass it on immediately
            let effects =
                turns::advance_turn(&mut self.state, &mut self.turn, TurnEndReason::Manual);
            self.apply_effects(effects).await;
        }

        Ok(())
    }

    fn full_state(&self) -> FullState {
        let timer = self.cache.timer(self.state.id);
        sync::build_full_state(&self.state, self.turn.as_ref(), timer.as_ref())
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(msg) => {
                    self.connections.broadcast(self.state.id, &msg, None);
                }
                Effect::Record(change) => {
                    sync::record_and_broadcast(
                        &self.cache,
                        &self.connections,
                        self.state.id,
                        change,
                    );
                }
                Effect::WriteTurn(turn) => {
                    self.cache.put_turn_record(self.state.id, &turn);
                }
                Effect::ClearTurn => {
                    self.cache.delete_turn_record(self.state.id);
                }
                Effect::ArmTimer(timer) => {
                    self.arm_timer(timer);
                }
                Effect::ClearTimer => {
                    self.clear_timer();
                }
                Effect::PersistSession => {
                    self.persist_session().await;
                }
                Effect::InsertParticipant(id) => {
                    self.insert_participant(id).await;
                }
                Effect::PersistParticipant(id) => {
                    self.persist_participant(id).await;
                }
                Effect::DeleteParticipant(id) => {
                    if let Err(e) = self.store.delete_participant(id).await {
                        warn!(session_id = %self.state.id, error = %e, "Participant delete failed");
                    }
                }
                Effect::TransferHost { from, to } => {
                    if let Err(e) = self.store.transfer_host(self.state.id, from, to).await {
                        warn!(session_id = %self.state.id, error = %e, "Host transfer write failed");
                    }
                }
                Effect::BumpWinner(user_id) => {
                    if let Err(e) = self.accounts.bump_stats(user_id, true).await {
                        warn!(user_id = %user_id, error = %e, "Winner stat bump failed");
                    }
                }
                Effect::SessionFinished => {
                    self.finished = true;
                }
            }
        }
    }

    /// Cancel-then-arm: a new timer invalidates any scheduled callback,
    /// both by aborting its task and by bumping the generation the
    /// callback must present.
    fn arm_timer(&mut self, timer: TurnTimer) {
        self.clear_timer();
        self.timer_generation += 1;
        let generation = self.timer_generation;
        self.cache.put_timer(self.state.id, &timer);

        let delay = millis_until(timer.deadline) + TIMER_FIRE_BUFFER_MS;
        let tx = self.self_tx.clone();
        self.timer_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(SessionCommand::TimerFired { generation }).await;
        }));
    }

    fn clear_timer(&mut self) {
        if let Some(task) = self.timer_task.take() {
            task.abort();
        }
        self.cache.delete_timer(self.state.id);
    }

    async fn persist_session(&self) {
        let update = SessionUpdate {
            status: Some(self.state.status),
            in_combat: Some(self.state.in_combat),
            round: Some(self.state.round),
            turn_index: Some(self.turn.as_ref().map(|t| t.index as u32).unwrap_or(0)),
            host_user_id: Some(self.state.host_user_id),
        };
        // The live session matters more than row durability
        if let Err(e) = self.store.update_session(self.state.id, &update).await {
            warn!(session_id = %self.state.id, error = %e, "Session row write failed");
        }
    }

    async fn insert_participant(&self, id: Uuid) {
        let Some(p) = self.state.participant(id) else {
            return;
        };
        if let Err(e) = self.store.insert_participant(&p.to_row(self.state.id)).await {
            warn!(session_id = %self.state.id, participant_id = %id, error = %e, "Participant insert failed");
        }
    }

    async fn persist_participant(&self, id: Uuid) {
        let Some(p) = self.state.participant(id) else {
            return;
        };
        let update = ParticipantUpdate {
            ready: Some(p.ready),
            connected: Some(p.connected),
            x: Some(p.x),
            y: Some(p.y),
            elevation: Some(p.elevation),
            facing: Some(p.facing),
            hp: Some(p.hp),
            ap: Some(p.ap),
            in_combat: Some(p.in_combat),
            dead: Some(p.dead),
            initiative: Some(p.initiative),
            is_host: Some(p.is_host),
        };
        if let Err(e) = self.store.update_participant(id, &update).await {
            warn!(session_id = %self.state.id, participant_id = %id, error = %e, "Participant row write failed");
        }
    }
}

/// Freshness check for a fired timeout callback: the generation must be
/// the one the timer was armed with, the cache record must still exist
/// (the turn may have ended between scheduling and firing) and the
/// deadline must actually be past.
fn timeout_is_current(
    generation: u64,
    current_generation: u64,
    timer: Option<&TurnTimer>,
    now_millis: u64,
) -> bool {
    if generation != current_generation {
        return false;
    }
    match timer {
        Some(timer) => timer.expired(now_millis),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(deadline: u64) -> TurnTimer {
        TurnTimer {
            participant_id: Uuid::new_v4(),
            started_at: deadline.saturating_sub(30_000),
            deadline,
            seconds: 30,
        }
    }

    #[test]
    fn stale_generation_is_ignored() {
        let t = timer(1_000);
        assert!(!timeout_is_current(1, 2, Some(&t), 5_000));
    }

    #[test]
    fn missing_timer_record_is_ignored() {
        // The turn ended between scheduling and firing
        assert!(!timeout_is_current(2, 2, None, 5_000));
    }

    #[test]
    fn unexpired_timer_is_ignored() {
        let t = timer(10_000);
        assert!(!timeout_is_current(2, 2, Some(&t), 5_000));
    }

    #[test]
    fn current_expired_timer_fires() {
        let t = timer(1_000);
        assert!(timeout_is_current(2, 2, Some(&t), 5_000));
    }
}
