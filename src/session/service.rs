//! Session service: resolves session ids to live runtimes and routes
//! commands into them. This is the single entry point for socket
//! handlers, HTTP routes and bots alike - bots get no back door.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::SessionCache;
use crate::config::Config;
use crate::store::characters::CharacterRow;
use crate::store::sessions::{NewSession, SessionRow};
use crate::store::{AccountStore, CharacterStore, SessionStore};
use crate::ws::protocol::{Facing, FullState, SessionPublic, SessionStatus, Visibility};
use crate::ws::registry::ConnectionRegistry;

use super::error::SessionError;
use super::lifecycle::{self, JoinArgs};
use super::runtime::{SessionCommand, SessionHandle, SessionRuntime};
use super::state::{Participant, SessionState};

/// Lobby configuration for session creation
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub name: String,
    pub visibility: Visibility,
    pub password: Option<String>,
    pub capacity: u32,
    pub min_level: u32,
    pub max_level: u32,
    pub map_id: String,
    pub turn_seconds: Option<u32>,
    pub character_id: Option<Uuid>,
}

pub struct SessionService {
    config: Arc<Config>,
    store: SessionStore,
    characters: CharacterStore,
    accounts: AccountStore,
    cache: SessionCache,
    connections: Arc<ConnectionRegistry>,
    live: Arc<DashMap<Uuid, SessionHandle>>,
    /// user id -> session id for everyone currently joined somewhere
    memberships: Arc<DashMap<Uuid, Uuid>>,
    /// Serializes revival of sessions that have rows but no runtime
    revival_lock: Mutex<()>,
}

impl SessionService {
    pub fn new(
        config: Arc<Config>,
        store: SessionStore,
        characters: CharacterStore,
        accounts: AccountStore,
        cache: SessionCache,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            characters,
            accounts,
            cache,
            connections,
            live: Arc::new(DashMap::new()),
            memberships: Arc::new(DashMap::new()),
            revival_lock: Mutex::new(()),
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.live.len()
    }

    pub fn session_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.memberships.get(&user_id).map(|r| *r)
    }

    /// Create a session plus its host participant (ready from the start)
    pub async fn create_session(
        &self,
        user_id: Uuid,
        username: String,
        is_bot: bool,
        params: CreateSessionParams,
    ) -> Result<SessionPublic, SessionError> {
        if self.memberships.contains_key(&user_id) {
            return Err(SessionError::AlreadyJoined);
        }

        let character = self.resolve_character(user_id, params.character_id).await?;

        let new_session = NewSession {
            id: Uuid::new_v4(),
            name: params.name,
            visibility: params.visibility,
            password: params.password,
            capacity: params.capacity.clamp(2, 16),
            min_level: params.min_level,
            max_level: params.max_level,
            map_id: params.map_id,
            turn_seconds: params
                .turn_seconds
                .unwrap_or(self.config.default_turn_seconds),
            status: SessionStatus::Lobby,
            host_user_id: user_id,
        };
        let row: SessionRow = self.store.create_session(&new_session).await?;

        let host = lifecycle::make_participant(
            user_id,
            username,
            character.as_ref(),
            true,
            is_bot,
            0,
        );
        if let Err(e) = self.store.insert_participant(&host.to_row(row.id)).await {
            warn!(session_id = %row.id, error = %e, "Host participant insert failed");
        }

        let state = SessionState::from_rows(&row, vec![host]);
        let public = state.public();

        let handle = self.spawn_runtime(state);
        self.memberships.insert(user_id, handle.id);
        self.connections.subscribe(handle.id, user_id);

        info!(session_id = %handle.id, host = %user_id, "Session created");
        Ok(public)
    }

    pub async fn join(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        username: String,
        password: Option<String>,
        character_id: Option<Uuid>,
        is_bot: bool,
    ) -> Result<FullState, SessionError> {
        if self.memberships.contains_key(&user_id) {
            return Err(SessionError::AlreadyJoined);
        }

        let character = self.resolve_character(user_id, character_id).await?;
        let handle = self.ensure_runtime(session_id).await?;

        let args = JoinArgs {
            user_id,
            username,
            password,
            character,
            is_bot,
        };
        let state = self
            .send(&handle, |reply| SessionCommand::Join { args, reply })
            .await?;

        self.memberships.insert(user_id, session_id);
        Ok(state)
    }

    pub async fn leave(&self, user_id: Uuid) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        self.send(&handle, |reply| SessionCommand::Leave { user_id, reply })
            .await?;
        self.memberships.remove(&user_id);
        Ok(())
    }

    pub async fn set_ready(&self, user_id: Uuid, ready: bool) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        self.send(&handle, |reply| SessionCommand::Ready {
            user_id,
            ready,
            reply,
        })
        .await
    }

    pub async fn start(&self, session_id: Uuid, user_id: Uuid) -> Result<(), SessionError> {
        let handle = self.handle_for(session_id)?;
        self.send(&handle, |reply| SessionCommand::Start { user_id, reply })
            .await
    }

    pub async fn kick(
        &self,
        session_id: Uuid,
        requester: Uuid,
        target_participant: Uuid,
    ) -> Result<(), SessionError> {
        let handle = self.handle_for(session_id)?;
        self.send(&handle, |reply| SessionCommand::Kick {
            user_id: requester,
            target_participant,
            reply,
        })
        .await
    }

    pub async fn move_to(
        &self,
        user_id: Uuid,
        x: i32,
        y: i32,
        facing: Facing,
    ) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        self.send(&handle, |reply| SessionCommand::Move {
            user_id,
            x,
            y,
            facing,
            reply,
        })
        .await
    }

    pub async fn attack(&self, user_id: Uuid, target_id: Uuid) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        self.send(&handle, |reply| SessionCommand::Attack {
            user_id,
            target_id,
            reply,
        })
        .await
    }

    pub async fn use_item(
        &self,
        user_id: Uuid,
        item_id: String,
        target_id: Option<Uuid>,
    ) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        self.send(&handle, |reply| SessionCommand::UseItem {
            user_id,
            item_id,
            target_id,
            reply,
        })
        .await
    }

    pub async fn interact(&self, user_id: Uuid, object_id: String) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        self.send(&handle, |reply| SessionCommand::Interact {
            user_id,
            object_id,
            reply,
        })
        .await
    }

    pub async fn end_turn(&self, user_id: Uuid) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        self.send(&handle, |reply| SessionCommand::EndTurn { user_id, reply })
            .await
    }

    pub async fn chat(&self, user_id: Uuid, text: String) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        handle
            .tx
            .send(SessionCommand::Chat { user_id, text })
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn sync_request(
        &self,
        user_id: Uuid,
        since: Option<u64>,
    ) -> Result<(), SessionError> {
        let handle = self.handle_for_user(user_id)?;
        handle
            .tx
            .send(SessionCommand::SyncRequest { user_id, since })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Current full snapshot; what bots poll instead of a socket
    pub async fn snapshot(&self, session_id: Uuid) -> Result<FullState, SessionError> {
        let handle = self.handle_for(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(SessionCommand::Snapshot { reply: tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Socket dropped: flip the flag, keep the clock running
    pub async fn disconnected(&self, user_id: Uuid) {
        if let Ok(handle) = self.handle_for_user(user_id) {
            let _ = handle.tx.send(SessionCommand::Disconnected { user_id }).await;
        }
    }

    /// Fresh socket for a user who is still a participant somewhere
    pub async fn reconnected(&self, user_id: Uuid) -> bool {
        match self.handle_for_user(user_id) {
            Ok(handle) => handle
                .tx
                .send(SessionCommand::Reconnected { user_id })
                .await
                .is_ok(),
            Err(_) => false,
        }
    }

    pub async fn list_public_lobbies(&self) -> Result<Vec<SessionRow>, SessionError> {
        Ok(self
            .store
            .list_sessions(SessionStatus::Lobby, Visibility::Public)
            .await?)
    }

    fn handle_for(&self, session_id: Uuid) -> Result<SessionHandle, SessionError> {
        self.live
            .get(&session_id)
            .map(|h| h.clone())
            .ok_or(SessionError::NotFound)
    }

    fn handle_for_user(&self, user_id: Uuid) -> Result<SessionHandle, SessionError> {
        let session_id = self
            .memberships
            .get(&user_id)
            .map(|r| *r)
            .ok_or(SessionError::ParticipantNotFound)?;
        self.handle_for(session_id)
    }

    async fn resolve_character(
        &self,
        user_id: Uuid,
        character_id: Option<Uuid>,
    ) -> Result<Option<CharacterRow>, SessionError> {
        let Some(character_id) = character_id else {
            return Ok(None);
        };
        let character = self
            .characters
            .get_character(character_id)
            .await?
            .ok_or_else(|| SessionError::Validation("unknown character".into()))?;
        if character.user_id != user_id {
            return Err(SessionError::Forbidden);
        }
        Ok(Some(character))
    }

    /// Get the live runtime, reviving it from store rows if this process
    /// has none (e.g. after a restart with sessions still in the store).
    async fn ensure_runtime(&self, session_id: Uuid) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.live.get(&session_id) {
            return Ok(handle.clone());
        }

        let _guard = self.revival_lock.lock().await;
        if let Some(handle) = self.live.get(&session_id) {
            return Ok(handle.clone());
        }

        let row = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        if row.status == SessionStatus::Finished {
            return Err(SessionError::NotJoinable);
        }

        let participant_rows = self.store.list_participants(session_id).await?;
        let mut participants = Vec::with_capacity(participant_rows.len());
        for p_row in &participant_rows {
            let character = match p_row.character_id {
                Some(id) => self.characters.get_character(id).await.unwrap_or(None),
                None => None,
            };
            let participant = Participant::from_row(p_row, character.as_ref());
            self.memberships.insert(participant.user_id, session_id);
            participants.push(participant);
        }

        let state = SessionState::from_rows(&row, participants);
        info!(session_id = %session_id, "Reviving session runtime from store");
        Ok(self.spawn_runtime(state))
    }

    fn spawn_runtime(&self, state: SessionState) -> SessionHandle {
        let (runtime, handle) = SessionRuntime::new(
            state,
            self.cache.clone(),
            self.store.clone(),
            self.accounts.clone(),
            self.connections.clone(),
        );
        self.live.insert(handle.id, handle.clone());

        let session_id = handle.id;
        let live = self.live.clone();
        let memberships = self.memberships.clone();
        let connections = self.connections.clone();
        tokio::spawn(async move {
            runtime.run().await;
            live.remove(&session_id);
            memberships.retain(|_, sid| *sid != session_id);
            connections.remove_session(session_id);
            info!(session_id = %session_id, "Session removed from registry");
        });

        handle
    }

    async fn send<T>(
        &self,
        handle: &SessionHandle,
        build: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(build(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}
