//! Lobby lifecycle operations: join, leave, ready, start, kick.
//!
//! Pure validate-then-mutate functions over the in-memory state; the
//! session runtime applies the returned effects in order.

use uuid::Uuid;

use crate::game::Effect;
use crate::store::characters::CharacterRow;
use crate::sync::ChangeRecord;
use crate::ws::protocol::{ServerMsg, SessionStatus, Visibility};

use super::error::SessionError;
use super::state::{Participant, SessionState, StatBlock};

/// Everything a join request carries once the service has resolved it
pub struct JoinArgs {
    pub user_id: Uuid,
    pub username: String,
    pub password: Option<String>,
    pub character: Option<CharacterRow>,
    pub is_bot: bool,
}

/// What the runtime needs to know after a roster removal
#[derive(Debug)]
pub struct LeaveOutcome {
    pub participant_id: Uuid,
    pub user_id: Uuid,
    /// No non-bot participant was left to inherit the host role
    pub session_finished: bool,
}

/// Build a participant for `join` or session creation
pub fn make_participant(
    user_id: Uuid,
    username: String,
    character: Option<&CharacterRow>,
    is_host: bool,
    is_bot: bool,
    spawn_index: usize,
) -> Participant {
    let stats = character
        .map(StatBlock::from_character)
        .unwrap_or_else(StatBlock::baseline);
    let max_hp = character.map(|c| c.max_hp()).unwrap_or(30);
    let max_ap = character.map(|c| c.max_ap()).unwrap_or(8);

    Participant {
        id: Uuid::new_v4(),
        user_id,
        username,
        character_id: character.map(|c| c.id),
        is_host,
        is_bot,
        // The host is created ready; everyone else opts in
        ready: is_host,
        connected: true,
        x: (spawn_index as i32 % 4) * 2,
        y: (spawn_index as i32 / 4) * 2,
        elevation: 0,
        facing: Default::default(),
        hp: max_hp,
        max_hp,
        ap: max_ap,
        max_ap,
        in_combat: false,
        dead: false,
        initiative: 0,
        stats,
    }
}

pub fn apply_join(
    state: &mut SessionState,
    args: JoinArgs,
) -> Result<(Uuid, Vec<Effect>), SessionError> {
    if state.status != SessionStatus::Lobby {
        return Err(SessionError::NotJoinable);
    }
    if state.participant_by_user(args.user_id).is_some() {
        return Err(SessionError::AlreadyJoined);
    }
    if state.participants.len() as u32 >= state.capacity {
        return Err(SessionError::Full);
    }
    if state.visibility == Visibility::Private && state.password != args.password {
        return Err(SessionError::Forbidden);
    }
    if let Some(character) = &args.character {
        if character.level < state.min_level || character.level > state.max_level {
            return Err(SessionError::LevelOutOfRange);
        }
    }

    let participant = make_participant(
        args.user_id,
        args.username,
        args.character.as_ref(),
        false,
        args.is_bot,
        state.participants.len(),
    );
    let participant_id = participant.id;
    let public = participant.public();
    state.participants.push(participant);

    let effects = vec![
        Effect::InsertParticipant(participant_id),
        Effect::Broadcast(ServerMsg::PlayerConnected { participant: public }),
    ];
    Ok((participant_id, effects))
}

pub fn apply_ready(
    state: &mut SessionState,
    user_id: Uuid,
    ready: bool,
) -> Result<Vec<Effect>, SessionError> {
    if state.status != SessionStatus::Lobby {
        return Err(SessionError::AlreadyStarted);
    }
    let p = state
        .participant_by_user_mut(user_id)
        .ok_or(SessionError::ParticipantNotFound)?;
    p.ready = ready;
    let participant_id = p.id;

    Ok(vec![
        Effect::PersistParticipant(participant_id),
        Effect::Broadcast(ServerMsg::PlayerReadyChanged {
            participant_id,
            ready,
        }),
    ])
}

/// Start the session: host only, everyone ready, lobby only. On success
/// the status flips to Playing; the runtime hands off to begin-combat.
pub fn apply_start(state: &mut SessionState, user_id: Uuid) -> Result<Vec<Effect>, SessionError> {
    if state.host_user_id != user_id {
        return Err(SessionError::Forbidden);
    }
    if state.status != SessionStatus::Lobby {
        return Err(SessionError::AlreadyStarted);
    }
    if !state.participants.iter().all(|p| p.ready) {
        return Err(SessionError::NotReady);
    }

    state.status = SessionStatus::Playing;
    Ok(vec![
        Effect::Record(ChangeRecord::combat_state(false, 0, SessionStatus::Playing)),
        Effect::PersistSession,
    ])
}

pub fn apply_leave(
    state: &mut SessionState,
    user_id: Uuid,
    kicked: bool,
) -> Result<(Vec<Effect>, LeaveOutcome), SessionError> {
    let (participant_id, was_host) = {
        let p = state
            .participant_by_user(user_id)
            .ok_or(SessionError::ParticipantNotFound)?;
        (p.id, p.is_host)
    };

    let mut effects = Vec::new();

    if state.status == SessionStatus::Playing {
        // Mid-play the roster is not edited: the leaver is flagged dead
        // and disconnected so the turn machine skips them, and the order
        // prunes them at the next rollover.
        let p = state.participant_mut(participant_id).expect("found above");
        p.dead = true;
        p.connected = false;
        effects.push(Effect::Record(ChangeRecord::death(participant_id)));
        effects.push(Effect::PersistParticipant(participant_id));
    } else {
        state.participants.retain(|p| p.id != participant_id);
        effects.push(Effect::DeleteParticipant(participant_id));
    }

    effects.push(Effect::Broadcast(ServerMsg::PlayerLeft {
        participant_id,
        kicked,
    }));

    let mut session_finished = false;
    if was_host {
        // Host role passes to the earliest-joined non-bot; with no human
        // left the session is over.
        let next_host = state
            .participants
            .iter()
            .find(|p| !p.is_bot && p.user_id != user_id)
            .map(|p| (p.id, p.user_id));

        match next_host {
            Some((next_id, next_user)) => {
                for p in state.participants.iter_mut() {
                    p.is_host = p.id == next_id;
                }
                state.host_user_id = next_user;
                effects.push(Effect::TransferHost {
                    from: user_id,
                    to: next_user,
                });
                effects.push(Effect::Broadcast(ServerMsg::HostChanged {
                    participant_id: next_id,
                }));
            }
            None => {
                session_finished = true;
            }
        }
    }

    Ok((
        effects,
        LeaveOutcome {
            participant_id,
            user_id,
            session_finished,
        },
    ))
}

pub fn apply_kick(
    state: &mut SessionState,
    requester_user: Uuid,
    target_participant: Uuid,
) -> Result<(Vec<Effect>, LeaveOutcome), SessionError> {
    if state.host_user_id != requester_user {
        return Err(SessionError::Forbidden);
    }
    if state.status != SessionStatus::Lobby {
        return Err(SessionError::AlreadyStarted);
    }
    let target = state
        .participant(target_participant)
        .ok_or(SessionError::ParticipantNotFound)?;
    if target.is_host {
        return Err(SessionError::Forbidden);
    }
    let target_user = target.user_id;

    apply_leave(state, target_user, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{participant, session_state};

    fn lobby_with_host() -> (SessionState, Uuid) {
        let mut state = session_state(Visibility::Public, 4);
        let host_user = state.host_user_id;
        let mut host = participant("host", false);
        host.user_id = host_user;
        host.is_host = true;
        host.ready = true;
        state.participants.push(host);
        (state, host_user)
    }

    fn join_args(username: &str, is_bot: bool) -> JoinArgs {
        JoinArgs {
            user_id: Uuid::new_v4(),
            username: username.to_string(),
            password: None,
            character: None,
            is_bot,
        }
    }

    #[test]
    fn join_error_taxonomy() {
        let (mut state, _) = lobby_with_host();

        // Private session, wrong password
        state.visibility = Visibility::Private;
        state.password = Some("hunter2".into());
        let err = apply_join(&mut state, join_args("eve", false)).unwrap_err();
        assert!(matches!(err, SessionError::Forbidden));
        state.visibility = Visibility::Public;
        state.password = None;

        // Rejoin attempt
        let args = join_args("alice", false);
        let alice_user = args.user_id;
        apply_join(&mut state, args).unwrap();
        let rejoin = JoinArgs {
            user_id: alice_user,
            username: "alice".into(),
            password: None,
            character: None,
            is_bot: false,
        };
        let err = apply_join(&mut state, rejoin).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyJoined));

        // Fill up, then overflow
        apply_join(&mut state, join_args("bob", false)).unwrap();
        apply_join(&mut state, join_args("carol", false)).unwrap();
        let err = apply_join(&mut state, join_args("dave", false)).unwrap_err();
        assert!(matches!(err, SessionError::Full));

        // No longer a lobby
        state.status = SessionStatus::Playing;
        let err = apply_join(&mut state, join_args("late", false)).unwrap_err();
        assert!(matches!(err, SessionError::NotJoinable));
    }

    #[test]
    fn join_checks_level_band() {
        let (mut state, _) = lobby_with_host();
        state.min_level = 5;
        state.max_level = 10;

        let mut args = join_args("lowbie", false);
        args.character = Some(crate::store::characters::CharacterRow {
            id: Uuid::new_v4(),
            user_id: args.user_id,
            name: "lowbie".into(),
            level: 2,
            perception: 5,
            luck: 5,
            agility: 5,
            endurance: 5,
            strength: 5,
        });
        let err = apply_join(&mut state, args).unwrap_err();
        assert!(matches!(err, SessionError::LevelOutOfRange));
    }

    #[test]
    fn host_leaving_lobby_hands_host_to_earliest_human() {
        // Host + one human + one bot: the human inherits, the bot is
        // untouched, the session stays in Lobby.
        let (mut state, host_user) = lobby_with_host();
        let (human_id, human_user) = {
            let args = join_args("human", false);
            let user = args.user_id;
            let (id, _) = apply_join(&mut state, args).unwrap();
            (id, user)
        };
        apply_join(&mut state, join_args("bot", true)).unwrap();

        let (effects, outcome) = apply_leave(&mut state, host_user, false).unwrap();
        assert!(!outcome.session_finished);
        assert_eq!(state.status, SessionStatus::Lobby);
        assert_eq!(state.host_user_id, human_user);
        assert!(state.participant(human_id).unwrap().is_host);
        assert_eq!(state.participants.len(), 2);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Broadcast(ServerMsg::HostChanged { participant_id }) if *participant_id == human_id
        )));
    }

    #[test]
    fn host_leaving_with_only_bots_finishes_session() {
        let (mut state, host_user) = lobby_with_host();
        apply_join(&mut state, join_args("bot", true)).unwrap();

        let (_, outcome) = apply_leave(&mut state, host_user, false).unwrap();
        assert!(outcome.session_finished);
    }

    #[test]
    fn start_requires_host_and_readiness() {
        let (mut state, host_user) = lobby_with_host();
        let args = join_args("slow", false);
        let slow_user = args.user_id;
        apply_join(&mut state, args).unwrap();

        let err = apply_start(&mut state, slow_user).unwrap_err();
        assert!(matches!(err, SessionError::Forbidden));

        let err = apply_start(&mut state, host_user).unwrap_err();
        assert!(matches!(err, SessionError::NotReady));

        apply_ready(&mut state, slow_user, true).unwrap();
        apply_start(&mut state, host_user).unwrap();
        assert_eq!(state.status, SessionStatus::Playing);

        let err = apply_start(&mut state, host_user).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyStarted));
    }

    #[test]
    fn kick_is_host_only_and_never_the_host() {
        let (mut state, host_user) = lobby_with_host();
        let host_participant = state.participants[0].id;
        let args = join_args("victim", false);
        let victim_user = args.user_id;
        let (victim_id, _) = apply_join(&mut state, args).unwrap();

        let err = apply_kick(&mut state, victim_user, host_participant).unwrap_err();
        assert!(matches!(err, SessionError::Forbidden));

        let err = apply_kick(&mut state, host_user, host_participant).unwrap_err();
        assert!(matches!(err, SessionError::Forbidden));

        apply_kick(&mut state, host_user, victim_id).unwrap();
        assert!(state.participant(victim_id).is_none());
    }

    #[test]
    fn leave_during_play_flags_dead_instead_of_removing() {
        let (mut state, _) = lobby_with_host();
        let args = join_args("quitter", false);
        let quitter_user = args.user_id;
        let (quitter_id, _) = apply_join(&mut state, args).unwrap();
        state.status = SessionStatus::Playing;

        apply_leave(&mut state, quitter_user, false).unwrap();
        let p = state.participant(quitter_id).unwrap();
        assert!(p.dead);
        assert!(!p.connected);
        assert_eq!(state.participants.len(), 2);
    }
}
