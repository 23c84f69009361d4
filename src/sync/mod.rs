//! Sync protocol: change log, snapshots, deltas.
//!
//! `record_and_broadcast` is the single choke point every state-mutating
//! operation funnels through, under the owning session's runtime, so
//! broadcast order == log order == mutation order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::{SessionCache, TurnRecord, TurnTimer};
use crate::session::state::SessionState;
use crate::util::time::{millis_until, unix_millis};
use crate::ws::protocol::{Facing, FullState, ServerMsg, SessionStatus, TurnView};
use crate::ws::registry::ConnectionRegistry;

/// Kind of logged mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Position,
    Health,
    Ap,
    Death,
    CombatState,
}

/// One logged, broadcastable state mutation. Append-only, capped to the
/// recent window, ordered by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub participant_id: Option<Uuid>,
    pub data: Value,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl ChangeRecord {
    fn new(kind: ChangeKind, participant_id: Option<Uuid>, data: Value) -> Self {
        Self {
            kind,
            participant_id,
            data,
            timestamp: unix_millis(),
        }
    }

    pub fn position(participant_id: Uuid, x: i32, y: i32, elevation: i32, facing: Facing) -> Self {
        Self::new(
            ChangeKind::Position,
            Some(participant_id),
            serde_json::json!({ "x": x, "y": y, "elevation": elevation, "facing": facing }),
        )
    }

    pub fn health(participant_id: Uuid, hp: i32) -> Self {
        Self::new(
            ChangeKind::Health,
            Some(participant_id),
            serde_json::json!({ "hp": hp }),
        )
    }

    pub fn ap(participant_id: Uuid, ap: i32) -> Self {
        Self::new(
            ChangeKind::Ap,
            Some(participant_id),
            serde_json::json!({ "ap": ap }),
        )
    }

    pub fn death(participant_id: Uuid) -> Self {
        Self::new(
            ChangeKind::Death,
            Some(participant_id),
            serde_json::json!({ "dead": true }),
        )
    }

    /// Session-scoped combat flags (participant_id = None)
    pub fn combat_state(in_combat: bool, round: u32, status: SessionStatus) -> Self {
        Self::new(
            ChangeKind::CombatState,
            None,
            serde_json::json!({ "in_combat": in_combat, "round": round, "status": status }),
        )
    }

    /// Per-participant combat flag
    pub fn participant_combat(participant_id: Uuid, in_combat: bool) -> Self {
        Self::new(
            ChangeKind::CombatState,
            Some(participant_id),
            serde_json::json!({ "in_combat": in_combat }),
        )
    }
}

/// Assemble the full-state snapshot a viewer uses after joining or
/// reconnecting: session fields, every participant's public fields, and
/// the turn record plus remaining clock when combat is active.
pub fn build_full_state(
    state: &SessionState,
    turn: Option<&TurnRecord>,
    timer: Option<&TurnTimer>,
) -> FullState {
    let turn_view = turn.and_then(|record| {
        let current = *record.order.get(record.index)?;
        Some(TurnView {
            order: record.order.clone(),
            current_participant_id: current,
            round: record.round,
            remaining_millis: timer.map(|t| millis_until(t.deadline)).unwrap_or(0),
        })
    });

    FullState {
        session: state.public(),
        participants: state.participants.iter().map(|p| p.public()).collect(),
        turn: turn_view,
        taken_at: unix_millis(),
    }
}

/// Append a change to the bounded log, then broadcast the same payload to
/// the session's subscribers.
pub fn record_and_broadcast(
    cache: &SessionCache,
    connections: &ConnectionRegistry,
    session_id: Uuid,
    change: ChangeRecord,
) {
    cache.append_change(session_id, &change);
    connections.broadcast(
        session_id,
        &ServerMsg::SyncDelta {
            changes: vec![change],
            truncated: false,
        },
        None,
    );
}

/// Every retained change newer than `since`, oldest first. `truncated`
/// tells the caller the window no longer reaches back far enough and a
/// full snapshot is required instead.
pub fn delta_since(cache: &SessionCache, session_id: Uuid, since: u64) -> ServerMsg {
    let (changes, truncated) = cache.changes_since(session_id, since);
    ServerMsg::SyncDelta { changes, truncated }
}

/// Replay one change onto a snapshot. This mirrors what clients do when
/// they consume `sync:delta` instead of pulling a fresh snapshot.
pub fn apply_change(state: &mut FullState, change: &ChangeRecord) {
    let data = &change.data;
    match change.kind {
        ChangeKind::Position => {
            if let Some(p) = find_participant(state, change.participant_id) {
                if let Some(x) = data.get("x").and_then(Value::as_i64) {
                    p.x = x as i32;
                }
                if let Some(y) = data.get("y").and_then(Value::as_i64) {
                    p.y = y as i32;
                }
                if let Some(e) = data.get("elevation").and_then(Value::as_i64) {
                    p.elevation = e as i32;
                }
                if let Some(f) = data
                    .get("facing")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                {
                    p.facing = f;
                }
            }
        }
        ChangeKind::Health => {
            if let Some(p) = find_participant(state, change.participant_id) {
                if let Some(hp) = data.get("hp").and_then(Value::as_i64) {
                    p.hp = hp as i32;
                }
            }
        }
        ChangeKind::Ap => {
            if let Some(p) = find_participant(state, change.participant_id) {
                if let Some(ap) = data.get("ap").and_then(Value::as_i64) {
                    p.ap = ap as i32;
                }
            }
        }
        ChangeKind::Death => {
            if let Some(p) = find_participant(state, change.participant_id) {
                p.dead = true;
            }
        }
        ChangeKind::CombatState => match change.participant_id {
            Some(_) => {
                if let Some(p) = find_participant(state, change.participant_id) {
                    if let Some(flag) = data.get("in_combat").and_then(Value::as_bool) {
                        p.in_combat = flag;
                    }
                }
            }
            None => {
                if let Some(flag) = data.get("in_combat").and_then(Value::as_bool) {
                    state.session.in_combat = flag;
                }
                if let Some(round) = data.get("round").and_then(Value::as_u64) {
                    state.session.round = round as u32;
                }
                if let Some(status) = data
                    .get("status")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                {
                    state.session.status = status;
                }
            }
        },
    }
}

fn find_participant(
    state: &mut FullState,
    id: Option<Uuid>,
) -> Option<&mut crate::ws::protocol::ParticipantPublic> {
    let id = id?;
    state.participants.iter_mut().find(|p| p.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::testutil::{participant, session_state};
    use crate::ws::protocol::Visibility;

    #[test]
    fn delta_replay_matches_full_snapshot() {
        let mut state = session_state(Visibility::Public, 4);
        let a = participant("alice", false);
        let b = participant("bob", false);
        let (a_id, b_id) = (a.id, b.id);
        state.participants.push(a);
        state.participants.push(b);

        // Snapshot at time t, then mutate the authoritative state while
        // logging the same changes a live session would.
        let mut replayed = build_full_state(&state, None, None);
        let cache = SessionCache::new(std::sync::Arc::new(MemoryCache::new()));
        let since = unix_millis().saturating_sub(1);

        {
            let p = state.participant_mut(a_id).unwrap();
            p.x = 4;
            p.y = 7;
            cache.append_change(state.id, &ChangeRecord::position(a_id, 4, 7, 0, Facing::East));
            let p = state.participant_mut(a_id).unwrap();
            p.facing = Facing::East;
        }
        {
            let p = state.participant_mut(b_id).unwrap();
            p.hp = 3;
            cache.append_change(state.id, &ChangeRecord::health(b_id, 3));
        }
        {
            let p = state.participant_mut(b_id).unwrap();
            p.dead = true;
            cache.append_change(state.id, &ChangeRecord::death(b_id));
        }

        let (changes, truncated) = cache.changes_since(state.id, since);
        assert!(!truncated);
        for change in &changes {
            apply_change(&mut replayed, change);
        }

        let fresh = build_full_state(&state, None, None);
        for (got, want) in replayed.participants.iter().zip(fresh.participants.iter()) {
            assert_eq!(got.x, want.x);
            assert_eq!(got.y, want.y);
            assert_eq!(got.facing, want.facing);
            assert_eq!(got.hp, want.hp);
            assert_eq!(got.dead, want.dead);
        }
        assert_eq!(replayed.session.in_combat, fresh.session.in_combat);
    }

    #[test]
    fn session_scoped_combat_change_updates_session_fields() {
        let mut state = session_state(Visibility::Public, 4);
        state.participants.push(participant("alice", false));
        let mut snapshot = build_full_state(&state, None, None);

        apply_change(
            &mut snapshot,
            &ChangeRecord::combat_state(true, 2, SessionStatus::Playing),
        );
        assert!(snapshot.session.in_combat);
        assert_eq!(snapshot.session.round, 2);
        assert_eq!(snapshot.session.status, SessionStatus::Playing);
    }
}
