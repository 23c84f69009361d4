//! The turn state machine: begin-combat, advance-turn, end-combat

use uuid::Uuid;

use crate::cache::{TurnRecord, TurnTimer};
use crate::session::error::SessionError;
use crate::session::state::SessionState;
use crate::sync::ChangeRecord;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ServerMsg, SessionStatus};

use super::initiative::initiative_order;
use super::{Effect, TurnEndReason};

/// Enter combat: fix initiative, write the turn record, reset AP, arm the
/// first timer and announce the full order.
pub fn begin_combat(state: &mut SessionState, turn_slot: &mut Option<TurnRecord>) -> Vec<Effect> {
    let mut effects = Vec::new();

    for p in state.participants.iter_mut().filter(|p| p.alive()) {
        p.initiative = p.stats.sequence;
    }

    let order = initiative_order(&state.participants);
    if order.is_empty() {
        return effects;
    }

    state.in_combat = true;
    state.round = 1;

    effects.push(Effect::Record(ChangeRecord::combat_state(
        true,
        1,
        state.status,
    )));

    for p in state.participants.iter_mut().filter(|p| p.alive()) {
        p.in_combat = true;
        p.ap = p.max_ap;
        effects.push(Effect::Record(ChangeRecord::participant_combat(p.id, true)));
        effects.push(Effect::Record(ChangeRecord::ap(p.id, p.ap)));
        effects.push(Effect::PersistParticipant(p.id));
    }
    effects.push(Effect::PersistSession);

    let turn = TurnRecord {
        order: order.clone(),
        index: 0,
        round: 1,
    };
    effects.push(Effect::WriteTurn(turn.clone()));

    effects.push(Effect::Broadcast(ServerMsg::CombatStarted { order, round: 1 }));

    let holder = turn.order[0];
    *turn_slot = Some(turn);
    arm_timer(state, holder, 1, &mut effects);

    effects
}

/// Advance to the next living participant. Triggered by the holder ending
/// their turn or by timer expiry; a call with no live turn record is a
/// no-op, which is what makes the two triggers idempotent against each
/// other.
pub fn advance_turn(
    state: &mut SessionState,
    turn_slot: &mut Option<TurnRecord>,
    reason: TurnEndReason,
) -> Vec<Effect> {
    let mut effects = Vec::new();
    let mut turn = match turn_slot.clone() {
        Some(turn) => turn,
        None => return effects,
    };

    effects.push(Effect::ClearTimer);

    if let Some(&holder) = turn.order.get(turn.index) {
        effects.push(Effect::Broadcast(ServerMsg::TurnEnded {
            participant_id: holder,
            timeout: reason == TurnEndReason::Timeout,
        }));
    }

    let mut next = turn.index + 1;
    if next >= turn.order.len() {
        // Round rollover: prune dead and removed participants from the
        // order (they are only skipped, never removed, mid-round).
        next = 0;
        turn.round += 1;
        state.round = turn.round;
        turn.order
            .retain(|id| state.participant(*id).map(|p| p.alive()).unwrap_or(false));

        if let Some(winner) = win_condition(state) {
            effects.extend(end_combat(state, turn_slot, winner));
            return effects;
        }

        for p in state.participants.iter_mut().filter(|p| p.alive()) {
            p.ap = p.max_ap;
            effects.push(Effect::Record(ChangeRecord::ap(p.id, p.ap)));
            effects.push(Effect::PersistParticipant(p.id));
        }
        effects.push(Effect::PersistSession);
        effects.push(Effect::Broadcast(ServerMsg::NewRound { round: turn.round }));
    }

    // Skip dead participants, at most one full lap. Exhausting the lap
    // means nobody is left alive; the win check above makes this
    // unreachable, but it must never loop forever.
    let len = turn.order.len();
    let mut found = None;
    for step in 0..len {
        let idx = (next + step) % len;
        let alive = turn
            .order
            .get(idx)
            .and_then(|id| state.participant(*id))
            .map(|p| p.alive())
            .unwrap_or(false);
        if alive {
            found = Some(idx);
            break;
        }
    }

    match found {
        None => {
            effects.extend(end_combat(state, turn_slot, None));
            effects
        }
        Some(idx) => {
            turn.index = idx;
            let holder = turn.order[idx];
            let round = turn.round;
            effects.push(Effect::WriteTurn(turn.clone()));
            *turn_slot = Some(turn);
            arm_timer(state, holder, round, &mut effects);
            effects
        }
    }
}

/// Leave combat: purge the cache records, clear combat flags, mark the
/// session Finished and credit the winner.
pub fn end_combat(
    state: &mut SessionState,
    turn_slot: &mut Option<TurnRecord>,
    winner: Option<Uuid>,
) -> Vec<Effect> {
    let mut effects = vec![Effect::ClearTimer, Effect::ClearTurn];
    *turn_slot = None;

    for p in state.participants.iter_mut().filter(|p| p.in_combat) {
        p.in_combat = false;
        effects.push(Effect::Record(ChangeRecord::participant_combat(p.id, false)));
        effects.push(Effect::PersistParticipant(p.id));
    }

    state.in_combat = false;
    state.round = 0;
    state.status = SessionStatus::Finished;
    effects.push(Effect::Record(ChangeRecord::combat_state(
        false,
        0,
        SessionStatus::Finished,
    )));
    effects.push(Effect::PersistSession);

    if let Some(winner_id) = winner {
        if let Some(p) = state.participant(winner_id) {
            effects.push(Effect::BumpWinner(p.user_id));
        }
    }

    effects.push(Effect::Broadcast(ServerMsg::CombatEnded {
        winner_participant_id: winner,
    }));
    effects.push(Effect::Broadcast(ServerMsg::GameEnded {
        session_id: state.id,
    }));
    effects.push(Effect::SessionFinished);

    effects
}

/// The winner's participant id wrapped in Some when combat is over.
/// Combat ends when at most one human is alive and no bots are, or when
/// at most one participant of any kind is left standing.
fn win_condition(state: &SessionState) -> Option<Option<Uuid>> {
    let humans = state.living_humans();
    let bots = state.living_bots();
    if (humans <= 1 && bots == 0) || humans + bots <= 1 {
        let winner = state
            .participants
            .iter()
            .find(|p| p.alive())
            .map(|p| p.id);
        Some(winner)
    } else {
        None
    }
}

/// The participant whose turn it currently is, from the cache-resident
/// turn record - the only source readers may trust for this.
pub fn current_holder(turn: &Option<TurnRecord>) -> Option<Uuid> {
    let turn = turn.as_ref()?;
    turn.order.get(turn.index).copied()
}

/// Validate that `user_id` holds the current turn, for manual actions
pub fn ensure_holder(
    state: &SessionState,
    turn: &Option<TurnRecord>,
    user_id: Uuid,
) -> Result<Uuid, SessionError> {
    let holder = current_holder(turn).ok_or(SessionError::NotInCombat)?;
    let p = state
        .participant_by_user(user_id)
        .ok_or(SessionError::ParticipantNotFound)?;
    if p.dead {
        return Err(SessionError::Dead);
    }
    if p.id != holder {
        return Err(SessionError::NotYourTurn);
    }
    Ok(holder)
}

fn arm_timer(state: &SessionState, holder: Uuid, round: u32, effects: &mut Vec<Effect>) {
    let now = unix_millis();
    let timer = TurnTimer {
        participant_id: holder,
        started_at: now,
        deadline: now + state.turn_seconds as u64 * 1000,
        seconds: state.turn_seconds,
    };
    let ap = state.participant(holder).map(|p| p.ap).unwrap_or(0);
    let deadline = timer.deadline;
    effects.push(Effect::ArmTimer(timer));
    effects.push(Effect::Broadcast(ServerMsg::TurnStart {
        participant_id: holder,
        round,
        ap,
        deadline,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{participant_with_stats, session_state};
    use crate::ws::protocol::Visibility;

    fn combat_session(specs: &[(&str, bool, i32, i32)]) -> (SessionState, Option<TurnRecord>, Vec<Uuid>) {
        let mut state = session_state(Visibility::Public, 8);
        state.status = SessionStatus::Playing;
        let mut ids = Vec::new();
        for (name, is_bot, sequence, luck) in specs {
            let p = participant_with_stats(name, *is_bot, *sequence, *luck);
            ids.push(p.id);
            state.participants.push(p);
        }
        let mut turn = None;
        begin_combat(&mut state, &mut turn);
        (state, turn, ids)
    }

    fn finished(effects: &[Effect]) -> bool {
        effects.iter().any(|e| matches!(e, Effect::SessionFinished))
    }

    fn winner_of(effects: &[Effect]) -> Option<Uuid> {
        effects.iter().find_map(|e| match e {
            Effect::Broadcast(ServerMsg::CombatEnded {
                winner_participant_id,
            }) => *winner_participant_id,
            _ => None,
        })
    }

    #[test]
    fn tiebreak_order_and_rotation() {
        // A(seq 12), B(seq 10, luck 4), C(seq 10, luck 6): expect A, C, B
        let (mut state, mut turn, ids) = combat_session(&[
            ("a", false, 12, 2),
            ("b", false, 10, 4),
            ("c", false, 10, 6),
        ]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let record = turn.clone().unwrap();
        assert_eq!(record.order, vec![a, c, b]);
        assert_eq!(current_holder(&turn), Some(a));

        advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
        assert_eq!(current_holder(&turn), Some(c));
        advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
        assert_eq!(current_holder(&turn), Some(b));

        // Spend some AP, then wrap: round 2 and AP back to max for all
        state.participant_mut(a).unwrap().ap = 0;
        let effects = advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
        assert_eq!(current_holder(&turn), Some(a));
        assert_eq!(turn.as_ref().unwrap().round, 2);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Broadcast(ServerMsg::NewRound { round: 2 }))));
        let p = state.participant(a).unwrap();
        assert_eq!(p.ap, p.max_ap);
    }

    #[test]
    fn n_advances_return_to_holder_with_round_incremented() {
        let (mut state, mut turn, _) = combat_session(&[
            ("a", false, 12, 2),
            ("b", false, 10, 4),
            ("c", false, 10, 6),
            ("d", false, 9, 1),
        ]);
        let start_holder = current_holder(&turn).unwrap();
        let start_round = turn.as_ref().unwrap().round;

        for _ in 0..4 {
            advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
        }

        assert_eq!(current_holder(&turn), Some(start_holder));
        assert_eq!(turn.as_ref().unwrap().round, start_round + 1);
    }

    #[test]
    fn dead_participants_are_skipped_and_pruned_at_rollover() {
        let (mut state, mut turn, ids) = combat_session(&[
            ("a", false, 12, 2),
            ("b", false, 10, 4),
            ("c", false, 10, 6),
        ]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        // Order is A, C, B. C dies mid-round while A holds the turn.
        state.participant_mut(c).unwrap().dead = true;

        advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
        assert_eq!(current_holder(&turn), Some(b));
        // Mid-round the order still transiently contains the dead entry
        assert_eq!(turn.as_ref().unwrap().order.len(), 3);

        advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
        assert_eq!(current_holder(&turn), Some(a));
        // After rollover the dead entry is gone
        assert_eq!(turn.as_ref().unwrap().order, vec![a, b]);
    }

    #[test]
    fn win_requires_zero_living_bots() {
        let (mut state, mut turn, ids) = combat_session(&[
            ("a", false, 12, 2),
            ("b", false, 10, 4),
            ("bot", true, 8, 1),
        ]);
        let (a, b, bot) = (ids[0], ids[1], ids[2]);

        // One human dies; a bot still lives, so wrapping must not end combat
        state.participant_mut(b).unwrap().dead = true;
        let mut ended = false;
        for _ in 0..3 {
            let effects = advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
            ended = ended || finished(&effects);
        }
        assert!(!ended);
        assert!(state.in_combat);

        // The bot dies too; the next rollover ends combat, human wins
        state.participant_mut(bot).unwrap().dead = true;
        let mut winner = None;
        for _ in 0..3 {
            let effects = advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
            if finished(&effects) {
                winner = winner_of(&effects);
                break;
            }
        }
        assert_eq!(winner, Some(a));
        assert!(!state.in_combat);
        assert_eq!(state.status, SessionStatus::Finished);
        assert!(turn.is_none());
    }

    #[test]
    fn sole_surviving_bot_ends_combat() {
        let (mut state, mut turn, ids) =
            combat_session(&[("a", false, 12, 2), ("bot", true, 8, 1)]);
        state.participant_mut(ids[0]).unwrap().dead = true;

        let mut winner = None;
        for _ in 0..3 {
            let effects = advance_turn(&mut state, &mut turn, TurnEndReason::Manual);
            if finished(&effects) {
                winner = winner_of(&effects);
                break;
            }
        }
        assert_eq!(winner, Some(ids[1]));
    }

    #[test]
    fn non_holder_cannot_end_turn() {
        let (state, turn, _) = combat_session(&[
            ("a", false, 12, 2),
            ("b", false, 10, 4),
        ]);
        let b_user = state.participants[1].user_id;

        let before = turn.clone().unwrap();
        let err = ensure_holder(&state, &turn, b_user).unwrap_err();
        assert!(matches!(err, SessionError::NotYourTurn));
        assert_eq!(turn.unwrap(), before);
    }

    #[test]
    fn advance_without_turn_record_is_a_noop() {
        let mut state = session_state(Visibility::Public, 4);
        state.status = SessionStatus::Playing;
        let mut turn = None;
        // The losing trigger of a manual-end/timeout race lands here
        let effects = advance_turn(&mut state, &mut turn, TurnEndReason::Timeout);
        assert!(effects.is_empty());
    }

    #[test]
    fn exhausted_lap_ends_combat_with_no_winner() {
        let (mut state, mut turn, ids) =
            combat_session(&[("a", false, 12, 2), ("b", false, 10, 4)]);
        // Everyone dies mid-round; the defensive lap scan must terminate
        for id in &ids {
            state.participant_mut(*id).unwrap().dead = true;
        }
        let effects = advance_turn(&mut state, &mut turn, TurnEndReason::Timeout);
        assert!(finished(&effects));
        assert_eq!(winner_of(&effects), None);
    }

    #[test]
    fn begin_combat_arms_timer_and_resets_ap() {
        let (state, turn, ids) = combat_session(&[("a", false, 12, 2), ("b", false, 10, 4)]);
        assert!(state.in_combat);
        assert_eq!(state.round, 1);
        assert_eq!(current_holder(&turn), Some(ids[0]));
        for p in &state.participants {
            assert_eq!(p.ap, p.max_ap);
            assert!(p.in_combat);
        }
    }
}
