//! Combat actions: movement, attacks, items, interaction.
//!
//! The numbers here are deliberately plain - balance is not this crate's
//! concern - but hit probability and expected damage are exposed because
//! the bot combat policy scores candidate actions with them.

use rand::Rng;
use uuid::Uuid;

use crate::cache::TurnRecord;
use crate::session::error::SessionError;
use crate::session::state::{Participant, SessionState};
use crate::sync::ChangeRecord;
use crate::ws::protocol::{Facing, SessionStatus};

use super::turns::ensure_holder;
use super::Effect;

pub const MOVE_AP_PER_TILE: i32 = 1;
pub const ATTACK_AP_COST: i32 = 3;
pub const ITEM_AP_COST: i32 = 2;
pub const INTERACT_AP_COST: i32 = 1;
pub const ATTACK_RANGE_TILES: i32 = 6;
pub const MEDKIT_HEAL: i32 = 12;

/// Tile distance on the grid (diagonal steps count as one)
pub fn tile_distance(ax: i32, ay: i32, bx: i32, by: i32) -> i32 {
    (ax - bx).abs().max((ay - by).abs())
}

/// Chance for `attacker` to hit `target` at `distance` tiles
pub fn hit_chance(attacker: &Participant, target: &Participant, distance: i32) -> f64 {
    let base = 0.72 + (attacker.stats.agility - target.stats.agility) as f64 * 0.02
        - distance as f64 * 0.04;
    base.clamp(0.05, 0.95)
}

/// Mean damage of a landed hit, for action scoring
pub fn expected_damage(attacker: &Participant) -> f64 {
    attacker.stats.strength as f64 + 3.5
}

fn roll_damage<R: Rng>(attacker: &Participant, rng: &mut R) -> i32 {
    attacker.stats.strength + rng.gen_range(1..=6)
}

fn ensure_playing(state: &SessionState) -> Result<(), SessionError> {
    if state.status != SessionStatus::Playing {
        return Err(SessionError::Validation("session is not in play".into()));
    }
    Ok(())
}

fn spend_ap(p: &mut Participant, cost: i32, effects: &mut Vec<Effect>) -> Result<(), SessionError> {
    if p.ap < cost {
        return Err(SessionError::NotEnoughAp);
    }
    p.ap -= cost;
    effects.push(Effect::Record(ChangeRecord::ap(p.id, p.ap)));
    Ok(())
}

/// Move to a tile. Inside combat this is turn-gated and costs AP per
/// tile; outside combat movement is free-form.
pub fn handle_move(
    state: &mut SessionState,
    turn: &Option<TurnRecord>,
    user_id: Uuid,
    x: i32,
    y: i32,
    facing: Facing,
) -> Result<Vec<Effect>, SessionError> {
    ensure_playing(state)?;
    let mut effects = Vec::new();

    let actor_id = {
        let p = state
            .participant_by_user(user_id)
            .ok_or(SessionError::ParticipantNotFound)?;
        if p.dead {
            return Err(SessionError::Dead);
        }
        p.id
    };

    let in_combat = state.in_combat;
    if in_combat {
        ensure_holder(state, turn, user_id)?;
    }

    let p = state.participant_mut(actor_id).expect("actor exists");
    let distance = tile_distance(p.x, p.y, x, y);
    if distance == 0 && facing == p.facing {
        return Err(SessionError::Validation("no movement".into()));
    }

    if in_combat {
        spend_ap(p, distance * MOVE_AP_PER_TILE, &mut effects)?;
    }

    p.x = x;
    p.y = y;
    p.facing = facing;
    effects.push(Effect::Record(ChangeRecord::position(
        actor_id,
        x,
        y,
        p.elevation,
        facing,
    )));
    effects.push(Effect::PersistParticipant(actor_id));
    Ok(effects)
}

/// Attack another participant. Combat-only, turn-gated, range-checked.
pub fn handle_attack<R: Rng>(
    state: &mut SessionState,
    turn: &Option<TurnRecord>,
    user_id: Uuid,
    target_id: Uuid,
    rng: &mut R,
) -> Result<Vec<Effect>, SessionError> {
    ensure_playing(state)?;
    if !state.in_combat {
        return Err(SessionError::NotInCombat);
    }
    let attacker_id = ensure_holder(state, turn, user_id)?;
    if attacker_id == target_id {
        return Err(SessionError::Validation("cannot attack yourself".into()));
    }

    let (ax, ay) = {
        let a = state.participant(attacker_id).expect("holder exists");
        (a.x, a.y)
    };
    let (hit, damage) = {
        let target = state
            .participant(target_id)
            .ok_or(SessionError::ParticipantNotFound)?;
        if target.dead {
            return Err(SessionError::Validation("target is dead".into()));
        }
        let distance = tile_distance(ax, ay, target.x, target.y);
        if distance > ATTACK_RANGE_TILES {
            return Err(SessionError::OutOfRange);
        }
        let attacker = state.participant(attacker_id).expect("holder exists");
        let chance = hit_chance(attacker, target, distance);
        let hit = rng.gen_bool(chance);
        (hit, if hit { roll_damage(attacker, rng) } else { 0 })
    };

    let mut effects = Vec::new();
    {
        let attacker = state.participant_mut(attacker_id).expect("holder exists");
        spend_ap(attacker, ATTACK_AP_COST, &mut effects)?;
    }
    effects.push(Effect::PersistParticipant(attacker_id));

    if hit {
        let target = state.participant_mut(target_id).expect("checked above");
        target.hp = (target.hp - damage).max(0);
        effects.push(Effect::Record(ChangeRecord::health(target_id, target.hp)));
        if target.hp == 0 {
            target.dead = true;
            effects.push(Effect::Record(ChangeRecord::death(target_id)));
        }
        effects.push(Effect::PersistParticipant(target_id));
    }

    Ok(effects)
}

/// Use an item on yourself or a target. The only carried item effect is
/// the medkit heal.
pub fn handle_use_item(
    state: &mut SessionState,
    turn: &Option<TurnRecord>,
    user_id: Uuid,
    item_id: &str,
    target_id: Option<Uuid>,
) -> Result<Vec<Effect>, SessionError> {
    ensure_playing(state)?;
    if item_id != "medkit" {
        return Err(SessionError::Validation(format!("unknown item: {item_id}")));
    }

    let actor_id = {
        let p = state
            .participant_by_user(user_id)
            .ok_or(SessionError::ParticipantNotFound)?;
        if p.dead {
            return Err(SessionError::Dead);
        }
        p.id
    };

    let mut effects = Vec::new();
    if state.in_combat {
        ensure_holder(state, turn, user_id)?;
        let actor = state.participant_mut(actor_id).expect("actor exists");
        spend_ap(actor, ITEM_AP_COST, &mut effects)?;
        effects.push(Effect::PersistParticipant(actor_id));
    }

    let target_id = target_id.unwrap_or(actor_id);
    let target = state
        .participant_mut(target_id)
        .ok_or(SessionError::ParticipantNotFound)?;
    if target.dead {
        return Err(SessionError::Validation("target is dead".into()));
    }
    target.hp = (target.hp + MEDKIT_HEAL).min(target.max_hp);
    effects.push(Effect::Record(ChangeRecord::health(target_id, target.hp)));
    effects.push(Effect::PersistParticipant(target_id));
    Ok(effects)
}

/// Interact with a map object. The world model behind objects lives
/// client-side; the server only gates and logs the AP spend.
pub fn handle_interact(
    state: &mut SessionState,
    turn: &Option<TurnRecord>,
    user_id: Uuid,
    object_id: &str,
) -> Result<Vec<Effect>, SessionError> {
    ensure_playing(state)?;
    if object_id.is_empty() {
        return Err(SessionError::Validation("missing object id".into()));
    }

    let actor_id = {
        let p = state
            .participant_by_user(user_id)
            .ok_or(SessionError::ParticipantNotFound)?;
        if p.dead {
            return Err(SessionError::Dead);
        }
        p.id
    };

    let mut effects = Vec::new();
    if state.in_combat {
        ensure_holder(state, turn, user_id)?;
        let actor = state.participant_mut(actor_id).expect("actor exists");
        spend_ap(actor, INTERACT_AP_COST, &mut effects)?;
        effects.push(Effect::PersistParticipant(actor_id));
    }
    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::turns::begin_combat;
    use crate::testutil::{participant_with_stats, session_state};
    use crate::ws::protocol::Visibility;
    use rand::rngs::mock::StepRng;

    fn playing_session() -> (SessionState, Option<TurnRecord>, Uuid, Uuid) {
        let mut state = session_state(Visibility::Public, 4);
        state.status = SessionStatus::Playing;
        let a = participant_with_stats("a", false, 12, 2);
        let b = participant_with_stats("b", false, 10, 4);
        let (a_id, b_id) = (a.id, b.id);
        state.participants.push(a);
        state.participants.push(b);
        let mut turn = None;
        begin_combat(&mut state, &mut turn);
        (state, turn, a_id, b_id)
    }

    #[test]
    fn move_costs_ap_per_tile_in_combat() {
        let (mut state, turn, a_id, _) = playing_session();
        let user = state.participant(a_id).unwrap().user_id;
        let start_ap = state.participant(a_id).unwrap().ap;

        handle_move(&mut state, &turn, user, 3, 2, Facing::East).unwrap();
        let p = state.participant(a_id).unwrap();
        assert_eq!((p.x, p.y), (3, 2));
        assert_eq!(p.ap, start_ap - 3);
    }

    #[test]
    fn move_rejects_when_ap_exhausted() {
        let (mut state, turn, a_id, _) = playing_session();
        let user = state.participant(a_id).unwrap().user_id;
        state.participant_mut(a_id).unwrap().ap = 1;

        let err = handle_move(&mut state, &turn, user, 5, 5, Facing::East).unwrap_err();
        assert!(matches!(err, SessionError::NotEnoughAp));
        // Rejections never mutate state
        assert_eq!(state.participant(a_id).unwrap().x, 0);
    }

    #[test]
    fn attack_by_non_holder_is_rejected() {
        let (mut state, turn, a_id, b_id) = playing_session();
        let b_user = state.participant(b_id).unwrap().user_id;
        let mut rng = StepRng::new(0, 0);

        let err = handle_attack(&mut state, &turn, b_user, a_id, &mut rng).unwrap_err();
        assert!(matches!(err, SessionError::NotYourTurn));
    }

    #[test]
    fn attack_out_of_range_is_rejected() {
        let (mut state, turn, a_id, b_id) = playing_session();
        let a_user = state.participant(a_id).unwrap().user_id;
        state.participant_mut(b_id).unwrap().x = ATTACK_RANGE_TILES + 5;
        let mut rng = StepRng::new(0, 0);

        let err = handle_attack(&mut state, &turn, a_user, b_id, &mut rng).unwrap_err();
        assert!(matches!(err, SessionError::OutOfRange));
    }

    #[test]
    fn lethal_hit_marks_target_dead() {
        let (mut state, turn, a_id, b_id) = playing_session();
        let a_user = state.participant(a_id).unwrap().user_id;
        state.participant_mut(b_id).unwrap().hp = 1;
        // StepRng yields the low end of every range: a guaranteed hit
        let mut rng = StepRng::new(0, 0);

        let effects = handle_attack(&mut state, &turn, a_user, b_id, &mut rng).unwrap();
        let target = state.participant(b_id).unwrap();
        assert!(target.dead);
        assert_eq!(target.hp, 0);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Record(c) if c.kind == crate::sync::ChangeKind::Death)));
    }

    #[test]
    fn medkit_heals_up_to_max() {
        let (mut state, turn, a_id, _) = playing_session();
        let user = state.participant(a_id).unwrap().user_id;
        let max_hp = state.participant(a_id).unwrap().max_hp;
        state.participant_mut(a_id).unwrap().hp = max_hp - 4;

        handle_use_item(&mut state, &turn, user, "medkit", None).unwrap();
        assert_eq!(state.participant(a_id).unwrap().hp, max_hp);
    }

    #[test]
    fn unknown_item_is_a_validation_error() {
        let (mut state, turn, a_id, _) = playing_session();
        let user = state.participant(a_id).unwrap().user_id;
        let err = handle_use_item(&mut state, &turn, user, "rocket", None).unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }
}
