//! Bot decision policies.
//!
//! Policies see only the public snapshot a remote client sees, so the
//! combat scoring works from estimates, not the server-side stat blocks.
//! The two behaviors sit behind one strategy trait and are swapped by
//! the bot depending on whether combat is running.

use std::collections::HashMap;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use crate::game::actions::{
    tile_distance, ATTACK_AP_COST, ATTACK_RANGE_TILES, ITEM_AP_COST, MOVE_AP_PER_TILE,
};
use crate::ws::protocol::{FullState, ParticipantPublic};

/// What a bot decided to do with its turn (or its poll tick)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotAction {
    Move { x: i32, y: i32 },
    Attack { target_id: Uuid },
    Heal,
    EndTurn,
}

/// Everything a policy may look at
pub struct PolicyView<'a> {
    pub session: &'a FullState,
    pub me: &'a ParticipantPublic,
}

impl<'a> PolicyView<'a> {
    pub fn new(session: &'a FullState, me: &'a ParticipantPublic) -> Self {
        Self { session, me }
    }

    fn living_enemies(&self) -> impl Iterator<Item = &ParticipantPublic> {
        let my_id = self.me.id;
        self.session
            .participants
            .iter()
            .filter(move |p| p.id != my_id && !p.dead)
    }
}

/// One decision interface, swappable implementations
pub trait TurnPolicy: Send {
    fn decide(&mut self, view: &PolicyView<'_>, rng: &mut ChaCha8Rng) -> BotAction;
}

/// Hit estimate from distance alone - the same guess a human player
/// makes from the visible board
fn estimate_hit(distance: i32) -> f64 {
    (0.72 - distance as f64 * 0.04).clamp(0.05, 0.95)
}

const ESTIMATED_DAMAGE: f64 = 8.5;

/// Scores attack/heal/move/end-turn candidates and picks the best, with
/// a skill-gated chance of slipping to a worse option instead.
pub struct CombatPolicy {
    /// 0.0 = timid, 1.0 = reckless
    pub aggressiveness: f64,
    /// 0.0 = random play, 1.0 = always the top-scored action
    pub skill: f64,
}

impl CombatPolicy {
    pub fn new(aggressiveness: f64, skill: f64) -> Self {
        Self {
            aggressiveness: aggressiveness.clamp(0.0, 1.0),
            skill: skill.clamp(0.0, 1.0),
        }
    }

    fn candidates(&self, view: &PolicyView<'_>) -> Vec<(BotAction, f64)> {
        let me = view.me;
        let mut out = vec![(BotAction::EndTurn, 0.05)];

        let wounded = 1.0 - hp_fraction(me);
        if me.ap >= ITEM_AP_COST && wounded > 0.2 {
            out.push((BotAction::Heal, wounded * (1.5 - self.aggressiveness)));
        }

        let mut nearest: Option<(&ParticipantPublic, i32)> = None;
        for enemy in view.living_enemies() {
            let distance = tile_distance(me.x, me.y, enemy.x, enemy.y);
            if nearest.map(|(_, d)| distance < d).unwrap_or(true) {
                nearest = Some((enemy, distance));
            }

            if distance <= ATTACK_RANGE_TILES && me.ap >= ATTACK_AP_COST {
                let hit = estimate_hit(distance);
                let kill_pressure = 1.0 - hp_fraction(enemy);
                let damage_fraction = (ESTIMATED_DAMAGE / enemy.max_hp.max(1) as f64).min(1.0);
                let score =
                    self.aggressiveness * hit * damage_fraction + kill_pressure * 0.5;
                out.push((BotAction::Attack { target_id: enemy.id }, score));
            }
        }

        // Close the gap when nothing is in range
        if let Some((enemy, distance)) = nearest {
            if distance > ATTACK_RANGE_TILES && me.ap >= MOVE_AP_PER_TILE {
                let x = me.x + (enemy.x - me.x).signum();
                let y = me.y + (enemy.y - me.y).signum();
                out.push((BotAction::Move { x, y }, 0.1 + 0.3 * self.aggressiveness));
            }
        }

        out
    }
}

impl TurnPolicy for CombatPolicy {
    fn decide(&mut self, view: &PolicyView<'_>, rng: &mut ChaCha8Rng) -> BotAction {
        let candidates = self.candidates(view);

        // Low skill sometimes takes whatever came to mind first
        if candidates.len() > 1 && rng.gen::<f64>() > self.skill {
            let idx = rng.gen_range(0..candidates.len());
            return candidates[idx].0.clone();
        }

        candidates
            .into_iter()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(action, _)| action)
            .unwrap_or(BotAction::EndTurn)
    }
}

fn hp_fraction(p: &ParticipantPublic) -> f64 {
    if p.max_hp <= 0 {
        return 0.0;
    }
    (p.hp.max(0) as f64) / (p.max_hp as f64)
}

/// Wanders toward the least-visited nearby cell, random step as the tie
/// and fallback case
pub struct ExplorationPolicy {
    visited: HashMap<(i32, i32), u32>,
}

impl ExplorationPolicy {
    pub fn new() -> Self {
        Self {
            visited: HashMap::new(),
        }
    }
}

impl Default for ExplorationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnPolicy for ExplorationPolicy {
    fn decide(&mut self, view: &PolicyView<'_>, rng: &mut ChaCha8Rng) -> BotAction {
        let me = view.me;
        *self.visited.entry((me.x, me.y)).or_insert(0) += 1;

        let steps = [(0, 1), (1, 0), (0, -1), (-1, 0)];
        let mut best: Vec<(i32, i32)> = Vec::new();
        let mut best_count = u32::MAX;
        for (dx, dy) in steps {
            let cell = (me.x + dx, me.y + dy);
            let count = self.visited.get(&cell).copied().unwrap_or(0);
            if count < best_count {
                best_count = count;
                best = vec![cell];
            } else if count == best_count {
                best.push(cell);
            }
        }

        match best.as_slice() {
            [] => {
                let (dx, dy) = steps[rng.gen_range(0..steps.len())];
                BotAction::Move {
                    x: me.x + dx,
                    y: me.y + dy,
                }
            }
            cells => {
                let (x, y) = cells[rng.gen_range(0..cells.len())];
                BotAction::Move { x, y }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::build_full_state;
    use crate::testutil::{participant, session_state};
    use crate::ws::protocol::Visibility;
    use rand::SeedableRng;

    fn view_fixture() -> FullState {
        let mut state = session_state(Visibility::Public, 4);
        let mut me = participant("bot", true);
        me.x = 0;
        me.y = 0;
        let mut weak = participant("weak", false);
        weak.x = 2;
        weak.y = 0;
        weak.hp = 5;
        let mut tough = participant("tough", false);
        tough.x = 3;
        tough.y = 0;
        state.participants.push(me);
        state.participants.push(weak);
        state.participants.push(tough);
        build_full_state(&state, None, None)
    }

    #[test]
    fn aggressive_skilled_bot_attacks_the_weak_target() {
        let full = view_fixture();
        let me = &full.participants[0];
        let weak_id = full.participants[1].id;
        let view = PolicyView::new(&full, me);

        let mut policy = CombatPolicy::new(0.9, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let action = policy.decide(&view, &mut rng);
        assert_eq!(action, BotAction::Attack { target_id: weak_id });
    }

    #[test]
    fn bot_closes_distance_when_out_of_range() {
        let mut full = view_fixture();
        for p in full.participants.iter_mut().skip(1) {
            p.x = 20;
        }
        let me = &full.participants[0];
        let view = PolicyView::new(&full, me);

        let mut policy = CombatPolicy::new(0.9, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        match policy.decide(&view, &mut rng) {
            BotAction::Move { x, .. } => assert_eq!(x, 1),
            other => panic!("expected a closing move, got {:?}", other),
        }
    }

    #[test]
    fn drained_bot_ends_its_turn() {
        let mut full = view_fixture();
        full.participants[0].ap = 0;
        let me = &full.participants[0];
        let view = PolicyView::new(&full, me);

        let mut policy = CombatPolicy::new(0.9, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(policy.decide(&view, &mut rng), BotAction::EndTurn);
    }

    #[test]
    fn exploration_prefers_unvisited_cells() {
        let full = view_fixture();
        let me = &full.participants[0];
        let view = PolicyView::new(&full, me);

        let mut policy = ExplorationPolicy::new();
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        // Mark three of the four neighbors as heavily visited
        policy.visited.insert((0, 1), 5);
        policy.visited.insert((1, 0), 5);
        policy.visited.insert((0, -1), 5);

        match policy.decide(&view, &mut rng) {
            BotAction::Move { x, y } => assert_eq!((x, y), (-1, 0)),
            other => panic!("expected a move, got {:?}", other),
        }
    }
}
