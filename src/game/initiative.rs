//! Initiative order computation

use uuid::Uuid;

use crate::session::state::Participant;

/// Living participants sorted descending by sequence stat, ties broken by
/// luck descending. The sort is stable and `participants` is kept in join
/// order, so remaining ties fall back to join order - turn order is
/// fairness-sensitive and must never depend on map iteration order.
pub fn initiative_order(participants: &[Participant]) -> Vec<Uuid> {
    let mut living: Vec<&Participant> = participants.iter().filter(|p| p.alive()).collect();
    living.sort_by(|a, b| {
        b.stats
            .sequence
            .cmp(&a.stats.sequence)
            .then_with(|| b.stats.luck.cmp(&a.stats.luck))
    });
    living.into_iter().map(|p| p.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::participant_with_stats;

    #[test]
    fn sequence_then_luck_then_join_order() {
        let a = participant_with_stats("a", false, 12, 2);
        let b = participant_with_stats("b", false, 10, 4);
        let c = participant_with_stats("c", false, 10, 6);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);

        // Join order: A, B, C. C outrolls B on luck.
        let order = initiative_order(&[a, b, c]);
        assert_eq!(order, vec![a_id, c_id, b_id]);
    }

    #[test]
    fn full_ties_keep_join_order() {
        let a = participant_with_stats("a", false, 10, 5);
        let b = participant_with_stats("b", false, 10, 5);
        let (a_id, b_id) = (a.id, b.id);

        let order = initiative_order(&[a, b]);
        assert_eq!(order, vec![a_id, b_id]);
    }

    #[test]
    fn dead_participants_are_excluded() {
        let a = participant_with_stats("a", false, 12, 2);
        let mut b = participant_with_stats("b", false, 10, 4);
        b.dead = true;
        let a_id = a.id;

        let order = initiative_order(&[a, b]);
        assert_eq!(order, vec![a_id]);
    }
}
