//! Critical path selection.
//!
//! Orders READY cards by priority plus a dependency-fanout bonus: a card
//! that alone holds back many downstream cards outranks an equal-priority
//! card nobody waits on. The ordering is a pure function of the card set.

use std::collections::HashMap;

use ork_domain::card::Card;

pub struct CriticalPathSelector {
    fanout_factor: f64,
}

impl CriticalPathSelector {
    pub fn new(fanout_factor: f64) -> Self {
        Self { fanout_factor }
    }

    /// Order the given READY cards. `all` is the full workspace card set
    /// (used to count downstream cards blocked only on each candidate).
    ///
    /// Sort key: weight desc, then `created_at` asc, then id asc — the
    /// trailing keys make the ordering total and deterministic.
    pub fn order<'a>(&self, ready: &[&'a Card], all: &[Card]) -> Vec<&'a Card> {
        let by_id: HashMap<&str, &Card> = all.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut weighted: Vec<(f64, &Card)> = ready
            .iter()
            .map(|card| {
                let fanout = downstream_blocked_only_on(card, all, &by_id);
                let weight = card.priority.0 + self.fanout_factor * fanout as f64;
                (weight, *card)
            })
            .collect();

        weighted.sort_by(|(wa, a), (wb, b)| {
            wb.partial_cmp(wa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        weighted.into_iter().map(|(_, c)| c).collect()
    }

    /// Weight of one card (exposed for trace events).
    pub fn weight(&self, card: &Card, all: &[Card]) -> f64 {
        let by_id: HashMap<&str, &Card> = all.iter().map(|c| (c.id.as_str(), c)).collect();
        card.priority.0 + self.fanout_factor * downstream_blocked_only_on(card, all, &by_id) as f64
    }
}

/// Count non-terminal cards whose only unsatisfied dependency is `card`.
fn downstream_blocked_only_on(
    card: &Card,
    all: &[Card],
    by_id: &HashMap<&str, &Card>,
) -> usize {
    all.iter()
        .filter(|down| {
            !down.status.is_terminal()
                && down.depends_on.contains(&card.id)
                && down.depends_on.iter().all(|dep| {
                    dep == &card.id
                        || by_id
                            .get(dep.as_str())
                            .map(|d| d.status.satisfies_dependency())
                            .unwrap_or(false)
                })
        })
        .count()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use chrono::{TimeZone, Utc};
    use ork_domain::card::{CardKind, CardStatus, Priority};

    use super::*;

    fn card(id: &str, priority: f64, status: CardStatus, deps: &[&str], minute: u32) -> Card {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap();
        Card {
            id: id.into(),
            kind: CardKind::Task,
            parent_id: None,
            title: id.into(),
            status,
            role: "builder".into(),
            priority: Priority(priority),
            depends_on: deps.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            wait_reason: None,
            requirements_ref: None,
            verification_ref: None,
            metadata: HashMap::new(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn higher_priority_wins() {
        let a = card("A", 1.0, CardStatus::Ready, &[], 0);
        let b = card("B", 3.0, CardStatus::Ready, &[], 1);
        let all = vec![a.clone(), b.clone()];
        let selector = CriticalPathSelector::new(0.5);
        let order: Vec<&str> = selector
            .order(&[&a, &b], &all)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(order, vec!["B", "A"]);
    }

    #[test]
    fn fanout_breaks_priority_ties() {
        let a = card("A", 2.0, CardStatus::Ready, &[], 0);
        let b = card("B", 2.0, CardStatus::Ready, &[], 1);
        // Two downstream cards wait only on B.
        let d1 = card("D1", 2.0, CardStatus::New, &["B"], 2);
        let d2 = card("D2", 2.0, CardStatus::New, &["B"], 3);
        let all = vec![a.clone(), b.clone(), d1, d2];
        let selector = CriticalPathSelector::new(0.5);
        let order: Vec<&str> = selector
            .order(&[&a, &b], &all)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(order, vec!["B", "A"]);
        assert_eq!(selector.weight(&b, &all), 3.0);
    }

    #[test]
    fn created_at_breaks_full_ties_deterministically() {
        let a = card("A", 2.0, CardStatus::Ready, &[], 5);
        let b = card("B", 2.0, CardStatus::Ready, &[], 1);
        let all = vec![a.clone(), b.clone()];
        let selector = CriticalPathSelector::new(0.5);
        let order: Vec<&str> = selector
            .order(&[&a, &b], &all)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(order, vec!["B", "A"]);

        // Pure function: same state, same ordering, every time.
        for _ in 0..5 {
            let again: Vec<&str> = selector
                .order(&[&a, &b], &all)
                .iter()
                .map(|c| c.id.as_str())
                .collect();
            assert_eq!(again, order);
        }
    }

    #[test]
    fn downstream_with_other_unmet_deps_does_not_count() {
        let a = card("A", 2.0, CardStatus::Ready, &[], 0);
        let other = card("OTHER", 2.0, CardStatus::InProgress, &[], 1);
        // D waits on A and on OTHER (not yet terminal) — not "only on A".
        let d = card("D", 2.0, CardStatus::New, &["A", "OTHER"], 2);
        let all = vec![a.clone(), other, d];
        let selector = CriticalPathSelector::new(0.5);
        assert_eq!(selector.weight(&a, &all), 2.0);
    }

    #[test]
    fn terminal_downstream_does_not_count() {
        let a = card("A", 2.0, CardStatus::Ready, &[], 0);
        let done = card("D", 2.0, CardStatus::Done, &["A"], 1);
        let all = vec![a.clone(), done];
        let selector = CriticalPathSelector::new(0.5);
        assert_eq!(selector.weight(&a, &all), 2.0);
    }
}
