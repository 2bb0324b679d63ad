use std::collections::HashMap;

use crate::types::{Change, EventGroup};

/// Collapses sibling markets of the same parent event into one slot, then
/// keeps the `top_k` best groups.
///
/// Changes inside a group are ordered descending by composite score and
/// `best_score` is the max over them; groups are ordered descending by
/// `best_score`. Top-K applies at the group level: an event with three strong
/// sibling markets consumes exactly one slot. The output is always a list,
/// possibly empty.
pub fn group_changes(changes: Vec<Change>, top_k: usize) -> Vec<EventGroup> {
    let mut buckets: HashMap<String, Vec<Change>> = HashMap::new();
    for change in changes {
        buckets.entry(change.event_id.clone()).or_default().push(change);
    }

    let mut groups: Vec<EventGroup> = buckets
        .into_values()
        .map(|mut bucket| {
            bucket.sort_by(|a, b| {
                score_of(b)
                    .partial_cmp(&score_of(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let event_id = bucket[0].event_id.clone();
            let event_title = bucket[0].event_title.clone();
            let event_url = bucket[0].event_url.clone();
            let best_score = score_of(&bucket[0]);
            EventGroup {
                event_id,
                event_title,
                event_url,
                best_score,
                changes: bucket,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        b.best_score
            .partial_cmp(&a.best_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    groups.truncate(top_k);
    groups
}

fn score_of(change: &Change) -> f64 {
    change.signal_score.unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_secs, Direction};
    use std::collections::HashSet;
    use std::time::Duration;

    fn change(event_id: &str, market_id: &str, score: f64) -> Change {
        Change {
            id: 0,
            market_id: market_id.to_string(),
            event_id: event_id.to_string(),
            event_title: format!("{event_id} title"),
            event_url: format!("https://polymarket.com/event/{event_id}"),
            question: format!("{market_id}?"),
            magnitude: 0.08,
            direction: Direction::Increase,
            old_prob: 0.50,
            new_prob: 0.58,
            window: Duration::from_secs(3600),
            detected_at: now_secs(),
            signal_score: Some(score),
        }
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(group_changes(Vec::new(), 5).is_empty());
    }

    // Sibling markets under one event consume exactly one top-K slot.
    #[test]
    fn siblings_collapse_into_one_slot() {
        let changes = vec![
            change("btc", "btc:100k", 0.9),
            change("btc", "btc:150k", 0.7),
            change("eth", "eth:flip", 0.5),
        ];
        let groups = group_changes(changes, 2);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].event_id, "btc");
        assert_eq!(groups[0].changes.len(), 2);
        assert_eq!(groups[1].event_id, "eth");
        assert_eq!(groups[1].changes.len(), 1);
    }

    #[test]
    fn no_two_groups_share_an_event_id() {
        let changes = vec![
            change("a", "a:1", 0.3),
            change("a", "a:2", 0.2),
            change("b", "b:1", 0.4),
            change("b", "b:2", 0.1),
        ];
        let groups = group_changes(changes, 10);
        let ids: HashSet<&str> = groups.iter().map(|g| g.event_id.as_str()).collect();
        assert_eq!(ids.len(), groups.len());
    }

    #[test]
    fn groups_order_by_best_score_desc_and_respect_top_k() {
        let changes = vec![
            change("low", "low:1", 0.1),
            change("high", "high:1", 0.9),
            change("mid", "mid:1", 0.5),
        ];
        let groups = group_changes(changes, 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].event_id, "high");
        assert_eq!(groups[1].event_id, "mid");
        assert!(groups[0].best_score >= groups[1].best_score);
    }

    #[test]
    fn best_score_is_max_and_members_sorted_desc() {
        let changes = vec![
            change("ev", "ev:weak", 0.2),
            change("ev", "ev:strong", 0.8),
            change("ev", "ev:mid", 0.5),
        ];
        let groups = group_changes(changes, 5);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.best_score, 0.8);
        let scores: Vec<f64> = group.changes.iter().filter_map(|c| c.signal_score).collect();
        assert_eq!(scores, vec![0.8, 0.5, 0.2]);
    }
}
