use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::types::{in_deterministic_zone, Change, EventGroup, NotifiedRecord};

/// Per-market record of what was last notified, consulted before dispatch to
/// keep the notification stream bounded.
///
/// A market is suppressed only while all three hold: the prior notification
/// is younger than the cooldown window (the detection window is reused), it
/// had the same direction, and the current move is not a fresh crossing into
/// the ≥0.95 / ≤0.05 zone. A direction flip or a fresh zone entry always
/// escapes the cooldown.
pub struct CooldownLedger {
    records: DashMap<String, NotifiedRecord>,
}

impl CooldownLedger {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// True iff `change` should be withheld from the current dispatch.
    pub fn suppresses(&self, change: &Change, cooldown: Duration, now: u64) -> bool {
        let Some(prior) = self.records.get(&change.market_id) else {
            return false;
        };
        if now.saturating_sub(prior.sent_at) >= cooldown.as_secs() {
            return false;
        }
        if prior.direction != change.direction {
            return false;
        }
        let fresh_zone_entry =
            in_deterministic_zone(change.new_prob) && !in_deterministic_zone(prior.new_prob);
        !fresh_zone_entry
    }

    /// Remove suppressed markets from each group; drop groups left empty.
    pub fn filter_groups(
        &self,
        groups: Vec<EventGroup>,
        cooldown: Duration,
        now: u64,
    ) -> Vec<EventGroup> {
        groups
            .into_iter()
            .filter_map(|mut group| {
                group.changes.retain(|change| {
                    let suppressed = self.suppresses(change, cooldown, now);
                    if suppressed {
                        debug!(
                            market_id = %change.market_id,
                            direction = %change.direction,
                            "suppressed by cooldown"
                        );
                    }
                    !suppressed
                });
                if group.changes.is_empty() {
                    None
                } else {
                    group.best_score = group
                        .changes
                        .iter()
                        .filter_map(|c| c.signal_score)
                        .fold(0.0, f64::max);
                    Some(group)
                }
            })
            .collect()
    }

    /// Called only after the sink accepted the message, so a failed dispatch
    /// leaves the ledger untouched and the next cycle may retry.
    pub fn record_dispatch(&self, groups: &[EventGroup], now: u64) {
        for group in groups {
            for change in &group.changes {
                self.records.insert(
                    change.market_id.clone(),
                    NotifiedRecord {
                        direction: change.direction,
                        new_prob: change.new_prob,
                        sent_at: now,
                    },
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for CooldownLedger {
    fn default() -> Self {
        Self::new()
    }
}
