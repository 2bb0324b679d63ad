use crate::types::{is_confirmation_entry, Change, Market};

/// Why a change was cut before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The change's market id has no Market record.
    UnknownMarket,
    /// Net move below the minimum absolute change.
    BelowMinChange,
    /// Either endpoint sits below the minimum base probability, where prices
    /// are microstructure rather than information.
    TailProbability,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::UnknownMarket => "unknown_market",
            RejectReason::BelowMinChange => "below_min_change",
            RejectReason::TailProbability => "tail_probability",
        };
        write!(f, "{s}")
    }
}

/// Pre-score filters. Returns `None` when the change is admitted to scoring.
///
/// A sub-threshold magnitude is still admitted when the move is a
/// confirmation entry — the market crossed into the ≥0.95 / ≤0.05 zone on
/// this change. Small moves at tail probabilities inflate KL through the log
/// terms, which is exactly the noise the magnitude floor exists to cut; the
/// zone entry is the one operationally meaningful exception.
pub fn pre_filter(
    change: &Change,
    market: Option<&Market>,
    min_abs_change: f64,
    min_base_prob: f64,
) -> Option<RejectReason> {
    if market.is_none() {
        return Some(RejectReason::UnknownMarket);
    }
    if change.magnitude < min_abs_change
        && !is_confirmation_entry(change.old_prob, change.new_prob)
    {
        return Some(RejectReason::BelowMinChange);
    }
    if change.old_prob.min(change.new_prob) < min_base_prob {
        return Some(RejectReason::TailProbability);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_secs, Direction};
    use std::time::Duration;

    fn change(old: f64, new: f64) -> Change {
        Change {
            id: 0,
            market_id: "ev:m1".to_string(),
            event_id: "ev".to_string(),
            event_title: "Event".to_string(),
            event_url: "https://polymarket.com/event/e".to_string(),
            question: "Q?".to_string(),
            magnitude: (new - old).abs(),
            direction: Direction::from_delta(new - old),
            old_prob: old,
            new_prob: new,
            window: Duration::from_secs(3600),
            detected_at: now_secs(),
            signal_score: None,
        }
    }

    fn market() -> Market {
        let now = now_secs();
        Market {
            id: "ev:m1".to_string(),
            event_id: "ev".to_string(),
            event_title: "Event".to_string(),
            event_url: "https://polymarket.com/event/e".to_string(),
            question: "Q?".to_string(),
            category: "crypto".to_string(),
            yes_prob: 0.5,
            no_prob: 0.5,
            volume_24hr: 1000.0,
            volume_1wk: 0.0,
            volume_1mo: 0.0,
            liquidity: 100.0,
            active: true,
            created_at: now - 100,
            last_updated: now,
        }
    }

    #[test]
    fn large_mid_range_move_is_admitted() {
        let m = market();
        assert_eq!(pre_filter(&change(0.50, 0.58), Some(&m), 0.03, 0.05), None);
    }

    #[test]
    fn small_move_is_rejected() {
        let m = market();
        assert_eq!(
            pre_filter(&change(0.50, 0.51), Some(&m), 0.03, 0.05),
            Some(RejectReason::BelowMinChange),
        );
    }

    #[test]
    fn unknown_market_is_rejected() {
        assert_eq!(
            pre_filter(&change(0.50, 0.58), None, 0.03, 0.05),
            Some(RejectReason::UnknownMarket),
        );
    }

    #[test]
    fn tail_probability_is_rejected() {
        let m = market();
        // 1pp move at p=0.02 is KL-seductive noise
        assert_eq!(
            pre_filter(&change(0.02, 0.06), Some(&m), 0.03, 0.05),
            Some(RejectReason::TailProbability),
        );
    }

    // Confirmation entry bypasses the magnitude floor, but only a fresh
    // crossing does.
    #[test]
    fn confirmation_entry_bypasses_min_abs_change() {
        let m = market();
        // 0.93 → 0.96: magnitude 0.03 below the 0.10 floor, but it crosses
        // into the deterministic zone.
        assert_eq!(pre_filter(&change(0.93, 0.96), Some(&m), 0.10, 0.05), None);
        // 0.96 → 0.97: already in the zone, no bypass.
        assert_eq!(
            pre_filter(&change(0.96, 0.97), Some(&m), 0.10, 0.05),
            Some(RejectReason::BelowMinChange),
        );
    }
}
