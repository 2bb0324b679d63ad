use std::time::Duration;

use crate::types::{Change, Direction, Market, Snapshot};

/// Floating-point floor below which a net move is not a move.
pub const MIN_DETECTABLE_DELTA: f64 = 0.001;

/// Compares the oldest and newest snapshot inside the detection window and
/// produces a `Change` when the net yes-probability delta clears the floor.
///
/// `window_snapshots` must be the ascending-by-timestamp series returned by
/// the store's window query; the driver passes a window of
/// `(detection_intervals + 1) × poll_interval` so that a snapshot stamped N
/// intervals ago is still inside it despite per-cycle processing latency.
pub fn detect(
    market: &Market,
    window_snapshots: &[Snapshot],
    window: Duration,
    detected_at: u64,
) -> Option<Change> {
    if window_snapshots.len() < 2 {
        return None;
    }

    let oldest = window_snapshots.first()?;
    let newest = window_snapshots.last()?;
    let delta = newest.yes_prob - oldest.yes_prob;
    if delta.abs() < MIN_DETECTABLE_DELTA {
        return None;
    }

    Some(Change {
        id: 0,
        market_id: market.id.clone(),
        event_id: market.event_id.clone(),
        event_title: market.event_title.clone(),
        event_url: market.event_url.clone(),
        question: market.question.clone(),
        magnitude: delta.abs(),
        direction: Direction::from_delta(delta),
        old_prob: oldest.yes_prob,
        new_prob: newest.yes_prob,
        window,
        detected_at,
        signal_score: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MarketStore;
    use crate::types::now_secs;

    fn market(id: &str) -> Market {
        let now = now_secs();
        Market {
            id: id.to_string(),
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

    fn snapshot(market_id: &str, timestamp: u64, yes: f64) -> Snapshot {
        Snapshot {
            id: 0,
            market_id: market_id.to_string(),
            yes_prob: yes,
            no_prob: 1.0 - yes,
            timestamp,
            source: "test".to_string(),
        }
    }

    #[test]
    fn fewer_than_two_snapshots_produce_nothing() {
        let m = market("ev:m1");
        let w = Duration::from_secs(3600);
        assert!(detect(&m, &[], w, now_secs()).is_none());
        assert!(detect(&m, &[snapshot("ev:m1", now_secs(), 0.5)], w, now_secs()).is_none());
    }

    #[test]
    fn sub_floor_delta_produces_nothing() {
        let m = market("ev:m1");
        let now = now_secs();
        let snaps = [
            snapshot("ev:m1", now - 100, 0.5000),
            snapshot("ev:m1", now, 0.5005),
        ];
        assert!(detect(&m, &snaps, Duration::from_secs(3600), now).is_none());
    }

    #[test]
    fn endpoints_and_direction_come_from_oldest_and_newest() {
        let m = market("ev:m1");
        let now = now_secs();
        let snaps = [
            snapshot("ev:m1", now - 300, 0.50),
            snapshot("ev:m1", now - 200, 0.70), // intermediate excursion ignored
            snapshot("ev:m1", now - 100, 0.42),
        ];
        let change = detect(&m, &snaps, Duration::from_secs(3600), now).unwrap();
        assert_eq!(change.old_prob, 0.50);
        assert_eq!(change.new_prob, 0.42);
        assert_eq!(change.direction, Direction::Decrease);
        assert!((change.magnitude - 0.08).abs() < 1e-9);
        assert_eq!(change.window, Duration::from_secs(3600));
    }

    #[test]
    fn magnitude_matches_endpoint_delta() {
        let m = market("ev:m1");
        let now = now_secs();
        let snaps = [
            snapshot("ev:m1", now - 100, 0.31),
            snapshot("ev:m1", now, 0.44),
        ];
        let change = detect(&m, &snaps, Duration::from_secs(600), now).unwrap();
        assert!((change.magnitude - (change.new_prob - change.old_prob).abs()).abs() < 1e-3);
    }

    // The +1 in the window sizing absorbs per-cycle latency: with a 15m poll
    // and 4 detection intervals, a snapshot stamped 4 ticks (60m) ago is
    // still inside the 75m window when detection runs shortly after the tick.
    #[tokio::test]
    async fn window_plus_one_absorbs_cycle_latency() {
        let store = MarketStore::new(96, 10);
        let m = market("ev:m1");
        store.upsert_market(m.clone()).await.unwrap();

        let tick = now_secs(); // detection runs at tick + τ, τ < 15m
        store.append_snapshot(snapshot("ev:m1", tick - 3600, 0.50)).await.unwrap();
        store.append_snapshot(snapshot("ev:m1", tick, 0.58)).await.unwrap();

        let window = Duration::from_secs((4 + 1) * 900);
        let snaps = store.snapshots_in_window("ev:m1", window).await;
        assert_eq!(snaps.len(), 2, "both endpoints must be inside the window");

        let change = detect(&m, &snaps, window, tick).unwrap();
        assert_eq!(change.old_prob, 0.50);
        assert_eq!(change.new_prob, 0.58);
    }
}
