use std::sync::Arc;

use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{Config, SNAPSHOT_SOURCE};
use crate::detector::detect;
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::notify::{ChatSink, DiagnosticKind};
use crate::ranker::{group_changes, pre_filter, CooldownLedger};
use crate::scorer::score_change;
use crate::store::MarketStore;
use crate::types::{now_secs, Change, Market, Snapshot};

#[derive(Debug, Default)]
struct CycleReport {
    fetched: usize,
    upserted: usize,
    detected: usize,
    filtered: usize,
    below_bar: usize,
    groups: usize,
    dispatched: usize,
}

/// The cycle driver. Owns the store, the cooldown ledger and the chat sink,
/// and runs fetch → upsert → snapshot → detect → score → rank → cooldown →
/// dispatch → rotate on every tick. The first cycle runs synchronously on
/// startup.
pub struct Monitor {
    cfg: Config,
    store: Arc<MarketStore>,
    fetcher: Fetcher,
    sink: Arc<dyn ChatSink>,
    cooldown: CooldownLedger,
    consecutive_failures: u32,
    change_seq: u64,
}

impl Monitor {
    pub fn new(
        cfg: Config,
        store: Arc<MarketStore>,
        fetcher: Fetcher,
        sink: Arc<dyn ChatSink>,
    ) -> Self {
        Self {
            cfg,
            store,
            fetcher,
            sink,
            cooldown: CooldownLedger::new(),
            consecutive_failures: 0,
            change_seq: 0,
        }
    }

    /// Run until ctrl-c. The interval's immediate first tick gives the
    /// startup cycle; on shutdown the store is flushed before returning.
    pub async fn run(mut self) {
        let mut ticker = interval(self.cfg.monitor.poll_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        if let Err(e) = self.store.flush().await {
            error!("final store flush failed: {e}");
        }
        info!("monitor stopped");
    }

    async fn tick(&mut self) {
        let tick_time = now_secs();
        match self.run_cycle(tick_time).await {
            Ok(report) => self.note_success(report).await,
            Err(e) => self.note_failure(&e.to_string()).await,
        }
    }

    async fn note_success(&mut self, report: CycleReport) {
        if self.consecutive_failures > 0 {
            let text = format!(
                "recovered after {} failed cycle(s)",
                self.consecutive_failures,
            );
            if let Err(e) = self.sink.send_diagnostic(DiagnosticKind::Recovery, &text).await {
                warn!("recovery notice failed: {e}");
            }
            self.consecutive_failures = 0;
        }
        info!(
            fetched = report.fetched,
            upserted = report.upserted,
            detected = report.detected,
            filtered = report.filtered,
            below_bar = report.below_bar,
            groups = report.groups,
            dispatched = report.dispatched,
            notified_markets = self.cooldown.len(),
            "cycle complete",
        );
    }

    /// Only the first failure of a streak is dispatched; the rest are logged.
    async fn note_failure(&mut self, reason: &str) {
        self.consecutive_failures += 1;
        error!(streak = self.consecutive_failures, "cycle aborted: {reason}");
        if self.consecutive_failures == 1 {
            let text = format!("cycle failed: {reason}");
            if let Err(e) = self.sink.send_diagnostic(DiagnosticKind::Error, &text).await {
                warn!("failure notice failed: {e}");
            }
        }
    }

    /// One full cycle. A fetch failure aborts before any snapshot is written;
    /// everything after the fetch degrades per-item.
    async fn run_cycle(&mut self, tick_time: u64) -> Result<CycleReport> {
        let (markets, stats) = self.fetcher.fetch_markets().await?;
        info!(
            api_events = stats.api_events,
            admitted_events = stats.admitted_events,
            rejected_category = stats.rejected_category,
            rejected_volume = stats.rejected_volume,
            rejected_bad_prices = stats.rejected_bad_prices,
            qualified = stats.qualified_markets,
            "fetch complete",
        );
        self.process_markets(markets, tick_time).await
    }

    async fn process_markets(
        &mut self,
        markets: Vec<Market>,
        tick_time: u64,
    ) -> Result<CycleReport> {
        let mut report = CycleReport {
            fetched: markets.len(),
            ..CycleReport::default()
        };

        self.store.clear_changes().await;

        // Upsert, carrying the original created_at across replacements.
        let mut live: Vec<Market> = Vec::with_capacity(markets.len());
        for mut market in markets {
            if let Some(existing) = self.store.get_market(&market.id).await {
                market.created_at = existing.created_at;
            }
            match self.store.upsert_market(market.clone()).await {
                Ok(()) => {
                    report.upserted += 1;
                    live.push(market);
                }
                Err(e) => warn!(market_id = %market.id, "upsert skipped: {e}"),
            }
        }

        // Snapshot every live market, stamped with the tick time so ages stay
        // integer multiples of the poll interval.
        for market in &live {
            let snapshot = Snapshot {
                id: 0,
                market_id: market.id.clone(),
                yes_prob: market.yes_prob,
                no_prob: market.no_prob,
                timestamp: tick_time,
                source: SNAPSHOT_SOURCE.to_string(),
            };
            if let Err(e) = self.store.append_snapshot(snapshot).await {
                warn!(market_id = %market.id, "snapshot skipped: {e}");
            }
        }

        // Detect, pre-filter and score.
        let window = self.cfg.monitor.detection_window();
        let min_score = self.cfg.monitor.min_score();
        let mut admitted: Vec<Change> = Vec::new();
        for market in &live {
            let snaps = self.store.snapshots_in_window(&market.id, window).await;
            let Some(mut change) = detect(market, &snaps, window, tick_time) else {
                continue;
            };
            change.id = self.change_seq;
            self.change_seq += 1;
            report.detected += 1;

            if let Some(reason) = pre_filter(
                &change,
                Some(market),
                self.cfg.monitor.min_abs_change,
                self.cfg.monitor.min_base_prob,
            ) {
                tracing::debug!(market_id = %change.market_id, %reason, "change filtered");
                report.filtered += 1;
                self.store.add_change(change).await;
                continue;
            }

            let window_probs: Vec<f64> = snaps.iter().map(|s| s.yes_prob).collect();
            let score = score_change(
                change.old_prob,
                change.new_prob,
                market.volume_24hr,
                self.cfg.monitor.reference_volume,
                &window_probs,
            );
            change.signal_score = Some(score);
            self.store.add_change(change.clone()).await;

            if score < min_score {
                report.below_bar += 1;
                continue;
            }
            admitted.push(change);
        }

        if report.detected > 0 {
            for change in self.store.top_changes(3).await {
                info!(
                    market_id = %change.market_id,
                    magnitude = format_args!("{:.3}", change.magnitude),
                    direction = %change.direction,
                    score = change.signal_score.unwrap_or(0.0),
                    "top mover",
                );
            }
        }

        // Group siblings, keep the best K, apply the cooldown.
        let groups = group_changes(admitted, self.cfg.monitor.top_k);
        report.groups = groups.len();
        let now = now_secs();
        let groups = self.cooldown.filter_groups(groups, window, now);

        if !groups.is_empty() {
            match self.sink.send(&groups).await {
                Ok(()) => {
                    // Records are written only after the sink accepted the
                    // message; a failed dispatch retries next cycle.
                    self.cooldown.record_dispatch(&groups, now);
                    report.dispatched = groups.len();
                }
                Err(e) => error!("dispatch failed, notified records not written: {e}"),
            }
        }

        self.store.rotate_snapshots().await;
        self.store.rotate_markets().await;
        if let Err(e) = self.store.flush().await {
            error!("store flush failed: {e}");
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::types::EventGroup;

    /// Captures dispatched groups and diagnostics; optionally fails sends.
    struct RecordingSink {
        sent: Mutex<Vec<Vec<EventGroup>>>,
        diagnostics: Mutex<Vec<(DiagnosticKind, String)>>,
        fail_sends: Mutex<bool>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                diagnostics: Mutex::new(Vec::new()),
                fail_sends: Mutex::new(false),
            })
        }

        fn sent_batches(&self) -> Vec<Vec<EventGroup>> {
            self.sent.lock().unwrap().clone()
        }

        fn set_failing(&self, failing: bool) {
            *self.fail_sends.lock().unwrap() = failing;
        }
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn send(&self, groups: &[EventGroup]) -> Result<()> {
            if *self.fail_sends.lock().unwrap() {
                return Err(crate::error::AppError::Dispatch("sink down".to_string()));
            }
            self.sent.lock().unwrap().push(groups.to_vec());
            Ok(())
        }

        async fn send_diagnostic(&self, kind: DiagnosticKind, text: &str) -> Result<()> {
            self.diagnostics
                .lock()
                .unwrap()
                .push((kind, text.to_string()));
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.monitor.poll_interval_secs = 900;
        cfg.monitor.detection_intervals = 4;
        cfg.monitor.sensitivity = 0.1;
        cfg.monitor.top_k = 2;
        cfg
    }

    fn monitor_with(cfg: Config, sink: Arc<dyn ChatSink>) -> Monitor {
        let store = MarketStore::new(
            cfg.store.max_snapshots_per_market,
            cfg.store.max_markets,
        );
        let fetcher = Fetcher::new(&cfg).unwrap();
        Monitor::new(cfg, store, fetcher, sink)
    }

    fn market(event_id: &str, market_id: &str, yes: f64, volume: f64) -> Market {
        let now = now_secs();
        Market {
            id: crate::types::composite_id(event_id, market_id),
            event_id: event_id.to_string(),
            event_title: format!("{event_id} event"),
            event_url: format!("https://polymarket.com/event/{event_id}"),
            question: format!("{market_id}?"),
            category: "crypto".to_string(),
            yes_prob: yes,
            no_prob: 1.0 - yes,
            volume_24hr: volume,
            volume_1wk: 0.0,
            volume_1mo: 0.0,
            liquidity: 1000.0,
            active: true,
            created_at: now,
            last_updated: now,
        }
    }

    fn shifted(mut m: Market, yes: f64) -> Market {
        m.yes_prob = yes;
        m.no_prob = 1.0 - yes;
        m
    }

    // Two cycles 15 minutes apart: a big clean move groups siblings under one
    // event and dispatches at most top_k groups.
    #[tokio::test]
    async fn siblings_share_one_slot_and_top_k_holds() {
        let sink = RecordingSink::new();
        let mut monitor = monitor_with(test_config(), sink.clone());

        let tick1 = now_secs() - 900;
        let initial = vec![
            market("btc", "100k", 0.50, 200_000.0),
            market("btc", "150k", 0.40, 150_000.0),
            market("eth", "flip", 0.30, 120_000.0),
            market("sol", "ath", 0.60, 90_000.0),
        ];
        monitor.process_markets(initial.clone(), tick1).await.unwrap();
        assert!(sink.sent_batches().is_empty(), "no move on the first cycle");

        let tick2 = now_secs();
        let moved = vec![
            shifted(initial[0].clone(), 0.62),
            shifted(initial[1].clone(), 0.50),
            shifted(initial[2].clone(), 0.41),
            shifted(initial[3].clone(), 0.68),
        ];
        let report = monitor.process_markets(moved, tick2).await.unwrap();
        assert_eq!(report.detected, 4);

        let batches = sink.sent_batches();
        assert_eq!(batches.len(), 1);
        let groups = &batches[0];
        assert!(groups.len() <= 2, "top_k=2 must bound the groups");
        // btc's two siblings collapse into one group
        let btc = groups.iter().find(|g| g.event_id == "btc").unwrap();
        assert_eq!(btc.changes.len(), 2);
        // Groups are ordered by best score descending
        assert!(groups.windows(2).all(|g| g[0].best_score >= g[1].best_score));
    }

    // Re-running the same move within the cooldown window stays silent; the
    // direction flip escapes.
    #[tokio::test]
    async fn cooldown_suppresses_then_direction_flip_escapes() {
        let sink = RecordingSink::new();
        let mut monitor = monitor_with(test_config(), sink.clone());

        let tick1 = now_secs() - 1800;
        let m = market("btc", "100k", 0.50, 200_000.0);
        monitor.process_markets(vec![m.clone()], tick1).await.unwrap();

        let tick2 = now_secs() - 900;
        monitor
            .process_markets(vec![shifted(m.clone(), 0.62)], tick2)
            .await
            .unwrap();
        assert_eq!(sink.sent_batches().len(), 1, "first move notifies");

        // Same direction again, inside the window: suppressed.
        let tick3 = now_secs() - 450;
        monitor
            .process_markets(vec![shifted(m.clone(), 0.70)], tick3)
            .await
            .unwrap();
        assert_eq!(sink.sent_batches().len(), 1, "same-direction repeat is suppressed");

        // Direction flips: notifies despite the window.
        let tick4 = now_secs();
        monitor
            .process_markets(vec![shifted(m.clone(), 0.45)], tick4)
            .await
            .unwrap();
        assert_eq!(sink.sent_batches().len(), 2, "direction flip escapes cooldown");
    }

    // A failed dispatch must not write notified records, so the next cycle
    // retries the same notification.
    #[tokio::test]
    async fn failed_dispatch_retries_next_cycle() {
        let sink = RecordingSink::new();
        let mut monitor = monitor_with(test_config(), sink.clone());

        let m = market("btc", "100k", 0.50, 200_000.0);
        monitor
            .process_markets(vec![m.clone()], now_secs() - 1800)
            .await
            .unwrap();

        sink.set_failing(true);
        monitor
            .process_markets(vec![shifted(m.clone(), 0.62)], now_secs() - 900)
            .await
            .unwrap();
        assert!(sink.sent_batches().is_empty());

        sink.set_failing(false);
        monitor
            .process_markets(vec![shifted(m.clone(), 0.63)], now_secs())
            .await
            .unwrap();
        assert_eq!(
            sink.sent_batches().len(),
            1,
            "no record was written, so the move re-notifies once the sink is back",
        );
    }

    #[tokio::test]
    async fn sub_threshold_moves_do_not_dispatch() {
        let sink = RecordingSink::new();
        let mut monitor = monitor_with(test_config(), sink.clone());

        let m = market("btc", "100k", 0.50, 200_000.0);
        monitor
            .process_markets(vec![m.clone()], now_secs() - 900)
            .await
            .unwrap();
        let report = monitor
            .process_markets(vec![shifted(m, 0.51)], now_secs())
            .await
            .unwrap();
        assert_eq!(report.detected, 1);
        assert_eq!(report.filtered, 1);
        assert!(sink.sent_batches().is_empty());
    }

    // Failure streak: one error notice on the first failure, one recovery
    // notice on the first success after the streak, nothing in between.
    #[tokio::test]
    async fn failure_streak_notifies_once_each_way() {
        let sink = RecordingSink::new();
        let mut monitor = monitor_with(test_config(), sink.clone());

        monitor.note_failure("fetch exhausted").await;
        monitor.note_failure("fetch exhausted").await;
        monitor.note_failure("fetch exhausted").await;
        assert_eq!(monitor.consecutive_failures, 3);

        monitor.note_success(CycleReport::default()).await;
        assert_eq!(monitor.consecutive_failures, 0);
        monitor.note_success(CycleReport::default()).await;

        let diags = sink.diagnostics.lock().unwrap().clone();
        let errors = diags
            .iter()
            .filter(|(k, _)| *k == DiagnosticKind::Error)
            .count();
        let recoveries = diags
            .iter()
            .filter(|(k, _)| *k == DiagnosticKind::Recovery)
            .count();
        assert_eq!(errors, 1, "only the first failure of the streak notifies");
        assert_eq!(recoveries, 1, "only the first success after the streak notifies");
    }

    // A fetch failure aborts the cycle before any snapshot is written.
    #[tokio::test]
    async fn fetch_failure_writes_no_snapshots() {
        let sink = RecordingSink::new();
        let mut cfg = test_config();
        // Closed port: every fetch fails fast.
        cfg.gamma_api_url = "http://127.0.0.1:9".to_string();
        cfg.http.retries = 0;
        cfg.http.timeout_secs = 1;
        let store = MarketStore::new(cfg.store.max_snapshots_per_market, cfg.store.max_markets);
        let fetcher = Fetcher::new(&cfg).unwrap();
        let mut monitor = Monitor::new(cfg, store.clone(), fetcher, sink.clone());

        assert!(monitor.run_cycle(now_secs()).await.is_err());
        assert_eq!(store.market_count().await, 0);
    }
}
