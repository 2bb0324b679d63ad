use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::store::persist::{PersistedState, StatePersister};
use crate::types::{now_secs, Change, Market, Snapshot};

struct StoreInner {
    /// composite market_id → Market
    markets: HashMap<String, Market>,
    /// composite market_id → snapshot series (insertion order, NOT chronological)
    snapshots: HashMap<String, Vec<Snapshot>>,
    /// Changes detected this cycle; cleared at the start of every cycle.
    changes: Vec<Change>,
    snapshot_seq: u64,
}

/// In-memory index of markets, their snapshot histories and the per-cycle
/// change bag, optionally backed by a JSON state file.
///
/// All access goes through one reader/writer lock: queries take the read
/// guard, mutations the write guard, so readers never observe a partial
/// write. Atomicity is per-operation only.
pub struct MarketStore {
    inner: RwLock<StoreInner>,
    max_snapshots_per_market: usize,
    max_markets: usize,
    persister: Option<StatePersister>,
}

impl MarketStore {
    pub fn new(max_snapshots_per_market: usize, max_markets: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StoreInner {
                markets: HashMap::new(),
                snapshots: HashMap::new(),
                changes: Vec::new(),
                snapshot_seq: 0,
            }),
            max_snapshots_per_market,
            max_markets,
            persister: None,
        })
    }

    pub fn with_persistence(
        max_snapshots_per_market: usize,
        max_markets: usize,
        persister: StatePersister,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StoreInner {
                markets: HashMap::new(),
                snapshots: HashMap::new(),
                changes: Vec::new(),
                snapshot_seq: 0,
            }),
            max_snapshots_per_market,
            max_markets,
            persister: Some(persister),
        })
    }

    /// Hydrate from the state file, if one is configured and present.
    /// A corrupt file is logged and left in place; the store starts empty.
    pub async fn load(&self) -> Result<()> {
        let Some(persister) = &self.persister else {
            return Ok(());
        };
        match persister.load() {
            Ok(Some(state)) => {
                let market_count = state.markets.len();
                let snapshot_count = state.snapshots.len();
                let mut inner = self.inner.write().await;
                inner.snapshot_seq = state
                    .snapshots
                    .iter()
                    .map(|s| s.id)
                    .max()
                    .map(|id| id + 1)
                    .unwrap_or(0);
                for market in state.markets {
                    inner.markets.insert(market.id.clone(), market);
                }
                for snapshot in state.snapshots {
                    // Orphans from a truncated write are dropped here rather
                    // than resurrected as dangling series.
                    if inner.markets.contains_key(&snapshot.market_id) {
                        inner
                            .snapshots
                            .entry(snapshot.market_id.clone())
                            .or_default()
                            .push(snapshot);
                    }
                }
                info!(
                    markets = market_count,
                    snapshots = snapshot_count,
                    "store hydrated from {}",
                    persister.path().display(),
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(AppError::CorruptState(msg)) => {
                warn!(
                    "state file {} unparseable, starting empty (file left for post-mortem): {msg}",
                    persister.path().display(),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write the current markets and snapshots to the state file.
    pub async fn flush(&self) -> Result<()> {
        let Some(persister) = &self.persister else {
            return Ok(());
        };
        let state = {
            let inner = self.inner.read().await;
            PersistedState {
                markets: inner.markets.values().cloned().collect(),
                snapshots: inner
                    .snapshots
                    .values()
                    .flat_map(|series| series.iter().cloned())
                    .collect(),
            }
        };
        persister.save(&state)
    }

    /// Insert or replace a market. On insert the total cap is enforced first,
    /// so the store never transiently exceeds cap + 1. Replacement is
    /// wholesale; the caller carries the original `created_at`.
    pub async fn upsert_market(&self, market: Market) -> Result<()> {
        market.validate(now_secs())?;
        let mut inner = self.inner.write().await;
        if !inner.markets.contains_key(&market.id) && inner.markets.len() >= self.max_markets {
            let excess = inner.markets.len() + 1 - self.max_markets;
            evict_oldest(&mut inner, excess);
        }
        inner.markets.insert(market.id.clone(), market);
        Ok(())
    }

    /// Append a snapshot to its market's series. Fails with `MarketNotFound`
    /// when the parent market is absent. Insertion order is not required to
    /// be chronological. The store assigns the snapshot id.
    pub async fn append_snapshot(&self, mut snapshot: Snapshot) -> Result<u64> {
        snapshot.validate(now_secs())?;
        let mut inner = self.inner.write().await;
        if !inner.markets.contains_key(&snapshot.market_id) {
            return Err(AppError::MarketNotFound(snapshot.market_id));
        }
        let id = inner.snapshot_seq;
        inner.snapshot_seq += 1;
        snapshot.id = id;
        let cap = self.max_snapshots_per_market;
        let series = inner.snapshots.entry(snapshot.market_id.clone()).or_default();
        series.push(snapshot);
        if series.len() > cap {
            trim_to_newest(series, cap);
        }
        Ok(id)
    }

    /// Snapshots of `market_id` whose timestamp is within `window` of now,
    /// ascending by timestamp. Ties are broken by snapshot id, so the order
    /// is stable regardless of insertion order. This is the canonical
    /// detector input.
    pub async fn snapshots_in_window(&self, market_id: &str, window: Duration) -> Vec<Snapshot> {
        let now = now_secs();
        let cutoff = now.saturating_sub(window.as_secs());
        let inner = self.inner.read().await;
        let Some(series) = inner.snapshots.get(market_id) else {
            return Vec::new();
        };
        let mut in_window: Vec<Snapshot> = series
            .iter()
            .filter(|s| s.timestamp >= cutoff && s.timestamp <= now)
            .cloned()
            .collect();
        in_window.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        in_window
    }

    /// Trim every series to its newest `max_snapshots_per_market` entries by
    /// timestamp — not insertion order, which matters when a backfill raced a
    /// live append.
    pub async fn rotate_snapshots(&self) {
        let cap = self.max_snapshots_per_market;
        let mut inner = self.inner.write().await;
        for series in inner.snapshots.values_mut() {
            if series.len() > cap {
                trim_to_newest(series, cap);
            }
        }
    }

    /// Enforce the total market cap, evicting oldest `last_updated` first.
    /// Each eviction cascade-deletes the market's snapshot series.
    pub async fn rotate_markets(&self) {
        let mut inner = self.inner.write().await;
        if inner.markets.len() > self.max_markets {
            let excess = inner.markets.len() - self.max_markets;
            evict_oldest(&mut inner, excess);
        }
    }

    pub async fn add_change(&self, change: Change) {
        let mut inner = self.inner.write().await;
        inner.changes.push(change);
    }

    pub async fn clear_changes(&self) {
        let mut inner = self.inner.write().await;
        inner.changes.clear();
    }

    /// The k largest changes of the current cycle by magnitude.
    pub async fn top_changes(&self, k: usize) -> Vec<Change> {
        let inner = self.inner.read().await;
        let mut changes = inner.changes.clone();
        changes.sort_by(|a, b| {
            b.magnitude
                .partial_cmp(&a.magnitude)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        changes.truncate(k);
        changes
    }

    pub async fn get_market(&self, market_id: &str) -> Option<Market> {
        self.inner.read().await.markets.get(market_id).cloned()
    }

    pub async fn market_count(&self) -> usize {
        self.inner.read().await.markets.len()
    }

    pub async fn all_market_ids(&self) -> Vec<String> {
        self.inner.read().await.markets.keys().cloned().collect()
    }

    pub async fn snapshot_count(&self, market_id: &str) -> usize {
        self.inner
            .read()
            .await
            .snapshots
            .get(market_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// Keep the newest `cap` snapshots by timestamp (id breaks ties).
fn trim_to_newest(series: &mut Vec<Snapshot>, cap: usize) {
    series.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    let excess = series.len().saturating_sub(cap);
    series.drain(..excess);
}

/// Evict `count` markets, oldest `last_updated` first, cascading to their
/// snapshot series. A dangling series is a correctness bug.
fn evict_oldest(inner: &mut StoreInner, count: usize) {
    for _ in 0..count {
        let Some(victim) = inner
            .markets
            .values()
            .min_by_key(|m| (m.last_updated, m.id.clone()))
            .map(|m| m.id.clone())
        else {
            return;
        };
        inner.markets.remove(&victim);
        inner.snapshots.remove(&victim);
        info!(market_id = %victim, "evicted market at cap (snapshots cascaded)");
    }
}
