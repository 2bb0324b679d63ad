use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::types::{composite_id, Market, Snapshot};

/// Current on-disk layout version.
pub const STATE_VERSION: u32 = 2;

/// Markets and snapshots as exchanged between the store and the state file.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub markets: Vec<Market>,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Serialize, Deserialize)]
struct StateFileV2 {
    version: u32,
    markets: Vec<Market>,
    snapshots: Vec<Snapshot>,
}

/// v1 layout: one market per event, keyed by the bare event id, with the
/// venue market id in a separate field.
#[derive(Deserialize)]
struct StateFileV1 {
    #[serde(default)]
    #[allow(dead_code)]
    version: u32,
    markets: Vec<V1Market>,
    #[serde(default)]
    snapshots: Vec<V1Snapshot>,
}

#[derive(Deserialize)]
struct V1Market {
    /// Bare event id.
    id: String,
    /// Venue market id, combined into the composite on migration.
    market_id: String,
    event_title: String,
    event_url: String,
    question: String,
    category: String,
    yes_prob: f64,
    no_prob: f64,
    #[serde(default)]
    volume_24hr: f64,
    #[serde(default)]
    volume_1wk: f64,
    #[serde(default)]
    volume_1mo: f64,
    #[serde(default)]
    liquidity: f64,
    #[serde(default = "default_true")]
    active: bool,
    created_at: u64,
    last_updated: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct V1Snapshot {
    id: u64,
    /// Bare event id of the parent market.
    market_id: String,
    yes_prob: f64,
    no_prob: f64,
    timestamp: u64,
    #[serde(default)]
    source: String,
}

/// JSON state file with atomic writes: serialize to a temp file in the same
/// directory, fsync, rename over the target. Stale temp files are removed on
/// load.
pub struct StatePersister {
    path: PathBuf,
}

impl StatePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    }

    /// Read and migrate the state file. `Ok(None)` when no file exists;
    /// `CorruptState` when one exists but cannot be understood (the caller
    /// decides to start empty and leaves the file in place).
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let tmp = self.tmp_path();
        if tmp.exists() {
            warn!("removing stale temp state file {}", tmp.display());
            let _ = fs::remove_file(&tmp);
        }
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| AppError::CorruptState(format!("not valid JSON: {e}")))?;
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(1);

        match version {
            2 => {
                let file: StateFileV2 = serde_json::from_value(value)
                    .map_err(|e| AppError::CorruptState(format!("bad v2 layout: {e}")))?;
                Ok(Some(PersistedState {
                    markets: file.markets,
                    snapshots: file.snapshots,
                }))
            }
            1 => {
                let file: StateFileV1 = serde_json::from_value(value)
                    .map_err(|e| AppError::CorruptState(format!("bad v1 layout: {e}")))?;
                let migrated = migrate_v1(file);
                info!(
                    markets = migrated.markets.len(),
                    "migrated state file {} from v1 to v2",
                    self.path.display(),
                );
                Ok(Some(migrated))
            }
            v => Err(AppError::CorruptState(format!("unknown state version {v}"))),
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let file = StateFileV2 {
            version: STATE_VERSION,
            markets: state.markets.clone(),
            snapshots: state.snapshots.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let tmp = self.tmp_path();
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Rewrite bare event ids to composite `eventId:marketId`, and every snapshot
/// parent reference along with them.
fn migrate_v1(file: StateFileV1) -> PersistedState {
    let mut id_map: HashMap<String, String> = HashMap::new();
    let markets: Vec<Market> = file
        .markets
        .into_iter()
        .map(|m| {
            let new_id = composite_id(&m.id, &m.market_id);
            id_map.insert(m.id.clone(), new_id.clone());
            Market {
                id: new_id,
                event_id: m.id,
                event_title: m.event_title,
                event_url: m.event_url,
                question: m.question,
                category: m.category,
                yes_prob: m.yes_prob,
                no_prob: m.no_prob,
                volume_24hr: m.volume_24hr,
                volume_1wk: m.volume_1wk,
                volume_1mo: m.volume_1mo,
                liquidity: m.liquidity,
                active: m.active,
                created_at: m.created_at,
                last_updated: m.last_updated,
            }
        })
        .collect();

    let snapshots: Vec<Snapshot> = file
        .snapshots
        .into_iter()
        .filter_map(|s| {
            // Snapshots of markets missing from the v1 file have no composite
            // id to migrate to; drop them.
            let new_id = id_map.get(&s.market_id)?;
            Some(Snapshot {
                id: s.id,
                market_id: new_id.clone(),
                yes_prob: s.yes_prob,
                no_prob: s.no_prob,
                timestamp: s.timestamp,
                source: if s.source.is_empty() {
                    "gamma".to_string()
                } else {
                    s.source
                },
            })
        })
        .collect();

    PersistedState { markets, snapshots }
}
