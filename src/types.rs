use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Probability region treated as "effectively certain": [0, 0.05] ∪ [0.95, 1].
pub const DETERMINISTIC_ZONE_LOW: f64 = 0.05;
pub const DETERMINISTIC_ZONE_HIGH: f64 = 0.95;

/// Allowed slack on yes + no ≈ 1.
pub const PROB_SUM_TOLERANCE: f64 = 0.01;

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// One binary market under a parent event. `id` is the composite
/// `eventId:marketId`, unique venue-wide; sibling markets share `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub event_id: String,
    pub event_title: String,
    pub event_url: String,
    pub question: String,
    pub category: String,
    pub yes_prob: f64,
    pub no_prob: f64,
    pub volume_24hr: f64,
    pub volume_1wk: f64,
    pub volume_1mo: f64,
    pub liquidity: f64,
    pub active: bool,
    /// Unix seconds. Preserved across upserts.
    pub created_at: u64,
    /// Unix seconds. Bumped on every upsert.
    pub last_updated: u64,
}

/// Builds the composite id `eventId:marketId`.
pub fn composite_id(event_id: &str, market_id: &str) -> String {
    format!("{event_id}:{market_id}")
}

impl Market {
    /// Boundary validation, applied where the value enters the store.
    pub fn validate(&self, now: u64) -> crate::error::Result<()> {
        if self.id.is_empty() || self.event_id.is_empty() {
            return Err(crate::error::AppError::Validation(
                "market id and event id must be non-empty".to_string(),
            ));
        }
        validate_prob_pair(self.yes_prob, self.no_prob)?;
        if self.created_at > self.last_updated || self.last_updated > now {
            return Err(crate::error::AppError::Validation(format!(
                "market {} has non-causal timestamps (created_at={}, last_updated={}, now={})",
                self.id, self.created_at, self.last_updated, now,
            )));
        }
        Ok(())
    }
}

fn validate_prob_pair(yes: f64, no: f64) -> crate::error::Result<()> {
    if !(0.0..=1.0).contains(&yes) || !(0.0..=1.0).contains(&no) {
        return Err(crate::error::AppError::Validation(format!(
            "probabilities out of [0,1]: yes={yes}, no={no}"
        )));
    }
    if (yes + no - 1.0).abs() > PROB_SUM_TOLERANCE {
        return Err(crate::error::AppError::Validation(format!(
            "yes+no departs from 1 beyond tolerance: yes={yes}, no={no}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One probability observation for a market, stamped with the *tick time* of
/// the cycle that produced it (never the wall clock at processing time), so
/// snapshot ages stay integer multiples of the poll interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    /// Composite `eventId:marketId` of the parent market.
    pub market_id: String,
    pub yes_prob: f64,
    pub no_prob: f64,
    /// Unix seconds, tick time.
    pub timestamp: u64,
    /// Where the observation came from, e.g. "gamma".
    pub source: String,
}

impl Snapshot {
    pub fn validate(&self, now: u64) -> crate::error::Result<()> {
        if self.market_id.is_empty() {
            return Err(crate::error::AppError::Validation(
                "snapshot market_id must be non-empty".to_string(),
            ));
        }
        validate_prob_pair(self.yes_prob, self.no_prob)?;
        if self.timestamp > now {
            return Err(crate::error::AppError::Validation(format!(
                "snapshot for {} has future timestamp {} (now={})",
                self.market_id, self.timestamp, now,
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn from_delta(delta: f64) -> Self {
        if delta >= 0.0 {
            Direction::Increase
        } else {
            Direction::Decrease
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Direction::Increase => "↑",
            Direction::Decrease => "↓",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Increase => write!(f, "increase"),
            Direction::Decrease => write!(f, "decrease"),
        }
    }
}

/// A detected net probability move over one detection window. Produced fresh
/// each cycle and consumed by the ranker; never persisted.
#[derive(Debug, Clone)]
pub struct Change {
    pub id: u64,
    pub market_id: String,
    pub event_id: String,
    pub event_title: String,
    pub event_url: String,
    pub question: String,
    pub magnitude: f64,
    pub direction: Direction,
    pub old_prob: f64,
    pub new_prob: f64,
    pub window: Duration,
    /// Unix seconds.
    pub detected_at: u64,
    /// Composite score, filled in by the scoring stage.
    pub signal_score: Option<f64>,
}

/// True if `p` sits in the deterministic zone.
pub fn in_deterministic_zone(p: f64) -> bool {
    p <= DETERMINISTIC_ZONE_LOW || p >= DETERMINISTIC_ZONE_HIGH
}

/// True if this transition first crosses into the deterministic zone.
pub fn is_confirmation_entry(old_prob: f64, new_prob: f64) -> bool {
    in_deterministic_zone(new_prob) && !in_deterministic_zone(old_prob)
}

// ---------------------------------------------------------------------------
// EventGroup
// ---------------------------------------------------------------------------

/// Sibling changes of one parent event, collapsed into a single top-K slot.
/// `changes` is ordered descending by score; `best_score` is the max.
#[derive(Debug, Clone)]
pub struct EventGroup {
    pub event_id: String,
    pub event_title: String,
    pub event_url: String,
    pub best_score: f64,
    pub changes: Vec<Change>,
}

// ---------------------------------------------------------------------------
// NotifiedRecord
// ---------------------------------------------------------------------------

/// What we last told the operator about a market. One entry per market id;
/// carries no TTL — the cooldown window is supplied at query time.
#[derive(Debug, Clone, Copy)]
pub struct NotifiedRecord {
    pub direction: Direction,
    pub new_prob: f64,
    /// Unix seconds of the successful dispatch.
    pub sent_at: u64,
}
