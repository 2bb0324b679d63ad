use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::types::{composite_id, now_secs, Market};

#[derive(Debug, Default)]
pub struct FetchStats {
    pub api_events: usize,
    pub rejected_inactive: usize,
    pub rejected_category: usize,
    pub rejected_volume: usize,
    pub admitted_events: usize,
    pub markets_seen: usize,
    pub rejected_no_outcomes: usize,
    pub rejected_bad_prices: usize,
    pub qualified_markets: usize,
}

/// Gamma REST client. Fetches active events ordered by 24h volume, applies
/// the category and volume filters, and flattens each surviving event into
/// its binary markets.
pub struct Fetcher {
    client: reqwest::Client,
    base_url: String,
    categories: Vec<String>,
    min_volume_24hr: f64,
    min_volume_1wk: f64,
    min_volume_1mo: f64,
    volume_filter_or: bool,
    fetch_limit: usize,
    retries: u32,
    backoff_base: Duration,
}

impl Fetcher {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.gamma_api_url.clone(),
            categories: cfg
                .filter
                .categories
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
            min_volume_24hr: cfg.filter.min_volume_24hr,
            min_volume_1wk: cfg.filter.min_volume_1wk,
            min_volume_1mo: cfg.filter.min_volume_1mo,
            volume_filter_or: cfg.filter.volume_filter_or,
            fetch_limit: cfg.filter.fetch_limit,
            retries: cfg.http.retries,
            backoff_base: Duration::from_millis(cfg.http.backoff_base_ms),
        })
    }

    /// One poll of the venue. The API is asked for 3× the target so the
    /// post-filter truncation to `fetch_limit` events still fills up after
    /// category and volume cuts.
    pub async fn fetch_markets(&self) -> Result<(Vec<Market>, FetchStats)> {
        let url = format!(
            "{}/events?active=true&closed=false&order=volume24hr&ascending=false&limit={}",
            self.base_url,
            self.fetch_limit * 3,
        );

        let events = self.get_with_retry(&url).await?;
        let items = events.as_array().ok_or_else(|| {
            AppError::Fetch("Gamma /events response was not an array".to_string())
        })?;

        let mut stats = FetchStats {
            api_events: items.len(),
            ..FetchStats::default()
        };
        let now = now_secs();
        let mut markets = Vec::new();
        let mut admitted_events = 0usize;

        for event in items {
            if admitted_events >= self.fetch_limit {
                break;
            }

            let active = event.get("active").and_then(|a| a.as_bool()).unwrap_or(false);
            let closed = event.get("closed").and_then(|c| c.as_bool()).unwrap_or(false);
            if !active || closed {
                stats.rejected_inactive += 1;
                continue;
            }
            if !self.category_admitted(event) {
                stats.rejected_category += 1;
                continue;
            }
            if !self.volume_admitted(event) {
                stats.rejected_volume += 1;
                continue;
            }

            let event_markets = parse_event_markets(event, now, &mut stats);
            if event_markets.is_empty() {
                continue;
            }
            admitted_events += 1;
            markets.extend(event_markets);
        }

        stats.admitted_events = admitted_events;
        stats.qualified_markets = markets.len();
        Ok((markets, stats))
    }

    /// An event is admitted iff any of its tag slugs matches a configured
    /// category. The top-level `category` field is ignored (often null).
    /// An empty category list admits everything.
    fn category_admitted(&self, event: &serde_json::Value) -> bool {
        if self.categories.is_empty() {
            return true;
        }
        event_tag_slugs(event)
            .iter()
            .any(|slug| self.categories.iter().any(|c| c == slug))
    }

    /// Thresholds of zero are disabled. OR mode admits when any enabled
    /// threshold is met; AND mode requires all of them.
    fn volume_admitted(&self, event: &serde_json::Value) -> bool {
        let checks: Vec<bool> = [
            (self.min_volume_24hr, numeric_field(event, "volume24hr")),
            (self.min_volume_1wk, numeric_field(event, "volume1wk")),
            (self.min_volume_1mo, numeric_field(event, "volume1mo")),
        ]
        .into_iter()
        .filter(|(min, _)| *min > 0.0)
        .map(|(min, vol)| vol >= min)
        .collect();

        if checks.is_empty() {
            return true;
        }
        if self.volume_filter_or {
            checks.iter().any(|&c| c)
        } else {
            checks.iter().all(|&c| c)
        }
    }

    async fn get_with_retry(&self, url: &str) -> Result<serde_json::Value> {
        let mut attempt: u32 = 0;
        loop {
            match self.try_get(url).await {
                Ok(value) => return Ok(value),
                Err(FetchAttempt::Fatal(msg)) => return Err(AppError::Fetch(msg)),
                Err(FetchAttempt::Retryable(msg)) => {
                    if attempt >= self.retries {
                        return Err(AppError::Fetch(format!(
                            "exhausted {} retries: {msg}",
                            self.retries,
                        )));
                    }
                    let backoff = self.backoff_base * (attempt + 1);
                    warn!(attempt, "fetch failed, retrying in {backoff:?}: {msg}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_get(&self, url: &str) -> std::result::Result<serde_json::Value, FetchAttempt> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchAttempt::Retryable(format!("transport: {e}")))?;

        let status = resp.status();
        if status.is_client_error() {
            return Err(FetchAttempt::Fatal(format!("client error {status}")));
        }
        if !status.is_success() {
            return Err(FetchAttempt::Retryable(format!("server error {status}")));
        }
        resp.json()
            .await
            .map_err(|e| FetchAttempt::Retryable(format!("malformed body: {e}")))
    }
}

enum FetchAttempt {
    Retryable(String),
    Fatal(String),
}

fn event_tag_slugs(event: &serde_json::Value) -> Vec<String> {
    event
        .get("tags")
        .and_then(|t| t.as_array())
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.get("slug").and_then(|s| s.as_str()))
                .map(|s| s.to_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

/// Numeric fields arrive as numbers or as numeric strings depending on the
/// endpoint revision.
fn numeric_field(v: &serde_json::Value, key: &str) -> f64 {
    v.get(key)
        .and_then(|x| x.as_f64().or_else(|| x.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0.0)
}

/// Flatten one admitted event into its binary markets.
///
/// `outcomes` and `outcomePrices` are string fields containing JSON arrays
/// and need a second parse; the outcome labelled "Yes" maps to yes_prob,
/// "No" to no_prob. Malformed markets are counted and skipped — a bad item
/// never fails the event, let alone the cycle. The two-stage decoding stops
/// here: nothing past this function sees string-encoded JSON.
pub fn parse_event_markets(
    event: &serde_json::Value,
    now: u64,
    stats: &mut FetchStats,
) -> Vec<Market> {
    let Some(event_id) = event.get("id").and_then(|i| i.as_str()) else {
        return Vec::new();
    };
    let event_title = event.get("title").and_then(|t| t.as_str()).unwrap_or("");
    let slug = event.get("slug").and_then(|s| s.as_str()).unwrap_or(event_id);
    let event_url = format!("https://polymarket.com/event/{slug}");
    let category = event_tag_slugs(event).into_iter().next().unwrap_or_default();

    let volume_24hr = numeric_field(event, "volume24hr");
    let volume_1wk = numeric_field(event, "volume1wk");
    let volume_1mo = numeric_field(event, "volume1mo");
    let liquidity = numeric_field(event, "liquidity");

    let Some(raw_markets) = event.get("markets").and_then(|m| m.as_array()) else {
        return Vec::new();
    };

    let mut markets = Vec::new();
    for raw in raw_markets {
        stats.markets_seen += 1;

        let Some(market_id) = raw.get("id").and_then(|i| i.as_str()) else {
            stats.rejected_no_outcomes += 1;
            continue;
        };
        let question = raw.get("question").and_then(|q| q.as_str()).unwrap_or("");

        let Some((yes_prob, no_prob)) = parse_outcome_prices(raw) else {
            stats.rejected_bad_prices += 1;
            continue;
        };

        markets.push(Market {
            id: composite_id(event_id, market_id),
            event_id: event_id.to_string(),
            event_title: event_title.to_string(),
            event_url: event_url.clone(),
            question: question.to_string(),
            category: category.clone(),
            yes_prob,
            no_prob,
            volume_24hr,
            volume_1wk,
            volume_1mo,
            liquidity,
            active: true,
            created_at: now,
            last_updated: now,
        });
    }

    if markets.is_empty() {
        debug!(event_id, "event had no parseable binary markets");
    }
    markets
}

/// Second-stage parse of the string-encoded `outcomes` / `outcomePrices`
/// pair. Returns `(yes_prob, no_prob)` or None when the market is not a
/// well-formed Yes/No market.
fn parse_outcome_prices(market: &serde_json::Value) -> Option<(f64, f64)> {
    let outcomes: Vec<String> =
        serde_json::from_str(market.get("outcomes")?.as_str()?).ok()?;
    let prices: Vec<String> =
        serde_json::from_str(market.get("outcomePrices")?.as_str()?).ok()?;
    if outcomes.len() != prices.len() {
        return None;
    }

    let yes_idx = outcomes.iter().position(|o| o.eq_ignore_ascii_case("Yes"))?;
    let no_idx = outcomes.iter().position(|o| o.eq_ignore_ascii_case("No"))?;

    let yes_prob: f64 = prices.get(yes_idx)?.parse().ok()?;
    let no_prob: f64 = prices.get(no_idx)?.parse().ok()?;
    if !(0.0..=1.0).contains(&yes_prob) || !(0.0..=1.0).contains(&no_prob) {
        return None;
    }
    Some((yes_prob, no_prob))
}
