use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::notify::{ChatSink, DiagnosticKind};
use crate::types::EventGroup;

/// Characters the Telegram MarkdownV2 dialect requires escaping in text.
const MARKDOWN_V2_SPECIALS: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Telegram Bot API sink. One `sendMessage` per cycle, MarkdownV2, with its
/// own retry budget mirroring the fetch discipline (4xx fatal, 5xx and
/// transport errors retried with linear-multiple backoff).
pub struct TelegramSink {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
    retries: u32,
    backoff_base: Duration,
}

impl TelegramSink {
    pub fn new(cfg: &Config) -> Result<Self> {
        if cfg.telegram.bot_token.is_empty() || cfg.telegram.chat_id.is_empty() {
            return Err(AppError::Config(
                "telegram.bot_token and telegram.chat_id are required for the Telegram sink"
                    .to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            bot_token: cfg.telegram.bot_token.clone(),
            chat_id: cfg.telegram.chat_id.clone(),
            retries: cfg.http.retries,
            backoff_base: Duration::from_millis(cfg.http.backoff_base_ms),
        })
    }

    async fn post_message(&self, text: String, markdown: bool) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let mut body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if markdown {
            body["parse_mode"] = serde_json::Value::String("MarkdownV2".to_string());
        }

        let mut attempt: u32 = 0;
        loop {
            let result = self.client.post(&url).json(&body).send().await;
            let err = match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!("telegram message delivered");
                    return Ok(());
                }
                Ok(resp) if resp.status().is_client_error() => {
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    return Err(AppError::Dispatch(format!(
                        "telegram rejected message ({status}): {detail}"
                    )));
                }
                Ok(resp) => format!("server error {}", resp.status()),
                Err(e) => format!("transport: {e}"),
            };

            if attempt >= self.retries {
                return Err(AppError::Dispatch(format!(
                    "exhausted {} retries: {err}",
                    self.retries,
                )));
            }
            let backoff = self.backoff_base * (attempt + 1);
            warn!(attempt, "telegram send failed, retrying in {backoff:?}: {err}");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send(&self, groups: &[EventGroup]) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }
        self.post_message(format_groups(groups), true).await
    }

    async fn send_diagnostic(&self, kind: DiagnosticKind, text: &str) -> Result<()> {
        let prefix = match kind {
            DiagnosticKind::Error => "⚠️",
            DiagnosticKind::Recovery => "✅",
        };
        self.post_message(format!("{prefix} {text}"), false).await
    }
}

/// Escape every MarkdownV2 special character in a text fragment.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' || MARKDOWN_V2_SPECIALS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inside a `[label](url)` the url only needs `)` and `\` escaped.
fn escape_markdown_url(url: &str) -> String {
    url.replace('\\', "\\\\").replace(')', "\\)")
}

/// Render the cycle's ordered groups: per group a title hyperlink line, then
/// one line per market with direction arrow, magnitude in percent (one
/// decimal), old → new, and the detection window.
pub fn format_groups(groups: &[EventGroup]) -> String {
    let mut lines = Vec::new();
    for group in groups {
        lines.push(format!(
            "*[{}]({})*",
            escape_markdown_v2(&group.event_title),
            escape_markdown_url(&group.event_url),
        ));
        for change in &group.changes {
            lines.push(format!(
                "{} {} {}: {} → {} \\({}\\)",
                change.direction.arrow(),
                escape_markdown_v2(&format!("{:.1}%", change.magnitude * 100.0)),
                escape_markdown_v2(&change.question),
                escape_markdown_v2(&format!("{:.1}%", change.old_prob * 100.0)),
                escape_markdown_v2(&format!("{:.1}%", change.new_prob * 100.0)),
                escape_markdown_v2(&format_window(change.window)),
            ));
        }
        lines.push(String::new());
    }
    lines.join("\n").trim_end().to_string()
}

fn format_window(window: Duration) -> String {
    let secs = window.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
