mod telegram;

pub use telegram::TelegramSink;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::EventGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error,
    Recovery,
}

/// Outbound chat port. The cycle driver only ever talks to this trait; the
/// Telegram transport is one implementation, the no-op sink another.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Deliver one message for the cycle's ordered groups.
    async fn send(&self, groups: &[EventGroup]) -> Result<()>;

    /// Deliver an operational notice (fetch failure, recovery).
    async fn send_diagnostic(&self, kind: DiagnosticKind, text: &str) -> Result<()>;
}

/// Discards everything. Used when no bot token is configured, and in tests.
pub struct NoopSink;

#[async_trait]
impl ChatSink for NoopSink {
    async fn send(&self, _groups: &[EventGroup]) -> Result<()> {
        Ok(())
    }

    async fn send_diagnostic(&self, _kind: DiagnosticKind, _text: &str) -> Result<()> {
        Ok(())
    }
}
