//! Outbound notification channels.

pub mod format;
pub mod telegram;

use async_trait::async_trait;

use crate::error::DispatchError;

pub use format::format_forward;
pub use telegram::TelegramDispatcher;

/// Outcome of one fan-out, per destination.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<DispatchError>,
}

impl DispatchReport {
    /// A forward counts as sent when any destination took it.
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }
}

/// Delivers a formatted forward to every configured destination.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Attempt every destination independently; never fails as a whole.
    async fn dispatch(&self, text: &str) -> DispatchReport;
}
