//! Mailbox access: session traits, the IMAP implementation and message
//! decoding.
//!
//! A cycle opens one session through a [`MailboxConnector`], uses it
//! sequentially, and hands it back to [`close_session`]. Sessions are never
//! shared between tasks.

pub mod fetcher;
pub mod imap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::MailboxError;

pub use fetcher::{DecodedMessage, decode_message, fetch_message, list_recent_unseen};
pub use imap::ImapConnector;

/// Server-assigned message sequence number, kept as the server sent it.
pub type MessageId = String;

/// A message exactly as fetched from the server.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: MessageId,
    pub bytes: Vec<u8>,
}

/// An authenticated, folder-selected mailbox session.
#[async_trait]
pub trait MailboxSession: Send {
    /// Ids of unseen messages, oldest to newest as the server reports them.
    async fn search_unseen(&mut self) -> Result<Vec<MessageId>, MailboxError>;

    /// Full RFC 822 bytes of one message.
    async fn fetch_raw(&mut self, id: &str) -> Result<RawMessage, MailboxError>;

    /// Set the `\Seen` flag on one message.
    async fn mark_seen(&mut self, id: &str) -> Result<(), MailboxError>;

    /// End the session.
    async fn logout(&mut self) -> Result<(), MailboxError>;
}

/// Opens sessions. Implementations must connect, authenticate and select the
/// target folder, in that order, before returning.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// Release a session. Failures are logged, never returned.
pub async fn close_session(mut session: Box<dyn MailboxSession>) {
    match session.logout().await {
        Ok(()) => debug!("Mailbox session closed"),
        Err(e) => warn!(error = %e, "Mailbox logout failed"),
    }
}
