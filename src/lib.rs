//! Code Relay: forwards verification codes from a mailbox to chat.

pub mod channels;
pub mod config;
pub mod error;
pub mod health;
pub mod keepalive;
pub mod mailbox;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
