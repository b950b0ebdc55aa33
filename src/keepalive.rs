//! Periodic self-ping, for hosts that idle out processes without traffic.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::KeepaliveConfig;
use crate::error::KeepaliveError;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// GET `url` once. Any 2xx counts as success.
pub async fn ping(client: &reqwest::Client, url: &str) -> Result<(), KeepaliveError> {
    let resp = client.get(url).send().await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(KeepaliveError::Status(resp.status().as_u16()))
    }
}

/// Spawn the keepalive loop. The first ping goes out after one interval.
pub fn spawn_keepalive(config: KeepaliveConfig, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(PING_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Keepalive disabled: HTTP client unavailable");
                return;
            }
        };
        info!(url = %config.url, interval_secs = config.interval.as_secs(), "Keepalive started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match ping(&client, &config.url).await {
                Ok(()) => debug!(url = %config.url, "Keepalive ping ok"),
                Err(e) => warn!(url = %config.url, error = %e, "Keepalive ping failed"),
            }
        }
        debug!("Keepalive stopped");
    })
}
