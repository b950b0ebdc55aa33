//! Telegram Bot API dispatcher.
//!
//! One `sendMessage` per destination, all in flight together. A failure at
//! one chat never stops delivery to the others.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::channels::{DispatchReport, Dispatcher};
use crate::config::DispatchConfig;
use crate::error::DispatchError;

/// Longest response body kept in an error.
const MAX_ERROR_BODY: usize = 200;

pub struct TelegramDispatcher {
    client: reqwest::Client,
    api_base: String,
    bot_token: SecretString,
    destinations: Vec<String>,
}

impl TelegramDispatcher {
    pub fn new(config: DispatchConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DispatchError::Http {
                destination: "*".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token,
            destinations: config.destinations,
        })
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Send to one chat, Markdown first. A 400 usually means the text did
    /// not parse as Markdown, so the plain rendition is tried once.
    async fn send_to(&self, chat_id: &str, text: &str) -> Result<(), DispatchError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });
        let resp = self.post(chat_id, &markdown_body).await?;
        if resp.status() == StatusCode::OK {
            return Ok(());
        }
        if resp.status() != StatusCode::BAD_REQUEST {
            return Err(rejected(chat_id, resp).await);
        }

        warn!(
            destination = %chat_id,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );
        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        let resp = self.post(chat_id, &plain_body).await?;
        if resp.status() == StatusCode::OK {
            return Ok(());
        }
        Err(rejected(chat_id, resp).await)
    }

    async fn post(
        &self,
        chat_id: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, DispatchError> {
        self.client
            .post(self.api_url("sendMessage"))
            .json(body)
            .send()
            .await
            .map_err(|e| http_error(chat_id, e))
    }
}

async fn rejected(chat_id: &str, resp: reqwest::Response) -> DispatchError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    DispatchError::Status {
        destination: chat_id.to_string(),
        status,
        body: body.chars().take(MAX_ERROR_BODY).collect(),
    }
}

/// reqwest errors can carry the request URL, which embeds the bot token.
fn http_error(chat_id: &str, err: reqwest::Error) -> DispatchError {
    DispatchError::Http {
        destination: chat_id.to_string(),
        reason: err.without_url().to_string(),
    }
}

#[async_trait]
impl Dispatcher for TelegramDispatcher {
    async fn dispatch(&self, text: &str) -> DispatchReport {
        let sends = self
            .destinations
            .iter()
            .map(|chat_id| async move { (chat_id, self.send_to(chat_id, text).await) });

        let mut report = DispatchReport::default();
        for (chat_id, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    info!(destination = %chat_id, "Forwarded code");
                    report.delivered.push(chat_id.clone());
                }
                Err(e) => {
                    warn!(destination = %chat_id, error = %e, "Delivery failed");
                    report.failed.push(e);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{Json, Router, extract::State, http::StatusCode as AxumStatus, routing::post};

    fn config(api_base: &str, destinations: &[&str]) -> DispatchConfig {
        DispatchConfig {
            api_base: api_base.into(),
            bot_token: SecretString::from("123:ABC"),
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn telegram_api_url() {
        let d = TelegramDispatcher::new(config("https://api.telegram.org/", &["1"])).unwrap();
        assert_eq!(
            d.api_url("sendMessage"),
            "https://api.telegram.org/bot123:ABC/sendMessage"
        );
    }

    type Seen = Arc<Mutex<Vec<serde_json::Value>>>;

    /// Mock Bot API: chat "bad" gets 403, Markdown to chat "md" gets 400.
    async fn mock_api() -> (String, Seen) {
        async fn send_message(
            State(seen): State<Seen>,
            Json(body): Json<serde_json::Value>,
        ) -> AxumStatus {
            seen.lock().unwrap().push(body.clone());
            match (body["chat_id"].as_str(), body.get("parse_mode")) {
                (Some("bad"), _) => AxumStatus::FORBIDDEN,
                (Some("md"), Some(_)) => AxumStatus::BAD_REQUEST,
                _ => AxumStatus::OK,
            }
        }

        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/bot123:ABC/sendMessage", post(send_message))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn one_failing_destination_does_not_block_others() {
        let (base, seen) = mock_api().await;
        let d = TelegramDispatcher::new(config(&base, &["100", "bad", "200"])).unwrap();

        let report = d.dispatch("🔢 `482913`").await;
        assert!(report.any_delivered());
        assert_eq!(report.delivered, vec!["100".to_string(), "200".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            &report.failed[0],
            DispatchError::Status { destination, status: 403, .. } if destination == "bad"
        ));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for body in seen.iter() {
            assert_eq!(body["parse_mode"], "Markdown");
            assert_eq!(body["disable_web_page_preview"], true);
            assert_eq!(body["text"], "🔢 `482913`");
        }
    }

    #[tokio::test]
    async fn markdown_rejection_retries_plain() {
        let (base, seen) = mock_api().await;
        let d = TelegramDispatcher::new(config(&base, &["md"])).unwrap();

        let report = d.dispatch("broken *markdown").await;
        assert_eq!(report.delivered, vec!["md".to_string()]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].get("parse_mode").is_none());
    }

    #[tokio::test]
    async fn unreachable_api_fails_every_destination() {
        // Port 9 (discard) on localhost is not served.
        let d = TelegramDispatcher::new(config("http://127.0.0.1:9", &["1", "2"])).unwrap();
        let report = d.dispatch("x").await;
        assert!(!report.any_delivered());
        assert_eq!(report.failed.len(), 2);
        for err in &report.failed {
            assert!(matches!(err, DispatchError::Http { .. }));
            assert!(!err.to_string().contains("123:ABC"));
        }
    }
}
