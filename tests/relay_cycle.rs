//! End-to-end relay cycles.
//!
//! Each test stands up an Axum server on a random port in place of the Bot
//! API, points a real `TelegramDispatcher` at it, and drives scheduler
//! cycles against an in-memory mailbox.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::time::timeout;

use code_relay::channels::TelegramDispatcher;
use code_relay::config::{DispatchConfig, SchedulerConfig};
use code_relay::error::MailboxError;
use code_relay::health::{HealthState, health_routes};
use code_relay::mailbox::{MailboxConnector, MailboxSession, MessageId, RawMessage};
use code_relay::metrics::CycleMetrics;
use code_relay::pipeline::{CodeExtractor, FilterPolicy};
use code_relay::scheduler::{Scheduler, spawn_scheduler};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const TOKEN: &str = "42:relay-test";

// ── In-memory mailbox ────────────────────────────────────────────────

#[derive(Default)]
struct Inbox {
    messages: Vec<(String, Vec<u8>)>,
    seen: Vec<String>,
    sessions_opened: usize,
    sessions_closed: usize,
}

type SharedInbox = Arc<Mutex<Inbox>>;

struct InboxSession(SharedInbox);

#[async_trait]
impl MailboxSession for InboxSession {
    async fn search_unseen(&mut self) -> Result<Vec<MessageId>, MailboxError> {
        let inbox = self.0.lock().unwrap();
        Ok(inbox
            .messages
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !inbox.seen.contains(id))
            .collect())
    }

    async fn fetch_raw(&mut self, id: &str) -> Result<RawMessage, MailboxError> {
        let inbox = self.0.lock().unwrap();
        let (_, bytes) = inbox
            .messages
            .iter()
            .find(|(m, _)| m == id)
            .ok_or_else(|| MailboxError::Protocol {
                command: "FETCH".into(),
                response: format!("no message {id}"),
            })?;
        Ok(RawMessage {
            id: id.into(),
            bytes: bytes.clone(),
        })
    }

    async fn mark_seen(&mut self, id: &str) -> Result<(), MailboxError> {
        self.0.lock().unwrap().seen.push(id.into());
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        self.0.lock().unwrap().sessions_closed += 1;
        Ok(())
    }
}

struct InboxConnector(SharedInbox);

#[async_trait]
impl MailboxConnector for InboxConnector {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        self.0.lock().unwrap().sessions_opened += 1;
        Ok(Box::new(InboxSession(self.0.clone())))
    }
}

fn inbox(messages: &[(&str, &str)]) -> SharedInbox {
    Arc::new(Mutex::new(Inbox {
        messages: messages
            .iter()
            .map(|(id, raw)| (id.to_string(), raw.as_bytes().to_vec()))
            .collect(),
        ..Default::default()
    }))
}

// ── Mock Bot API ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct BotApi {
    received: Arc<Mutex<Vec<Value>>>,
    /// Chat ids that answer 400 "chat not found".
    broken_chats: Arc<Vec<String>>,
}

async fn send_message(State(api): State<BotApi>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    api.received.lock().unwrap().push(body.clone());
    let chat = body["chat_id"].as_str().unwrap_or_default();
    if api.broken_chats.iter().any(|c| c == chat) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "description": "Bad Request: chat not found"})),
        );
    }
    (StatusCode::OK, Json(serde_json::json!({"ok": true})))
}

/// Start the mock API on a random port, return (base URL, api).
async fn start_bot_api(broken_chats: &[&str]) -> (String, BotApi) {
    let api = BotApi {
        received: Arc::default(),
        broken_chats: Arc::new(broken_chats.iter().map(|c| c.to_string()).collect()),
    };
    let app = Router::new()
        .route(&format!("/bot{TOKEN}/sendMessage"), post(send_message))
        .with_state(api.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{port}"), api)
}

fn build(base: &str, destinations: &[&str], inbox: &SharedInbox, metrics: Arc<CycleMetrics>) -> Scheduler {
    let dispatcher = TelegramDispatcher::new(DispatchConfig {
        api_base: base.into(),
        bot_token: SecretString::from(TOKEN),
        destinations: destinations.iter().map(|d| d.to_string()).collect(),
        timeout: Duration::from_secs(2),
    })
    .unwrap();
    Scheduler::new(
        Arc::new(InboxConnector(inbox.clone())),
        CodeExtractor::default_rules(),
        FilterPolicy::default_policy(),
        Arc::new(dispatcher),
        metrics,
        SchedulerConfig::default(),
    )
}

const CODE_MAIL: &str = "From: Example <noreply@example.com>\r\n\
Subject: =?UTF-8?B?55m75b2V6aqM6K+B56CB?=\r\n\
Date: Mon, 19 Oct 2026 08:30:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<div style='color:#336699'>账户信息</div><p>验证码</p><div>739201</div>\r\n";

const REPORT_MAIL: &str = "From: boss@example.com\r\n\
Subject: Weekly Report 123456\r\n\
\r\n\
Numbers: 482913\r\n";

const NOTICE_MAIL: &str = "From: security@example.com\r\n\
Subject: Verification settings changed\r\n\
\r\n\
Your verification preferences were updated.\r\n";

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cycle_forwards_code_to_every_destination() {
    timeout(TEST_TIMEOUT, async {
        let (base, api) = start_bot_api(&[]).await;
        let inbox = inbox(&[("1", REPORT_MAIL), ("2", NOTICE_MAIL), ("3", CODE_MAIL)]);
        let metrics = Arc::new(CycleMetrics::new());
        let scheduler = build(&base, &["1001", "1002"], &inbox, metrics.clone());

        let summary = scheduler.run_cycle().await.unwrap();
        assert_eq!(summary.forwarded, 1);
        assert_eq!(summary.skipped, 2);

        let received = api.received.lock().unwrap();
        assert_eq!(received.len(), 2);
        let mut chats: Vec<&str> = received.iter().map(|b| b["chat_id"].as_str().unwrap()).collect();
        chats.sort();
        assert_eq!(chats, vec!["1001", "1002"]);
        for body in received.iter() {
            let text = body["text"].as_str().unwrap();
            assert!(text.contains("登录验证码"), "{text}");
            assert!(text.contains("`739201`"), "{text}");
            assert!(!text.contains("482913"), "{text}");
            assert_eq!(body["parse_mode"], "Markdown");
        }

        let inbox = inbox.lock().unwrap();
        assert_eq!(inbox.seen, vec!["1", "2", "3"]);
        assert_eq!(inbox.sessions_opened, 1);
        assert_eq!(inbox.sessions_closed, 1);
        assert_eq!(metrics.snapshot().forwarded, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn partial_delivery_counts_as_forwarded() {
    timeout(TEST_TIMEOUT, async {
        let (base, api) = start_bot_api(&["dead"]).await;
        let inbox = inbox(&[("7", CODE_MAIL)]);
        let scheduler = build(&base, &["dead", "2002"], &inbox, Arc::new(CycleMetrics::new()));

        let summary = scheduler.run_cycle().await.unwrap();
        assert_eq!(summary.forwarded, 1);
        assert_eq!(inbox.lock().unwrap().seen, vec!["7"]);

        // "dead" was tried with Markdown, then plain; "2002" once.
        assert_eq!(api.received.lock().unwrap().len(), 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_delivery_is_retried_next_cycle() {
    timeout(TEST_TIMEOUT, async {
        let (base, api) = start_bot_api(&["dead"]).await;
        let inbox = inbox(&[("7", CODE_MAIL)]);
        let scheduler = build(&base, &["dead"], &inbox, Arc::new(CycleMetrics::new()));

        let first = scheduler.run_cycle().await.unwrap();
        assert_eq!(first.undelivered, 1);
        assert!(inbox.lock().unwrap().seen.is_empty());

        let second = scheduler.run_cycle().await.unwrap();
        assert_eq!(second.considered, 1);
        assert_eq!(api.received.lock().unwrap().len(), 4);
        assert_eq!(inbox.lock().unwrap().sessions_closed, 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn health_check_trigger_drives_a_cycle() {
    timeout(TEST_TIMEOUT, async {
        let (base, api) = start_bot_api(&[]).await;
        let inbox = inbox(&[]);
        let metrics = Arc::new(CycleMetrics::new());
        let trigger = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_scheduler(
            build(&base, &["1001"], &inbox, metrics.clone()),
            shutdown_rx,
            trigger.clone(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = health_routes(HealthState {
            metrics: metrics.clone(),
            trigger,
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        while metrics.snapshot().cycles == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A code arrives between polls; POST /check picks it up now.
        inbox
            .lock()
            .unwrap()
            .messages
            .push(("1".into(), CODE_MAIL.as_bytes().to_vec()));
        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/check"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        while metrics.snapshot().forwarded == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(api.received.lock().unwrap().len(), 1);

        let health: Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["forwarded"], 1);
        assert!(health["cycles"].as_u64().unwrap() >= 2);
        assert!(!health["last_check"].is_null());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    })
    .await
    .expect("test timed out");
}
