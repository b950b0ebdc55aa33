//! Polling loop.
//!
//! One cycle: open a session, list the newest unseen messages, then for each
//! one extract, filter, dispatch and mark it read. The session is always
//! released before the cycle returns, whatever happened inside it.
//!
//! Between cycles the loop sleeps `interval - elapsed` (floored), or the
//! cooldown once the backoff counter trips. Shutdown cuts any sleep short; a
//! manual check request cuts short an ordinary sleep but not a cooldown. A
//! running cycle is never interrupted.

pub mod backoff;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{Dispatcher, format_forward};
use crate::config::SchedulerConfig;
use crate::error::MailboxError;
use crate::mailbox::{MailboxConnector, MailboxSession, close_session, fetch_message, list_recent_unseen};
use crate::metrics::CycleMetrics;
use crate::pipeline::{CodeExtractor, FilterPolicy};

pub use backoff::{Backoff, BackoffAction};

/// Shortest sleep between cycles, however long the last one took.
pub const MIN_SLEEP: Duration = Duration::from_secs(2);

/// Where the loop is, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Connecting,
    Listing,
    PerMessage,
    Cooling,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listing => "listing",
            Self::PerMessage => "per_message",
            Self::Cooling => "cooling",
        }
    }
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Sent to at least one destination and marked read.
    Forwarded,
    /// Not forwarded by policy; marked read.
    Skipped,
    /// Could not be decoded; marked read.
    Unparseable,
    /// Forward decided but every destination failed; left unread.
    Undelivered,
}

/// Per-cycle tally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Unseen messages on the server.
    pub unseen: usize,
    /// Messages looked at this cycle.
    pub considered: usize,
    pub forwarded: usize,
    pub skipped: usize,
    pub undelivered: usize,
    /// Message-level failures (fetch or mark-read) that did not end the cycle.
    pub failed: usize,
}

pub struct Scheduler {
    connector: Arc<dyn MailboxConnector>,
    extractor: CodeExtractor,
    policy: FilterPolicy,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<CycleMetrics>,
    config: SchedulerConfig,
    backoff: Backoff,
    /// The last `after_cycle` chose the cooldown.
    cooling: bool,
}

impl Scheduler {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        extractor: CodeExtractor,
        policy: FilterPolicy,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<CycleMetrics>,
        config: SchedulerConfig,
    ) -> Self {
        let backoff = Backoff::new(config.max_errors, config.error_reset_to);
        Self {
            connector,
            extractor,
            policy,
            dispatcher,
            metrics,
            config,
            backoff,
            cooling: false,
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn is_cooling(&self) -> bool {
        self.cooling
    }

    /// One full cycle. `Err` only for cycle-level failures: connect, login,
    /// select, search, or a transport error part-way through.
    pub async fn run_cycle(&self) -> Result<CycleSummary, MailboxError> {
        debug!(state = SchedulerState::Connecting.as_str(), "Opening mailbox session");
        let mut session = self.connector.open().await?;
        let result = self.process(session.as_mut()).await;
        close_session(session).await;
        result
    }

    async fn process(&self, session: &mut dyn MailboxSession) -> Result<CycleSummary, MailboxError> {
        debug!(state = SchedulerState::Listing.as_str(), "Searching unseen messages");
        let (unseen, ids) = list_recent_unseen(session, self.config.max_messages_per_cycle).await?;

        let mut summary = CycleSummary {
            unseen,
            considered: ids.len(),
            ..Default::default()
        };
        if ids.is_empty() {
            return Ok(summary);
        }
        info!(unseen, considered = ids.len(), "Found unseen messages");
        self.metrics.add_discovered(ids.len() as u64);

        for id in &ids {
            debug!(state = SchedulerState::PerMessage.as_str(), id = %id, "Processing message");
            match self.handle_message(session, id).await {
                Ok(outcome) => match outcome {
                    MessageOutcome::Forwarded => summary.forwarded += 1,
                    MessageOutcome::Skipped | MessageOutcome::Unparseable => summary.skipped += 1,
                    MessageOutcome::Undelivered => summary.undelivered += 1,
                },
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    warn!(id = %id, error = %e, "Message failed, continuing");
                    self.metrics.record_error();
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn handle_message(
        &self,
        session: &mut dyn MailboxSession,
        id: &str,
    ) -> Result<MessageOutcome, MailboxError> {
        let message = match fetch_message(session, id, self.config.body_prefix_chars).await {
            Ok(message) => message,
            Err(e @ MailboxError::Parse { .. }) => {
                warn!(id = %id, error = %e, "Unparseable message, marking read");
                session.mark_seen(id).await?;
                self.metrics.record_processed();
                return Ok(MessageOutcome::Unparseable);
            }
            Err(e) => return Err(e),
        };

        let extraction = self.extractor.extract(&message.body);
        let decision = self
            .policy
            .evaluate(&message.subject, &message.body, extraction.as_ref());
        info!(
            id = %id,
            subject = %message.subject,
            sender = %message.sender,
            decision = decision.label(),
            reason = %decision.reason,
            "Filtered message"
        );

        let mut outcome = MessageOutcome::Skipped;
        if let (true, Some(extraction)) = (decision.forward, extraction.as_ref()) {
            let text = format_forward(&message, &extraction.code, Utc::now());
            let report = self.dispatcher.dispatch(&text).await;
            if !report.any_delivered() {
                warn!(
                    id = %id,
                    failed = report.failed.len(),
                    "No destination accepted the forward, leaving message unread"
                );
                self.metrics.record_error();
                return Ok(MessageOutcome::Undelivered);
            }
            self.metrics.record_forwarded();
            outcome = MessageOutcome::Forwarded;
        }

        session.mark_seen(id).await?;
        self.metrics.record_processed();
        Ok(outcome)
    }

    /// Fold a cycle result into the backoff counter and metrics; returns how
    /// long to sleep before the next cycle.
    pub fn after_cycle(
        &mut self,
        result: &Result<CycleSummary, MailboxError>,
        elapsed: Duration,
    ) -> Duration {
        self.cooling = false;
        let delay = match result {
            Ok(summary) => {
                self.backoff.on_success();
                if summary.considered > 0 {
                    info!(
                        forwarded = summary.forwarded,
                        skipped = summary.skipped,
                        undelivered = summary.undelivered,
                        failed = summary.failed,
                        "Cycle complete"
                    );
                }
                next_delay(self.config.poll_interval, elapsed)
            }
            Err(e) => {
                self.metrics.record_error();
                match self.backoff.on_failure() {
                    BackoffAction::Continue => {
                        error!(error = %e, consecutive = self.backoff.errors(), "Cycle failed");
                        next_delay(self.config.poll_interval, elapsed)
                    }
                    BackoffAction::Cool => {
                        error!(
                            error = %e,
                            state = SchedulerState::Cooling.as_str(),
                            cooldown_secs = self.config.cooldown.as_secs(),
                            "Too many consecutive failures, cooling down"
                        );
                        self.cooling = true;
                        self.config.cooldown
                    }
                }
            }
        };
        self.metrics.finish_cycle(self.backoff.errors(), Utc::now());
        delay
    }

    /// Run cycles until `shutdown` turns true or its sender goes away.
    /// `trigger` wakes the loop for an immediate cycle, except during a
    /// cooldown: a request that arrives then is logged and dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, trigger: Arc<Notify>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            max_messages = self.config.max_messages_per_cycle,
            "Scheduler started"
        );

        'cycles: loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let result = self.run_cycle().await;
            let delay = self.after_cycle(&result, started.elapsed());

            let state = if self.cooling {
                SchedulerState::Cooling
            } else {
                SchedulerState::Idle
            };
            debug!(state = state.as_str(), sleep_ms = delay.as_millis() as u64, "Sleeping");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = trigger.notified() => {
                        if state == SchedulerState::Cooling {
                            info!(state = state.as_str(), "Manual check ignored while cooling down");
                            continue;
                        }
                        info!("Manual check requested");
                        break;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break 'cycles;
                        }
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}

/// Sleep after a cycle that took `elapsed`.
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(MIN_SLEEP)
}

/// Spawn the loop on the runtime.
pub fn spawn_scheduler(
    scheduler: Scheduler,
    shutdown: watch::Receiver<bool>,
    trigger: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(scheduler.run(shutdown, trigger))
}
