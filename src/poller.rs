//! One device, one worker: the fetch -> validate -> diff -> forward cycle and
//! the fixed-delay scheduler that drives it.
//!
//! The cursor is owned by [`PollCycle`] and only moves after the notifier
//! accepted the message, so a failed cycle never loses or duplicates entries
//! that are still inside the feed window.

use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::log::escape_html;
use crate::models::LogEntry;
use crate::services::auth::AuthTokenProvider;
use crate::services::diff::{diff, Cursor};
use crate::services::fetcher::{FetchFailure, Fetcher};
use crate::services::notifier::{NotifyError, Notifier};
use crate::services::validator::{validate, ValidationFailure};

pub const TOKEN_HEADER: &str = "X-Bt-Token";
pub const DEFAULT_USER_AGENT: &str = "okhttp/4.9.3";
pub const DEVICE_ID_PLACEHOLDER: &str = "{device_id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Fetching,
    Validating,
    Diffing,
    Forwarding,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// First successful cycle: cursor established, nothing forwarded.
    Bootstrapped,
    /// This many entries went out in one message.
    Forwarded(usize),
    NoChange,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchFailure),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),
    #[error("forwarding failed: {0}")]
    Forward(#[from] NotifyError),
    #[error("cycle panicked: {0}")]
    Panicked(String),
}

/// Static parameters of the feed request.
#[derive(Debug, Clone)]
pub struct FeedTarget {
    pub device_id: String,
    pub url: String,
    pub user_agent: String,
}

impl FeedTarget {
    pub fn new(device_id: &str, url_template: &str, user_agent: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            url: url_template.replace(DEVICE_ID_PLACEHOLDER, device_id),
            user_agent: user_agent.to_string(),
        }
    }
}

pub struct PollCycle {
    target: FeedTarget,
    tokens: AuthTokenProvider,
    fetcher: Fetcher,
    chat: Arc<dyn Notifier>,
    admin: Arc<dyn Notifier>,
    cursor: Cursor,
    state: PollState,
}

impl PollCycle {
    pub fn new(
        target: FeedTarget,
        tokens: AuthTokenProvider,
        fetcher: Fetcher,
        chat: Arc<dyn Notifier>,
        admin: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            target,
            tokens,
            fetcher,
            chat,
            admin,
            cursor: Cursor::new(),
            state: PollState::Idle,
        }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn target(&self) -> &FeedTarget {
        &self.target
    }

    /// Runs one cycle and absorbs any failure, including a panic, so the
    /// scheduler can keep ticking. Failures are reported to the admin channel.
    pub async fn tick(&mut self) -> CycleOutcome {
        let result = match AssertUnwindSafe(self.run_once()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(CycleError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(outcome) => {
                self.transition(PollState::Idle);
                outcome
            }
            Err(e) => {
                self.transition(PollState::Failed);
                error!(device_id = %self.target.device_id, error = %e, "Poll cycle failed");
                self.report_failure(&e).await;
                self.transition(PollState::Idle);
                CycleOutcome::Failed
            }
        }
    }

    /// One fetch -> validate -> diff -> forward pass. The cursor is untouched
    /// on every error path.
    pub async fn run_once(&mut self) -> Result<CycleOutcome, CycleError> {
        self.transition(PollState::Fetching);
        let headers = self.request_headers().await;
        let raw = self.fetcher.fetch(&self.target.url, &headers).await?;

        self.transition(PollState::Validating);
        let response = validate(&raw)?;
        let Some(newest) = response.newest().cloned() else {
            return Err(ValidationFailure::EmptyLog {
                status: response.status,
            }
            .into());
        };

        self.transition(PollState::Diffing);
        if !self.cursor.is_set() {
            debug!(device_id = %self.target.device_id, phone = %newest.phone_number(), "Bootstrapping cursor");
            self.cursor.advance(newest);
            return Ok(CycleOutcome::Bootstrapped);
        }
        // Empty exactly when the newest entry is the cursor.
        let fresh = diff(&response.log, self.cursor.get());
        if fresh.is_empty() {
            debug!(device_id = %self.target.device_id, "No new log entries");
            return Ok(CycleOutcome::NoChange);
        }

        self.transition(PollState::Forwarding);
        let message = render_message(fresh);
        self.chat.send(&message).await?;

        let forwarded = fresh.len();
        self.cursor.advance(newest);
        info!(device_id = %self.target.device_id, new_entries = forwarded, "Forwarded new log entries");
        Ok(CycleOutcome::Forwarded(forwarded))
    }

    async fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&self.target.user_agent) {
            Ok(value) => {
                headers.insert(USER_AGENT, value);
            }
            Err(e) => warn!(error = %e, "Invalid User-Agent, sending none"),
        }

        let token = self.tokens.token().await;
        match HeaderValue::from_str(&token) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(TOKEN_HEADER, value);
            }
            Err(e) => error!(error = %e, "Token is not a valid header value, sending none"),
        }
        headers
    }

    async fn report_failure(&self, err: &CycleError) {
        // Error bodies can carry raw HTML from upstream proxies.
        let text = escape_html(&format!("{}: {}", self.target.device_id, err));
        if let Err(e) = self.admin.send(&text).await {
            warn!(error = %e, "Failed to report cycle failure to admin chat");
        }
    }

    fn transition(&mut self, next: PollState) {
        debug!(from = ?self.state, to = ?next, "Poll state");
        self.state = next;
    }
}

/// One line per entry, in the order given (newest first).
pub fn render_message(entries: &[LogEntry]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drives `cycle` until `shutdown` flips to `true`.
///
/// The first cycle starts immediately; each following one starts `interval`
/// after the previous one completed. Shutdown is only observed between
/// cycles, so an in-flight cycle always finishes.
pub async fn run(mut cycle: PollCycle, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(
        device_id = %cycle.target.device_id,
        interval_secs = interval.as_secs(),
        "Polling started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let outcome = cycle.tick().await;
        debug!(?outcome, "Cycle finished");

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    warn!("Shutdown channel closed, stopping poller");
                    break;
                }
            }
        }
    }

    info!(device_id = %cycle.target.device_id, "Polling stopped");
}
