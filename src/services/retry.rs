use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_TRIES: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF: u32 = 2;

const MAX_ERROR_BODY_CHARS: usize = 400;

/// Failure of a single HTTP attempt.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

impl From<reqwest::Error> for AttemptError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AttemptError::Timeout(err)
        } else {
            AttemptError::Transport(err)
        }
    }
}

impl AttemptError {
    /// Turns a non-2xx response into [`AttemptError::Status`], keeping a
    /// truncated copy of the body for diagnostics.
    pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, Self> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AttemptError::Status {
            status,
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            AttemptError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Retries were exhausted, or the last error was not retryable.
#[derive(Debug, thiserror::Error)]
#[error("failed after {attempts} attempt(s): {last}")]
pub struct RetryExhausted {
    pub attempts: u32,
    #[source]
    pub last: AttemptError,
}

/// Default retry predicate: any HTTP status error, timeout or transport error.
pub fn is_transient(_err: &AttemptError) -> bool {
    true
}

/// Retry predicate that only retries timeouts, connection problems and 5xx.
pub fn is_server_side(err: &AttemptError) -> bool {
    match err {
        AttemptError::Status { status, .. } => status.is_server_error(),
        AttemptError::Timeout(_) | AttemptError::Transport(_) => true,
    }
}

/// Bounded retry with exponential backoff: `tries` attempts in total, the
/// n-th delay being `delay * backoff^(n-1)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub tries: u32,
    pub delay: Duration,
    pub backoff: u32,
    pub retry_if: fn(&AttemptError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: DEFAULT_TRIES,
            delay: DEFAULT_DELAY,
            backoff: DEFAULT_BACKOFF,
            retry_if: is_transient,
        }
    }
}

impl RetryPolicy {
    pub fn new(tries: u32, delay: Duration, backoff: u32) -> Self {
        Self {
            tries,
            delay,
            backoff,
            ..Self::default()
        }
    }

    pub fn with_retry_if(mut self, retry_if: fn(&AttemptError) -> bool) -> Self {
        self.retry_if = retry_if;
        self
    }

    /// Delays between attempts, in order. There is one fewer than `tries`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.tries.max(1) - 1).map(move |n| {
            self.delay
                .saturating_mul(self.backoff.saturating_pow(n))
        })
    }

    /// Runs `op` until it succeeds, the predicate rejects the error, or the
    /// attempts run out. `op` receives the 1-based attempt number; `sleep` is
    /// awaited between attempts.
    pub async fn run<T, Op, Fut, Sl, SlFut>(
        &self,
        mut op: Op,
        mut sleep: Sl,
    ) -> Result<T, RetryExhausted>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
        Sl: FnMut(Duration) -> SlFut,
        SlFut: Future<Output = ()>,
    {
        let tries = self.tries.max(1);
        let mut delays = self.delays();
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let delay = match delays.next() {
                Some(delay) if (self.retry_if)(&err) => delay,
                _ => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
            };

            warn!(
                attempt,
                tries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// [`RetryPolicy::run`] with real `tokio` sleeps.
    pub async fn run_with_tokio<T, Op, Fut>(&self, op: Op) -> Result<T, RetryExhausted>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        self.run(op, tokio::time::sleep).await
    }
}
