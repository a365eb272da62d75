//! Retry and error classification for destination-chain calls
//!
//! Bounded exponential backoff for RPC reads, and the rejection classes the
//! relayer uses to decide what happens to a transfer after a failed submission.

use chrono::{DateTime, Utc};
use eyre::Result;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff between submission attempts of one transfer, spread across ticks
    pub fn for_submissions() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Calculate the retry time for `attempt`, counted from `now`
    pub fn next_retry_after_from(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let backoff = self.backoff_for_attempt(attempt);
        now + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(60))
    }
}

/// Classifies destination-chain errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The transfer is already completed or refunded; re-read and record it
    AlreadyDone,
    /// Business rejection (bad signer, not allow-listed, too few signatures); stop retrying
    Terminal,
    /// Fee, nonce or congestion problems; retry with backoff
    Infrastructure,
    /// Timeouts, connection errors, rate limits; retry with backoff
    Transient,
    /// Unrecognised; retry with backoff until the attempt budget runs out
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::AlreadyDone => "already_done",
            ErrorClass::Terminal => "terminal",
            ErrorClass::Infrastructure => "infrastructure",
            ErrorClass::Transient => "transient",
            ErrorClass::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Infrastructure | ErrorClass::Transient | ErrorClass::Unknown
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Transient errors
    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    // Fee, nonce and mempool errors
    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("fee too low")
        || error_lower.contains("max fee per gas less than")
        || error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
        || error_lower.contains("already known")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("txpool is full")
    {
        return ErrorClass::Infrastructure;
    }

    // The contract already moved the transfer out of Pending
    if error_lower.contains("already completed")
        || error_lower.contains("already refunded")
        || error_lower.contains("not pending")
        || error_lower.contains("already executed")
        || error_lower.contains("already processed")
    {
        return ErrorClass::AlreadyDone;
    }

    // Business rejections
    if error_lower.contains("not allowed")
        || error_lower.contains("not allow-listed")
        || error_lower.contains("not allowlisted")
        || error_lower.contains("unauthorized")
        || error_lower.contains("not the owner")
        || error_lower.contains("insufficient signatures")
        || error_lower.contains("invalid signature")
        || error_lower.contains("duplicate signer")
        || error_lower.contains("length mismatch")
        || error_lower.contains("unknown transfer")
    {
        return ErrorClass::Terminal;
    }

    ErrorClass::Unknown
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Retry after a backoff period
    RetryAfter(Duration),
    /// Stop; the error will not go away by retrying
    GiveUp,
}

/// Decide what to do after `attempt` failures with the given error class
pub fn next_action(config: &RetryConfig, class: ErrorClass, attempt: u32) -> RetryAction {
    if !class.is_retryable() || !config.should_retry(attempt) {
        return RetryAction::GiveUp;
    }
    RetryAction::RetryAfter(config.backoff_for_attempt(attempt.saturating_sub(1)))
}

/// Execute with retry logic
///
/// `operation` receives the 0-indexed attempt number.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let error_str = format!("{:#}", e);
                let class = classify_error(&error_str);
                attempt += 1;

                match next_action(config, class, attempt) {
                    RetryAction::RetryAfter(backoff) => {
                        warn!(
                            attempt,
                            max = config.max_retries,
                            ?backoff,
                            class = %class,
                            error = %error_str,
                            "Retrying after backoff"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    RetryAction::GiveUp => {
                        debug!(attempt, class = %class, "Giving up");
                        return Err(e.wrap_err(format!("giving up after {} attempt(s)", attempt)));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::eyre;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::for_submissions();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(classify_error("HTTP 429 Too Many Requests"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Infrastructure
        );
        assert_eq!(classify_error("nonce too low"), ErrorClass::Infrastructure);
        assert_eq!(
            classify_error("execution reverted: transfer not pending"),
            ErrorClass::AlreadyDone
        );
        assert_eq!(
            classify_error("execution reverted: signer not allowed"),
            ErrorClass::Terminal
        );
        assert_eq!(
            classify_error("execution reverted: insufficient signatures"),
            ErrorClass::Terminal
        );
        assert_eq!(classify_error("execution reverted"), ErrorClass::Unknown);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[test]
    fn test_next_action() {
        let config = RetryConfig::for_submissions();
        assert_eq!(
            next_action(&config, ErrorClass::Transient, 1),
            RetryAction::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            next_action(&config, ErrorClass::Unknown, 3),
            RetryAction::RetryAfter(Duration::from_secs(8))
        );
        assert_eq!(next_action(&config, ErrorClass::Unknown, 5), RetryAction::GiveUp);
        assert_eq!(next_action(&config, ErrorClass::Terminal, 1), RetryAction::GiveUp);
        assert_eq!(next_action(&config, ErrorClass::AlreadyDone, 1), RetryAction::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&RetryConfig::default(), move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(eyre!("connection reset"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&RetryConfig::default(), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(eyre!("execution reverted: signer not allowed"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = RetryConfig::default();
        let result: Result<()> = with_retry(&config, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(eyre!("request timed out"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), config.max_retries);
    }
}
