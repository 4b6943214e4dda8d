//! Skill executor: validate, invoke under a deadline, report exactly once.
//!
//! [`SkillExecutor::execute`] always returns one terminal [`ExecutionResult`]
//! and calls the capability at most once. Timed-out invocations are dropped,
//! not retried; side effects they already caused are not rolled back here.
//! A global semaphore bounds how many actions run at the same time across all
//! sessions.

mod sanitize;
mod validate;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::skills::capability::CapabilityError;
use crate::skills::{ActionDescriptor, BoundParams};

pub use self::sanitize::sanitize_output;
pub use self::validate::{ValidationError, validate};

/// Longest error message carried in [`ExecutionError`].
const MAX_ERROR_CHARS: usize = 500;

/// Failure class of an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    Failure,
    Cancelled,
    Unavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Timeout => write!(f, "timeout"),
            Self::Failure => write!(f, "failure"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The single terminal result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<ExecutionError>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ExecutionResult {
    fn succeeded(output: String, duration: Duration) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration,
        }
    }

    fn failed(kind: ErrorKind, message: String, output: String, duration: Duration) -> Self {
        let message: String = message.chars().take(MAX_ERROR_CHARS).collect();
        Self {
            success: false,
            output,
            error: Some(ExecutionError { kind, message }),
            duration,
        }
    }

    /// A validation failure, produced without invoking anything.
    pub fn invalid(error: &ValidationError) -> Self {
        Self::failed(
            ErrorKind::Validation,
            error.to_string(),
            error.to_string(),
            Duration::ZERO,
        )
    }

    /// The task running the capability died without producing a result.
    pub fn crashed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::failed(ErrorKind::Failure, message.clone(), message, Duration::ZERO)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Runs approved actions.
#[derive(Debug, Clone)]
pub struct SkillExecutor {
    limiter: Arc<Semaphore>,
    max_concurrent: usize,
    default_timeout: Duration,
    max_output_chars: usize,
}

impl SkillExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self::with_limits(
            config.max_concurrent_actions,
            config.default_action_timeout(),
            config.max_output_chars,
        )
    }

    pub fn with_limits(
        max_concurrent: usize,
        default_timeout: Duration,
        max_output_chars: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            default_timeout,
            max_output_chars,
        }
    }

    /// Actions currently holding an execution slot.
    pub fn running(&self) -> usize {
        self.max_concurrent - self.limiter.available_permits()
    }

    /// Deadline for `action`: explicit override, then the action's own
    /// timeout, then the configured default.
    pub fn deadline_for(&self, action: &ActionDescriptor, timeout: Option<Duration>) -> Duration {
        timeout.or(action.timeout).unwrap_or(self.default_timeout)
    }

    /// Validate `params` and invoke the action's capability once.
    pub async fn execute(
        &self,
        action: &ActionDescriptor,
        params: &BoundParams,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let qualified = action.qualified_name();

        let validated = match validate(action, params) {
            Ok(v) => v,
            Err(e) => {
                tracing::info!(action = qualified.as_str(), error = %e, "rejected invalid parameters");
                return ExecutionResult::invalid(&e);
            }
        };

        let queued = Instant::now();
        let _permit = tokio::select! {
            permit = self.limiter.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return ExecutionResult::failed(
                    ErrorKind::Unavailable,
                    "executor is shut down".into(),
                    String::new(),
                    queued.elapsed(),
                ),
            },
            _ = cancel.cancelled() => return ExecutionResult::failed(
                ErrorKind::Cancelled,
                "cancelled before start".into(),
                String::new(),
                queued.elapsed(),
            ),
        };

        let deadline = self.deadline_for(action, timeout);
        let invocation_cancel = cancel.child_token();
        let started = Instant::now();
        tracing::debug!(action = qualified.as_str(), deadline_ms = deadline.as_millis() as u64, "invoking capability");

        let outcome = tokio::time::timeout(
            deadline,
            action.capability.invoke(&validated, invocation_cancel.clone()),
        )
        .await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(raw)) => {
                ExecutionResult::succeeded(sanitize_output(&raw, self.max_output_chars), elapsed)
            }
            Ok(Err(CapabilityError::Cancelled)) => ExecutionResult::failed(
                ErrorKind::Cancelled,
                "cancelled".into(),
                String::new(),
                elapsed,
            ),
            Ok(Err(CapabilityError::Unavailable { message })) => {
                let message = sanitize_output(&message, self.max_output_chars);
                ExecutionResult::failed(ErrorKind::Unavailable, message.clone(), message, elapsed)
            }
            Ok(Err(CapabilityError::Failed { message })) => {
                let message = sanitize_output(&message, self.max_output_chars);
                ExecutionResult::failed(ErrorKind::Failure, message.clone(), message, elapsed)
            }
            Err(_) => {
                invocation_cancel.cancel();
                ExecutionResult::failed(
                    ErrorKind::Timeout,
                    format!("timed out after {}s", deadline.as_secs_f64()),
                    String::new(),
                    elapsed,
                )
            }
        };

        tracing::info!(
            action = qualified.as_str(),
            success = result.success,
            error_kind = ?result.error_kind(),
            duration_ms = result.duration_ms(),
            "action finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::skills::capability::FnCapability;
    use crate::skills::testing::{descriptor, string_param};
    use crate::skills::{ActionCategory, ValidatedParams};

    fn executor() -> SkillExecutor {
        SkillExecutor::with_limits(4, Duration::from_secs(5), 8000)
    }

    fn action_with<F, Fut>(f: F) -> ActionDescriptor
    where
        F: Fn(ValidatedParams, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, CapabilityError>> + Send + 'static,
    {
        let mut d = descriptor(
            "test",
            "run",
            ActionCategory::Read,
            false,
            vec![string_param("target", true)],
        );
        d.capability = Arc::new(FnCapability::new(f));
        d
    }

    #[tokio::test]
    async fn success_is_sanitized() {
        let action = action_with(|p, _| async move {
            Ok(format!("\x1b[1m{}\x1b[0m token=abc", p.render("target")))
        });
        let result = executor()
            .execute(
                &action,
                &BoundParams::default().with("target", "web"),
                None,
                CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.output, "web token=<REDACTED>");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn validation_failure_never_invokes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action = action_with(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(String::new()) }
        });
        let result = executor()
            .execute(&action, &BoundParams::default(), None, CancellationToken::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Validation));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action = action_with(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("late".to_string())
            }
        });
        let result = executor()
            .execute(
                &action,
                &BoundParams::default().with("target", "x"),
                Some(Duration::from_secs(2)),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_carries_detail() {
        let action = action_with(|_, _| async { Err(CapabilityError::failed("relation does not exist")) });
        let result = executor()
            .execute(
                &action,
                &BoundParams::default().with("target", "x"),
                None,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Failure));
        assert_eq!(result.error.unwrap().message, "relation does not exist");
    }

    #[tokio::test]
    async fn cancel_reaches_capability() {
        let action = action_with(|_, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err(CapabilityError::Cancelled)
        });
        let cancel = CancellationToken::new();
        let exec = executor();
        let handle = {
            let cancel = cancel.clone();
            let action = Arc::new(action);
            tokio::spawn(async move {
                exec.execute(
                    &action,
                    &BoundParams::default().with("target", "x"),
                    None,
                    cancel,
                )
                .await
            })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        let action = Arc::new(action_with(move |_, _| {
            let (f, p) = (f.clone(), p.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(String::new())
            }
        }));
        let exec = SkillExecutor::with_limits(2, Duration::from_secs(5), 100);

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let exec = exec.clone();
                let action = action.clone();
                tokio::spawn(async move {
                    exec.execute(
                        &action,
                        &BoundParams::default().with("target", "x"),
                        None,
                        CancellationToken::new(),
                    )
                    .await
                })
            })
            .collect();
        for t in tasks {
            assert!(t.await.unwrap().success);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(exec.running(), 0);
    }

    #[test]
    fn deadline_precedence() {
        let exec = executor();
        let mut action = action_with(|_, _| async { Ok(String::new()) });
        assert_eq!(exec.deadline_for(&action, None), Duration::from_secs(5));
        action.timeout = Some(Duration::from_secs(9));
        assert_eq!(exec.deadline_for(&action, None), Duration::from_secs(9));
        assert_eq!(
            exec.deadline_for(&action, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
    }
}
