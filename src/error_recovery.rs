//! Retry policies for orchestration steps.
//
// Retries here sit on top of the transport: one attempt is typically a write followed
// by a stability-gated readback. The transport's own reconnect behaviour is out of scope.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Defines a policy for retrying an operation.
///
/// Specifies how many times to attempt a failing operation and how long to wait
/// between attempts.
///
/// # Example
///
/// ```rust
/// use rfw_scope_daq::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.max_attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    ///
    /// A value of 0 is treated as 1: every operation is tried at least once.
    pub max_attempts: u32,

    /// The delay between attempts.
    ///
    /// Uses a constant backoff strategy.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Creates a default retry policy.
    ///
    /// Default policy makes 3 attempts with 100ms delay between attempts.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rfw_scope_daq::error_recovery::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.max_attempts, 3);
    /// assert_eq!(policy.backoff_delay, Duration::from_millis(100));
    /// ```
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Errors that know whether another attempt could help.
pub trait Retryable {
    /// `true` if the failure is transient.
    fn is_retryable(&self) -> bool;
}

/// Result of [`retry_with_policy`] together with the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result: the first success, or the error of the last attempt.
    pub result: Result<T, E>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, the policy is
/// exhausted or `cancel` fires.
///
/// The operation receives the 1-based attempt number. Cancellation is only observed
/// during the backoff pause; the operation itself is expected to watch the token.
///
/// # Example
///
/// ```rust,ignore
/// let outcome = retry_with_policy(&policy, &cancel, |attempt| async move {
///     reader.read_stable(pv, timeout, &criterion, &cancel).await
/// })
/// .await;
/// ```
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Retryable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = operation(attempt).await;
        let give_up = match &result {
            Ok(_) => true,
            Err(err) => !err.is_retryable() || attempt >= max_attempts,
        };
        if give_up {
            return RetryOutcome {
                result,
                attempts: attempt,
            };
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result,
                    attempts: attempt,
                };
            }
            _ = sleep(policy.backoff_delay) => {}
        }
        attempt += 1;
    }
}
