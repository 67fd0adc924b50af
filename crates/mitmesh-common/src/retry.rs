//! Retry utilities with exponential backoff and jitter.
//!
//! Every control-plane call in mitmesh goes through [`retry_transient`], which
//! retries only errors that [`Error::is_retryable`] classifies as transient.
//! Permanent errors (4xx, domain errors) surface on the first attempt.
//!
//! # Example
//!
//! ```ignore
//! use mitmesh_common::retry::{retry_transient, RetryConfig};
//!
//! let ns = retry_transient(&RetryConfig::control_plane(), "get-namespace", || async {
//!     api.get_opt("mitmproxy").await.map_err(Error::from)
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Bounded policy for blocking control-plane requests.
    ///
    /// A run is operator-driven, so it must eventually fail rather than spin.
    pub fn control_plane() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation with backoff, retrying only errors for which
/// `should_retry` returns true. Other errors are returned immediately.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Retry an operation returning [`Error`] while the error is transient.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    retry_with_backoff_if(config, operation_name, Error::is_retryable, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    fn unavailable() -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd leader changed".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        }))
    }

    #[tokio::test]
    async fn succeeds_without_retrying() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_transient(&fast(3), "get-namespace", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_transient(&fast(3), "list-pods", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn custom_predicate_decides_what_retries() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_with_backoff_if(&fast(5), "op", |e: &&str| *e == "busy", || {
                let c = c.clone();
                async move {
                    match c.fetch_add(1, Ordering::SeqCst) {
                        0 => Err("busy"),
                        _ => Err("denied"),
                    }
                }
            })
            .await;

        assert_eq!(result, Err("denied"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_transient(&fast(5), "get-namespace", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unavailable())
                } else {
                    Ok("mitmproxy")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "mitmproxy");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_fail_on_first_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_transient(&fast(5), "find-deployment", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::deployment_not_found("mitmproxy", "app=mitmproxy"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::DeploymentNotFound { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
