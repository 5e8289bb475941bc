use std::future::Future;
use std::sync::Mutex;

use support::time::Duration;
use tokio::time::Instant;

use crate::error::UpdateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshKind {
    /// Timer tick or direct refresh: always runs its own fetch.
    Forced,
    /// On-demand request: adopts the outcome of a refresh that completed
    /// while this one waited, and honors the minimum fetch interval.
    Requested,
}

pub(crate) enum Flight<T> {
    /// This caller ran the fetch; the outcome has not been applied yet.
    Led(Result<T, UpdateError>),
    /// Another caller's refresh completed while this one waited. Its
    /// outcome was already applied by that caller.
    Coalesced(Result<T, UpdateError>),
    /// Too soon after the previous fetch; the last outcome stands.
    Throttled,
}

/// Runs the fetch operation of one source: strictly serialized, bounded by
/// a timeout, with request coalescing and a one-shot credential renewal on
/// authentication failures.
pub(crate) struct RefreshExecutor<T> {
    fetch_timeout: Duration,
    min_refresh_interval: Option<Duration>,
    running: tokio::sync::Mutex<()>,
    completed: Mutex<CompletedFlight<T>>,
}

struct CompletedFlight<T> {
    count: u64,
    finished_at: Option<Instant>,
    outcome: Option<Result<T, UpdateError>>,
}

impl<T: Clone> RefreshExecutor<T> {
    pub fn new(fetch_timeout: Duration, min_refresh_interval: Option<Duration>) -> Self {
        Self {
            fetch_timeout,
            min_refresh_interval,
            running: tokio::sync::Mutex::new(()),
            completed: Mutex::new(CompletedFlight {
                count: 0,
                finished_at: None,
                outcome: None,
            }),
        }
    }

    pub async fn execute<F, Fut, R, RFut>(&self, kind: RefreshKind, fetch: F, reauthorize: R) -> Flight<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, UpdateError>>,
        R: FnOnce() -> RFut,
        RFut: Future<Output = Result<bool, UpdateError>>,
    {
        let observed_count = self.completed().count;

        let _running = self.running.lock().await;

        if kind == RefreshKind::Requested {
            let completed = self.completed();

            if completed.count != observed_count {
                if let Some(outcome) = completed.outcome.clone() {
                    return Flight::Coalesced(outcome);
                }
            }

            if let (Some(min_interval), Some(finished_at)) =
                (self.min_refresh_interval, completed.finished_at)
            {
                if completed.outcome.is_some() && finished_at.elapsed() < min_interval.into() {
                    return Flight::Throttled;
                }
            }
        }

        let outcome = self.fetch_with_timeout(&fetch).await;

        //One renewal attempt for rejected credentials, then one retry
        let outcome = match outcome {
            Err(original) if original.is_auth() => match reauthorize().await {
                Ok(true) => {
                    tracing::info!("Credentials renewed, retrying the rejected fetch once");
                    self.fetch_with_timeout(&fetch).await
                }
                Ok(false) => Err(original),
                Err(renewal_error) => {
                    tracing::warn!("Credential renewal failed: {}", renewal_error);
                    Err(original)
                }
            },
            other => other,
        };

        {
            let mut completed = self.completed();
            completed.count += 1;
            completed.finished_at = Some(Instant::now());
            completed.outcome = Some(outcome.clone());
        }

        Flight::Led(outcome)
    }

    async fn fetch_with_timeout<F, Fut>(&self, fetch: &F) -> Result<T, UpdateError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, UpdateError>>,
    {
        match tokio::time::timeout(self.fetch_timeout.into(), fetch()).await {
            Ok(result) => result,
            Err(_) => Err(UpdateError::Timeout(self.fetch_timeout)),
        }
    }

    fn completed(&self) -> std::sync::MutexGuard<'_, CompletedFlight<T>> {
        self.completed.lock().expect("completed flight lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn count_fetches<'a>(
        calls: &'a AtomicUsize,
        result: Result<u32, UpdateError>,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, UpdateError>> + Send>> + 'a
    {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let result = result.clone();
            Box::pin(async move { result })
        }
    }

    async fn no_reauth() -> Result<bool, UpdateError> {
        Ok(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_classified() {
        let executor: RefreshExecutor<u32> = RefreshExecutor::new(Duration::seconds(5), None);

        let flight = executor
            .execute(
                RefreshKind::Forced,
                || async {
                    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                    Ok(1)
                },
                no_reauth,
            )
            .await;

        match flight {
            Flight::Led(Err(UpdateError::Timeout(limit))) => {
                assert_eq!(limit, Duration::seconds(5))
            }
            _ => panic!("expected a timeout outcome"),
        }
    }

    #[tokio::test]
    async fn test_requested_refresh_is_throttled() {
        let calls = AtomicUsize::new(0);
        let executor: RefreshExecutor<u32> =
            RefreshExecutor::new(Duration::seconds(5), Some(Duration::seconds(10)));

        let first = executor
            .execute(RefreshKind::Requested, count_fetches(&calls, Ok(1)), no_reauth)
            .await;
        let second = executor
            .execute(RefreshKind::Requested, count_fetches(&calls, Ok(2)), no_reauth)
            .await;

        assert!(matches!(first, Flight::Led(Ok(1))));
        assert!(matches!(second, Flight::Throttled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_refresh_ignores_throttle() {
        let calls = AtomicUsize::new(0);
        let executor: RefreshExecutor<u32> =
            RefreshExecutor::new(Duration::seconds(5), Some(Duration::seconds(10)));

        executor
            .execute(RefreshKind::Forced, count_fetches(&calls, Ok(1)), no_reauth)
            .await;
        executor
            .execute(RefreshKind::Forced, count_fetches(&calls, Ok(2)), no_reauth)
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_renews_and_retries_once() {
        let calls = AtomicUsize::new(0);
        let renewals = AtomicUsize::new(0);
        let executor: RefreshExecutor<u32> = RefreshExecutor::new(Duration::seconds(5), None);

        let flight = executor
            .execute(
                RefreshKind::Forced,
                || {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err(UpdateError::auth("token expired"))
                        } else {
                            Ok(7)
                        }
                    }
                },
                || {
                    renewals.fetch_add(1, Ordering::SeqCst);
                    async { Ok(true) }
                },
            )
            .await;

        assert!(matches!(flight, Flight::Led(Ok(7))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_without_renewal_stays_auth() {
        let calls = AtomicUsize::new(0);
        let executor: RefreshExecutor<u32> = RefreshExecutor::new(Duration::seconds(5), None);

        let flight = executor
            .execute(
                RefreshKind::Forced,
                count_fetches(&calls, Err(UpdateError::auth("rejected"))),
                no_reauth,
            )
            .await;

        assert!(matches!(flight, Flight::Led(Err(UpdateError::Auth(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
