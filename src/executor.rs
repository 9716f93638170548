use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A bounded pool for one pipeline stage: caching, loading, decoding
/// or processing each get their own `StageExecutor` so a burst of requests on
/// one stage can't starve the others.
///
/// Each unit is a plain `tokio::task::spawn` + `JoinHandle` pair, gated by a
/// `Semaphore` for bounded concurrency and paired with a `CancellationToken`
/// for cooperative cancel.
pub struct StageExecutor {
    name: &'static str,
    semaphore: Arc<Semaphore>,
}

impl StageExecutor {
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        Self { name, semaphore: Arc::new(Semaphore::new(concurrency.max(1))) }
    }

    /// Runs a plain unit: a synchronous body that, once started, always runs
    /// to completion. Cancelling before the concurrency slot is granted
    /// pre-empts it entirely; cancelling after it has started has no effect.
    pub fn spawn_plain<T, F>(&self, token: CancellationToken, body: F) -> Cancellable<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard_token = token.clone();
        self.spawn(token, async move {
            if guard_token.is_cancelled() {
                None
            } else {
                Some(body())
            }
        })
    }

    /// Runs an async unit: a future raced against the cancellation token.
    /// Whichever resolves first wins, but the task always completes (so the
    /// concurrency slot is always released, satisfying the "fulfill must
    /// still fire" requirement for async units).
    pub fn spawn_async<T, Fut>(&self, token: CancellationToken, body: Fut) -> Cancellable<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let select_token = token.clone();
        self.spawn(token, async move {
            tokio::select! {
                biased;
                _ = select_token.cancelled() => None,
                value = body => Some(value),
            }
        })
    }

    fn spawn<T>(&self, token: CancellationToken, fut: impl Future<Output = Option<T>> + Send + 'static) -> Cancellable<T>
    where
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let name = self.name;
        let handle = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return None,
            };
            tracing::trace!(executor = name, "stage unit running");
            fut.await
        });
        Cancellable { handle, token }
    }
}

/// A handle to a unit running on a `StageExecutor`. Dropping it leaves the
/// unit running; call `cancel()` explicitly to request early exit, and
/// `join()` to wait for (and consume) the result.
pub struct Cancellable<T> {
    handle: JoinHandle<Option<T>>,
    token: CancellationToken,
}

impl<T> Cancellable<T> {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Awaits the unit. Returns `None` if it was cancelled (or the executor
    /// task panicked, which we treat the same as "produced nothing").
    pub async fn join(self) -> Option<T> {
        match self.handle.await {
            Ok(value) => value,
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn plain_unit_runs_to_completion() {
        let executor = StageExecutor::new("test", 2);
        let token = CancellationToken::new();
        let result = executor.spawn_plain(token, || 42).join().await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn plain_unit_preempted_before_start() {
        let executor = StageExecutor::new("test", 1);
        let token = CancellationToken::new();
        token.cancel();
        let result = executor.spawn_plain(token, || 42).join().await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn async_unit_cancelled_midway_still_releases_slot() {
        let executor = StageExecutor::new("test", 1);
        let token = CancellationToken::new();
        let unit = executor.spawn_async(token.clone(), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "never"
        });
        unit.cancel();
        let result = unit.join().await;
        assert_eq!(result, None);

        // the permit must have come back; a second unit should run immediately.
        let second = executor
            .spawn_async(CancellationToken::new(), async { "second" })
            .join()
            .await;
        assert_eq!(second, Some("second"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let executor = Arc::new(StageExecutor::new("test", 1));
        let started = Arc::new(tokio::sync::Semaphore::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let s1 = started.clone();
        let r1 = release.clone();
        let first = executor.spawn_async(CancellationToken::new(), async move {
            s1.add_permits(1);
            r1.notified().await;
            1
        });

        // give the first unit a chance to grab the only permit
        let _ = started.acquire().await.unwrap();

        let second = executor.spawn_async(CancellationToken::new(), async { 2 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.handle.is_finished());

        release.notify_one();
        assert_eq!(first.join().await, Some(1));
        assert_eq!(second.join().await, Some(2));
    }
}
