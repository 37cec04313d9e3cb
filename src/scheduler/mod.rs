use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::warn;

/// Bounded worker pool for one stage. Each work unit is one message transfer
/// or one folder listing; units are independent, there is no work stealing.
/// The pool inserts the inter-request delay between dispatches and drains all
/// completions before returning; cancellation stops new dispatches but never
/// interrupts an in-flight unit.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    request_delay: Duration,
    cancelled: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(parallelism: usize, request_delay: Duration, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            request_delay,
            cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run the units with bounded parallelism and return the completed
    /// results (in completion order). Units never dispatched because of
    /// cancellation are dropped.
    pub async fn dispatch<T, F>(&self, units: Vec<F>) -> Vec<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let mut set: JoinSet<T> = JoinSet::new();
        let mut results = Vec::new();
        let mut first = true;

        for unit in units {
            if self.is_cancelled() {
                warn!("cancellation requested, not dispatching remaining work");
                break;
            }
            if !first {
                sleep(self.request_delay).await;
            }
            first = false;

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                // The semaphore is never closed while the pool is alive.
                break;
            };
            set.spawn(async move {
                let _permit = permit;
                unit.await
            });

            while let Some(done) = set.try_join_next() {
                match done {
                    Ok(value) => results.push(value),
                    Err(error) => warn!("work unit panicked: {error}"),
                }
            }
        }

        while let Some(done) = set.join_next().await {
            match done {
                Ok(value) => results.push(value),
                Err(error) => warn!("work unit panicked: {error}"),
            }
        }

        results
    }
}
