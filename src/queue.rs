//! Single-consumer task queue serializing exclusive adapter access (§4.5).
//! One worker task drains an `mpsc` channel of boxed async closures; callers
//! get a `oneshot` back per submission, the same request/response shape the
//! teacher's `pairing.rs` uses for `submit_pair_request`/`signal_approval`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::ble::BlePort;
use crate::error::BridgeError;

type BoxedTask = Box<dyn FnOnce() -> BoxedTaskFuture + Send>;

/// The boxed future every queued task returns. Exposed so callers can
/// annotate their closures and get the `Box::pin(async move {...})` coercion
/// to the trait object for free.
pub type BoxedTaskFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BridgeError>> + Send>>;

struct QueueItem {
    task: BoxedTask,
    reply: oneshot::Sender<Result<(), BridgeError>>,
}

/// Handle callers use to submit work; cloning is cheap, the sender end of the
/// worker's channel.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

/// How long the worker waits for the next task before resuming scanning and
/// disconnecting everything (§4.5 step 4).
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

impl TaskQueue {
    /// Spawns the worker and begins scanning immediately (§4.5 step 1).
    pub fn spawn(adapter: Arc<dyn BlePort>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem>();

        tokio::spawn(async move {
            if let Err(err) = adapter.scan_start().await {
                warn!(%err, "initial scan_start failed");
            }

            loop {
                let next = timeout(IDLE_TIMEOUT, rx.recv()).await;
                let item = match next {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(_) => {
                        debug!("queue idle, resuming scan");
                        if let Err(err) = adapter.scan_start().await {
                            warn!(%err, "idle-resume scan_start failed");
                        }
                        match rx.recv().await {
                            Some(item) => item,
                            None => break,
                        }
                    }
                };

                if let Err(err) = adapter.scan_stop().await {
                    warn!(%err, "scan_stop before task failed");
                }

                let result = (item.task)().await;
                if let Err(ref err) = result {
                    warn!(%err, "task failed");
                }
                let _ = item.reply.send(result);
            }
        });

        Self { tx }
    }

    /// Enqueues a task, returning a future resolved with its result (§4.5 step 5).
    pub async fn add_task<F>(&self, task: F) -> Result<(), BridgeError>
    where
        F: FnOnce() -> BoxedTaskFuture + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = QueueItem {
            task: Box::new(task),
            reply: reply_tx,
        };
        self.tx
            .send(item)
            .map_err(|_| BridgeError::ScanFailed("queue worker has shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| BridgeError::ScanFailed("queue worker dropped the reply channel".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::test::FakeAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// S6-adjacent property (§8): tasks run one at a time; a second task only
    /// starts after the first's future resolves.
    #[test_log::test(tokio::test)]
    async fn tasks_run_sequentially() {
        let adapter: Arc<dyn BlePort> = Arc::new(FakeAdapter::default());
        let queue = TaskQueue::spawn(adapter);

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let o1 = order.clone();
        let c1 = counter.clone();
        queue
            .add_task(move || -> BoxedTaskFuture {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    c1.fetch_add(1, Ordering::SeqCst);
                    o1.lock().unwrap().push(1);
                    Ok(())
                })
            })
            .await
            .unwrap();

        let o2 = order.clone();
        queue
            .add_task(move || -> BoxedTaskFuture {
                Box::pin(async move {
                    o2.lock().unwrap().push(2);
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    /// S6 Scanner exclusivity (§8): the adapter is never scanning while a
    /// task is running, and scanning resumes once the queue drains.
    #[test_log::test(tokio::test)]
    async fn scanning_stops_for_the_duration_of_a_task() {
        let adapter = Arc::new(FakeAdapter::default());
        let queue = TaskQueue::spawn(adapter.clone());

        // Give the spawned worker a moment to run its initial scan_start.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(*adapter.scanning.lock().await);

        let observed_during_task = Arc::new(std::sync::Mutex::new(None));
        let observed = observed_during_task.clone();
        let adapter_for_task = adapter.clone();
        queue
            .add_task(move || -> BoxedTaskFuture {
                Box::pin(async move {
                    *observed.lock().unwrap() = Some(*adapter_for_task.scanning.lock().await);
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(*observed_during_task.lock().unwrap(), Some(false));
    }
}
