//! Ordered queue of in-flight transfer tasks
//!
//! Tasks finish in any order; results are taken strictly in the order the
//! tasks were pushed, so a slow early block holds back later ones.

use std::collections::VecDeque;

use sdrive_core::{TransferError, TransferResult};
use tokio::task::JoinHandle;

pub(crate) struct PendingQueue<K, T> {
    tasks: VecDeque<(K, JoinHandle<TransferResult<T>>)>,
}

impl<K, T> PendingQueue<K, T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            tasks: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, key: K, task: JoinHandle<TransferResult<T>>) {
        self.tasks.push_back((key, task));
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Await the oldest task.
    ///
    /// Cancel safe: the task stays queued until its result is returned.
    pub(crate) async fn next(&mut self) -> Option<(K, TransferResult<T>)> {
        let (_, task) = self.tasks.front_mut()?;
        let result = join(task).await;
        let (key, _) = self.tasks.pop_front()?;
        Some((key, result))
    }

    /// Await every remaining task, discarding results.
    pub(crate) async fn settle(&mut self) {
        let tasks: Vec<_> = self.tasks.drain(..).map(|(_, task)| task).collect();
        futures::future::join_all(tasks).await;
    }
}

async fn join<T>(task: &mut JoinHandle<TransferResult<T>>) -> TransferResult<T> {
    task.await
        .map_err(|e| TransferError::Other(anyhow::anyhow!("transfer task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_follow_push_order() {
        let mut queue = PendingQueue::with_capacity(3);
        for (i, delay) in [(1u32, 30u64), (2, 0), (3, 10)] {
            queue.push(
                i,
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(i * 10)
                }),
            );
        }

        let mut order = Vec::new();
        while let Some((key, result)) = queue.next().await {
            order.push((key, result.unwrap()));
        }
        assert_eq!(order, vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[tokio::test]
    async fn test_abandoned_wait_keeps_the_task() {
        let mut queue = PendingQueue::with_capacity(1);
        queue.push(
            7u32,
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok("done")
            }),
        );

        let early = tokio::time::timeout(Duration::from_millis(1), queue.next()).await;
        assert!(early.is_err());
        assert_eq!(queue.len(), 1);

        let (key, result) = queue.next().await.unwrap();
        assert_eq!((key, result.unwrap()), (7, "done"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_settle_awaits_everything() {
        let finished = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut queue = PendingQueue::with_capacity(2);
        for i in 0..2u32 {
            let finished = finished.clone();
            queue.push(
                i,
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    finished.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err::<(), _>(TransferError::Cancelled)
                }),
            );
        }

        queue.settle().await;
        assert_eq!(queue.len(), 0);
        assert_eq!(finished.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicked_task_is_an_error() {
        let mut queue: PendingQueue<u32, ()> = PendingQueue::with_capacity(1);
        queue.push(
            1,
            tokio::spawn(async {
                if true {
                    panic!("boom");
                }
                Ok(())
            }),
        );

        let (_, result) = queue.next().await.unwrap();
        assert!(matches!(result, Err(TransferError::Other(_))));
    }
}
