//! In-process ready queue.
//!
//! A FIFO of job ids. The store stays authoritative: an id popped here is
//! only a hint, and a worker that fails to claim it drops it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::jobs::JobId;

#[derive(Debug, Default)]
pub struct ReadyQueue {
    items: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: JobId) {
        self.items.lock().push_back(id);
        self.notify.notify_one();
    }

    /// Append in order, waking one waiter per id.
    pub fn extend(&self, ids: impl IntoIterator<Item = JobId>) {
        let mut added = 0;
        {
            let mut items = self.items.lock();
            for id in ids {
                items.push_back(id);
                added += 1;
            }
        }
        for _ in 0..added {
            self.notify.notify_one();
        }
    }

    pub fn pop(&self) -> Option<JobId> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Resolves after the next push, or at once if a push happened since
    /// the last wakeup was consumed.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wake one waiter without pushing; used to hand leftover work on.
    pub fn nudge(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = ReadyQueue::new();
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        queue.extend(ids.clone());
        assert_eq!(queue.len(), 3);
        let popped: Vec<JobId> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, ids);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_before_wait_is_not_lost() {
        let queue = ReadyQueue::new();
        queue.push(JobId::new());
        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .expect("stored wakeup");
    }

    #[test]
    fn test_wait_pends_until_push() {
        let queue = ReadyQueue::new();
        let mut wait = tokio_test::task::spawn(queue.wait());
        tokio_test::assert_pending!(wait.poll());

        queue.push(JobId::new());
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }
}
