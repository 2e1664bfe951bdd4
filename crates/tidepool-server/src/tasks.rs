//! The parked long-poll execution primitive. A `StartLongPoll` worker
//! parks here until a task becomes runnable, the poll bound elapses or an
//! out-of-band interrupt arrives; foreign threads push work through
//! [`TaskQueue::push`] and the parked worker runs it inside the session's
//! active guard.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::session::SessionState;

/// Work executed on the parked long-poll worker. Commands produced by its
/// model mutations ride back on the long-poll response.
pub type SessionTask = Box<dyn FnOnce(&mut SessionState) + Send>;

#[derive(Default)]
struct TaskQueueInner {
    tasks: VecDeque<SessionTask>,
    interrupted: bool,
}

#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<TaskQueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a task and wakes the parked worker, if any. Safe from any
    /// thread; the task itself only ever runs under the session guard.
    pub fn push(&self, task: SessionTask) {
        self.inner.lock().tasks.push_back(task);
        self.notify.notify_one();
    }

    /// Releases the parked long poll without queueing work. The flag is
    /// sticky until consumed, so an interrupt landing just before the park
    /// still releases it.
    pub fn interrupt(&self) {
        self.inner.lock().interrupted = true;
        self.notify.notify_one();
    }

    /// Consumes a pending interrupt.
    pub fn take_interrupt(&self) -> bool {
        std::mem::take(&mut self.inner.lock().interrupted)
    }

    pub fn pop(&self) -> Option<SessionTask> {
        self.inner.lock().tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }

    /// Parks until the next push or interrupt. The caller re-checks the
    /// queue state after waking; `Notify` holds at most one permit, so a
    /// signal sent before the park is not lost.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn interrupt_flag_is_sticky_and_consumed_once() {
        let queue = TaskQueue::new();
        assert!(!queue.take_interrupt());
        queue.interrupt();
        assert!(queue.take_interrupt());
        assert!(!queue.take_interrupt());
    }

    #[tokio::test]
    async fn push_before_park_is_not_lost() {
        let queue = TaskQueue::new();
        queue.push(Box::new(|_| {}));
        // permit stored by the push above; this must not hang
        tokio::time::timeout(Duration::from_secs(1), queue.notified())
            .await
            .expect("notified");
        assert!(queue.pop().is_some());
        assert!(queue.is_empty());
    }
}
