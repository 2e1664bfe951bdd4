//! Thread-safe outgoing command buffer. Every enqueue runs through the
//! merger, so the buffer holds the minimal command sequence for the edits
//! made since the last drain.

use parking_lot::Mutex;

use tidepool_proto::Command;

use crate::merge::merge_into;

/// Fires once after the net effect of the enqueued command has completed
/// its round trip, even if the command itself was merged away.
pub type Completion = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct QueueInner {
    commands: Vec<Command>,
    completions: Vec<Completion>,
}

#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends under the queue lock, applying the merger against the
    /// current buffer. Returns whether the buffer was empty before the
    /// add; the caller uses that to decide whether a dormant sender
    /// needs a nudge.
    pub fn enqueue(&self, command: Command, on_complete: Option<Completion>) -> bool {
        let mut inner = self.inner.lock();
        let was_empty = inner.commands.is_empty();
        merge_into(&mut inner.commands, command);
        if let Some(completion) = on_complete {
            inner.completions.push(completion);
        }
        was_empty
    }

    /// Atomically empties the buffer. Completions are returned in original
    /// enqueue order; the transport fires them once the round trip carrying
    /// the surviving commands finishes.
    pub fn drain(&self) -> (Vec<Command>, Vec<Completion>) {
        let mut inner = self.inner.lock();
        (
            std::mem::take(&mut inner.commands),
            std::mem::take(&mut inner.completions),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().commands.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tidepool_proto::{BeanId, PmValue};

    fn value_changed(old: i64, new: i64) -> Command {
        Command::ValueChanged {
            bean_id: BeanId(1),
            attribute: "x".into(),
            old_value: PmValue::Int(old),
            new_value: PmValue::Int(new),
        }
    }

    #[test]
    fn reports_whether_buffer_was_empty() {
        let queue = CommandQueue::new();
        assert!(queue.enqueue(value_changed(0, 1), None));
        assert!(!queue.enqueue(value_changed(1, 2), None));
        queue.drain();
        assert!(queue.enqueue(value_changed(2, 3), None));
    }

    #[test]
    fn merged_away_completion_still_fires_exactly_once() {
        let queue = CommandQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for (old, new) in [(0, 1), (1, 0)] {
            let counter = Arc::clone(&fired);
            queue.enqueue(
                value_changed(old, new),
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }

        let (commands, completions) = queue.drain();
        // the pair collapsed to nothing, but both completions survive
        assert!(commands.is_empty());
        assert_eq!(completions.len(), 2);
        for completion in completions {
            completion();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let (_, leftover) = queue.drain();
        assert!(leftover.is_empty());
    }

    #[test]
    fn drain_empties_the_buffer() {
        let queue = CommandQueue::new();
        queue.enqueue(value_changed(0, 1), None);
        queue.enqueue(Command::StartLongPoll, None);
        let (commands, _) = queue.drain();
        assert_eq!(commands.len(), 2);
        assert!(queue.is_empty());
    }
}
