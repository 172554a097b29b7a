use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::drivers::error::ReadError;
use crate::types::Frame;

/// Uniform pull interface over every acquisition backend.
///
/// `read_frame` is the only call allowed to block. `Ok(None)` means the
/// source is exhausted. `close` releases backend resources and is called
/// exactly once by the run controller.
pub trait SourceAdapter: Send {
    fn read_frame(&mut self) -> Result<Option<Frame>, ReadError>;
    fn close(&mut self);
    fn describe(&self) -> String;
}

/// In-memory source useful for tests and deterministic playback.
pub struct ManualSource {
    queue: VecDeque<Result<Frame, ReadError>>,
    closes: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl ManualSource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            queue: frames.into_iter().map(Ok).collect(),
            closes: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queues a read failure after the frames pushed so far.
    pub fn push_error(&mut self, err: ReadError) {
        self.queue.push_back(Err(err));
    }

    /// Counter of `close` calls, readable after the source is moved away.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

impl SourceAdapter for ManualSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.queue.pop_front().transpose()
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        format!("manual source ({} queued)", self.queue.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_source_drains_then_ends() {
        let mut src = ManualSource::new(vec![Frame::new(1.0, vec![0], vec![vec![1.0]])]);
        src.push_error(ReadError::FeedClosed);
        assert!(src.read_frame().unwrap().is_some());
        assert!(matches!(src.read_frame(), Err(ReadError::FeedClosed)));
        assert!(src.read_frame().unwrap().is_none());
        assert_eq!(src.read_counter().load(Ordering::SeqCst), 3);
    }
}
