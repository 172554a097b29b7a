use std::fmt;
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::sync::{Arc, Mutex};

use crate::drivers::error::{OpenError, ReadError};
use crate::drivers::source::SourceAdapter;
use crate::types::Frame;

/// Receiving end of an external frame feed.
#[derive(Clone)]
pub struct FeedHandle {
    name: String,
    rx: Arc<Mutex<Receiver<Frame>>>,
}

impl fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedHandle").field("name", &self.name).finish()
    }
}

impl FeedHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Publishing end handed to the pub/sub collaborator.
#[derive(Clone, Debug)]
pub struct FeedPublisher {
    tx: Sender<Frame>,
}

impl FeedPublisher {
    pub fn publish(&self, frame: Frame) -> Result<(), SendError<Frame>> {
        self.tx.send(frame)
    }
}

pub fn feed_channel(name: impl Into<String>) -> (FeedPublisher, FeedHandle) {
    let (tx, rx) = mpsc::channel();
    (
        FeedPublisher { tx },
        FeedHandle {
            name: name.into(),
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Feed backend: blocks until the next published frame. Never ends on its own.
pub struct FeedSource {
    handle: FeedHandle,
}

impl FeedSource {
    pub fn open(handle: FeedHandle) -> Result<Self, OpenError> {
        Ok(Self { handle })
    }
}

impl SourceAdapter for FeedSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        let rx = self.handle.rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.recv().map(Some).map_err(|_| ReadError::FeedClosed)
    }

    fn close(&mut self) {}

    fn describe(&self) -> String {
        format!("feed {}", self.handle.name())
    }
}
