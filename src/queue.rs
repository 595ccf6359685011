//! Bounded command queue between producers and upload workers.
//!
//! Producers never block: `put` fails fast once the channel is at capacity.
//! The client keeps one receiver clone of its own so that the channel stays
//! connected after workers exit; late producers then observe capacity limits
//! rather than a disconnect.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::error::ClientError;
use crate::event::Event;

/// Commands processed by upload workers.
pub(crate) enum Command {
    Message(Box<Event>),
    Flush(Sender<()>),
    Shutdown(Sender<()>),
}

/// Bounded FIFO shared between the facade and its workers.
pub(crate) struct MessageQueue {
    tx: Sender<Command>,
    rx: Receiver<Command>,
}

impl MessageQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Non-blocking enqueue; fails fast when the queue is full.
    pub fn put(&self, event: Event) -> Result<(), ClientError> {
        match self.tx.try_send(Command::Message(Box::new(event))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ClientError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ClientError::Closed),
        }
    }

    pub fn sender(&self) -> Sender<Command> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<Command> {
        self.rx.clone()
    }

    /// Advisory count of pending commands (racy).
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
