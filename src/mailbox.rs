//! Bounded per-client delivery queues.
//!
//! The hub is the only producer of a mailbox and the client's writer pump is the
//! only consumer. Delivering never waits: when the queue is full the configured
//! [`DropPolicy`] decides which event is lost, so one stalled client cannot hold up
//! the hub.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// What to do with an event offered to a full mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Evict the oldest pending event to make room for the new one.
    #[default]
    Oldest,
    /// Keep the pending events and discard the new one.
    Newest,
}

/// Why an event was not queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MailboxError {
    /// The mailbox was full and the incoming event was dropped.
    #[error("mailbox full, event dropped")]
    Full,
    /// The consuming writer pump is gone.
    #[error("mailbox closed")]
    Closed,
}

/// Producer half, held by the hub's roster.
#[derive(Debug)]
pub struct MailboxSender {
    inner: SenderInner,
}

#[derive(Debug)]
enum SenderInner {
    Oldest(broadcast::Sender<Event>),
    Newest(mpsc::Sender<Event>),
}

/// Consumer half, drained by the client's writer pump.
#[derive(Debug)]
pub struct MailboxReceiver {
    inner: ReceiverInner,
    dropped: u64,
}

#[derive(Debug)]
enum ReceiverInner {
    Oldest(broadcast::Receiver<Event>),
    Newest(mpsc::Receiver<Event>),
}

/// Creates a mailbox holding at most `capacity` pending events.
///
/// With [`DropPolicy::Oldest`] the queue is a lagging ring buffer whose size is
/// `capacity` rounded up to the next power of two.
///
/// # Panics
/// Panics if `capacity` is zero. Configuration loading rejects that value.
pub fn mailbox(capacity: usize, policy: DropPolicy) -> (MailboxSender, MailboxReceiver) {
    match policy {
        DropPolicy::Oldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (
                MailboxSender {
                    inner: SenderInner::Oldest(tx),
                },
                MailboxReceiver {
                    inner: ReceiverInner::Oldest(rx),
                    dropped: 0,
                },
            )
        }
        DropPolicy::Newest => {
            let (tx, rx) = mpsc::channel(capacity);
            (
                MailboxSender {
                    inner: SenderInner::Newest(tx),
                },
                MailboxReceiver {
                    inner: ReceiverInner::Newest(rx),
                    dropped: 0,
                },
            )
        }
    }
}

impl MailboxSender {
    /// Offers an event without waiting.
    pub fn deliver(&self, event: Event) -> Result<(), MailboxError> {
        match &self.inner {
            SenderInner::Oldest(tx) => tx.send(event).map(|_| ()).map_err(|_| MailboxError::Closed),
            SenderInner::Newest(tx) => tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => MailboxError::Full,
                mpsc::error::TrySendError::Closed(_) => MailboxError::Closed,
            }),
        }
    }

    pub fn policy(&self) -> DropPolicy {
        match self.inner {
            SenderInner::Oldest(_) => DropPolicy::Oldest,
            SenderInner::Newest(_) => DropPolicy::Newest,
        }
    }
}

impl MailboxReceiver {
    /// Waits for the next pending event. Returns `None` once the hub has dropped
    /// the producer half and the queue is drained.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Event> {
        match &mut self.inner {
            ReceiverInner::Oldest(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Mailbox lagged behind, {} oldest events dropped.", missed);
                        self.dropped += missed;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            ReceiverInner::Newest(rx) => rx.recv().await,
        }
    }

    /// Number of events evicted before this consumer could read them.
    ///
    /// Only the drop-oldest policy is observed here; with drop-newest the hub
    /// sees the loss when delivery fails.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
