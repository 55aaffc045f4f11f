//! The broadcast hub.
//!
//! A [`Hub`] is a cheap, cloneable handle that submits requests to a single
//! [`HubLoop`]. The loop owns the roster and handles one request at a time, which
//! gives every registration, deregistration and broadcast a total order without
//! any lock on the roster.

use crate::event::Event;
use crate::mailbox::{MailboxError, MailboxSender};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch::Receiver as WatchReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identity of one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A registered viewer: its identity and the producer half of its mailbox.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    mailbox: MailboxSender,
}

impl Client {
    pub fn new(id: ClientId, mailbox: MailboxSender) -> Self {
        Self { id, mailbox }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }
}

/// Returned by every hub request once the hub loop has stopped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("hub is no longer running")]
pub struct HubClosed;

enum Command {
    Register(Client),
    Unregister(ClientId),
    Broadcast(Event),
    Roster(oneshot::Sender<Vec<ClientId>>),
}

/// Handle for submitting requests to the hub loop.
#[derive(Debug, Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register(client) => write!(f, "Register({})", client.id),
            Command::Unregister(id) => write!(f, "Unregister({})", id),
            Command::Broadcast(event) => write!(f, "Broadcast({})", event),
            Command::Roster(_) => f.write_str("Roster"),
        }
    }
}

impl Hub {
    /// Creates a hub handle and the loop that serves it.
    ///
    /// `queue` bounds the number of pending requests; callers wait for space when
    /// the loop falls behind.
    pub fn new(queue: usize) -> (Hub, HubLoop) {
        let (commands, rx) = mpsc::channel(queue);
        (
            Hub {
                commands,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            HubLoop {
                commands: rx,
                roster: HashMap::new(),
            },
        )
    }

    /// Creates a hub and spawns its loop on the current runtime.
    pub fn spawn(queue: usize, shutdown_signal: WatchReceiver<bool>) -> (Hub, JoinHandle<()>) {
        let (hub, hub_loop) = Hub::new(queue);
        let handle = tokio::spawn(hub_loop.run(shutdown_signal));
        (hub, handle)
    }

    /// Allocates an identity for a client that is about to be admitted.
    pub fn next_client_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a client to the roster.
    pub async fn register(&self, client: Client) -> Result<(), HubClosed> {
        self.submit(Command::Register(client)).await
    }

    /// Removes a client from the roster. Unknown ids are ignored.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubClosed> {
        self.submit(Command::Unregister(id)).await
    }

    /// Queues an event for every client registered when the hub gets to it.
    pub async fn broadcast(&self, event: Event) -> Result<(), HubClosed> {
        self.submit(Command::Broadcast(event)).await
    }

    /// Snapshot of the registered clients, ordered by id.
    pub async fn roster(&self) -> Result<Vec<ClientId>, HubClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Command::Roster(reply_tx)).await?;
        reply_rx.await.map_err(|_| HubClosed)
    }

    async fn submit(&self, command: Command) -> Result<(), HubClosed> {
        self.commands.send(command).await.map_err(|_| HubClosed)
    }
}

/// The single consumer of hub requests. Owns the roster.
#[derive(Debug)]
pub struct HubLoop {
    commands: mpsc::Receiver<Command>,
    roster: HashMap<ClientId, MailboxSender>,
}

impl HubLoop {
    /// Serves requests until shutdown is signalled or every [`Hub`] handle is dropped.
    ///
    /// Dropping the loop drops every mailbox producer, which ends the writer pumps.
    pub async fn run(mut self, shutdown_signal: WatchReceiver<bool>) {
        info!("Hub started.");
        let mut shutdown = shutdown_signal.clone();
        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    self.handle(command);
                }
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Hub shutting down due to signal.");
                        break;
                    }
                }
                else => {
                    info!("All hub handles dropped. Hub exiting.");
                    break;
                }
            }
        }
        info!("Hub stopped with {} clients still registered.", self.roster.len());
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(client) => {
                let id = client.id;
                if self.roster.insert(id, client.mailbox).is_some() {
                    warn!(client = %id, "Client registered twice, replacing previous entry.");
                }
                info!(client = %id, total = self.roster.len(), "Client joined.");
            }
            Command::Unregister(id) => {
                if self.roster.remove(&id).is_some() {
                    info!(client = %id, total = self.roster.len(), "Client left.");
                } else {
                    debug!(client = %id, "Unregister for a client not in the roster.");
                }
            }
            Command::Broadcast(event) => {
                debug!("Broadcasting {} to {} clients.", event, self.roster.len());
                for (id, mailbox) in &self.roster {
                    match mailbox.deliver(event.clone()) {
                        Ok(()) => {}
                        Err(MailboxError::Full) => {
                            warn!(
                                client = %id,
                                policy = ?mailbox.policy(),
                                "Mailbox full, dropped {}.",
                                event
                            );
                        }
                        Err(MailboxError::Closed) => {
                            debug!(client = %id, "Mailbox closed, client is disconnecting.");
                        }
                    }
                }
            }
            Command::Roster(reply) => {
                let mut ids: Vec<ClientId> = self.roster.keys().copied().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
        }
    }
}
