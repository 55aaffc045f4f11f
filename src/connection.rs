//! Per-client read and write pumps.
//!
//! Each admitted socket gets two tasks: a reader that decodes inbound frames and
//! forwards events to the hub, and a writer that drains the client's mailbox to
//! the socket. Both share one [`CancellationToken`]. Whichever pump stops first
//! cancels it and the other follows. The writer closes the socket on its way out
//! and the supervisor unregisters the client once both pumps are done.

use crate::event::Frame;
use crate::hub::{Client, ClientId, Hub};
use crate::mailbox::MailboxReceiver;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on the closing handshake of a socket whose peer stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// An admitted client that has not started pumping yet.
#[derive(Debug)]
pub struct Connection {
    client: Client,
    mailbox: MailboxReceiver,
    hub: Hub,
}

impl Connection {
    pub fn new(client: Client, mailbox: MailboxReceiver, hub: Hub) -> Self {
        Self {
            client,
            mailbox,
            hub,
        }
    }

    pub fn id(&self) -> ClientId {
        self.client.id()
    }

    /// Starts both pumps, registers the client, and returns after the client has
    /// been unregistered.
    pub async fn run(self, socket: WebSocket) {
        let (sink, stream) = socket.split();
        self.pump(sink, stream).await
    }

    /// Same as [`Connection::run`] over an already split socket.
    async fn pump<K, S>(self, sink: K, stream: S)
    where
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: Display + Send,
        S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
    {
        let Connection {
            client,
            mailbox,
            hub,
        } = self;
        let id = client.id();
        let disconnect = CancellationToken::new();

        let writer = tokio::spawn(write_pump(id, sink, mailbox, disconnect.clone()));
        let reader = tokio::spawn(read_pump(id, stream, hub.clone(), disconnect.clone()));

        // Registration and deregistration go through the same queue from this
        // task, so the hub always sees them in that order.
        if hub.register(client).await.is_err() {
            warn!(client = %id, "Hub is not running, dropping connection.");
            disconnect.cancel();
        }

        let (read_result, write_result) = tokio::join!(reader, writer);
        if let Err(e) = read_result {
            error!(client = %id, "Read pump panicked: {}", e);
        }
        if let Err(e) = write_result {
            error!(client = %id, "Write pump panicked: {}", e);
        }

        if hub.unregister(id).await.is_err() {
            debug!(client = %id, "Hub already stopped, nothing to unregister.");
        }
        info!(client = %id, "WebSocket client connection handler finished.");
    }
}

/// Decodes inbound frames until the peer goes away, a frame fails to decode, or
/// the disconnect token fires.
async fn read_pump<S>(id: ClientId, mut receiver: S, hub: Hub, disconnect: CancellationToken)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = disconnect.cancelled() => break,
            next = receiver.next() => next,
        };
        let payload = match next {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                log_close(id, frame.as_ref());
                break;
            }
            Some(Err(e)) => {
                warn!(client = %id, "Could not read message: {}", e);
                break;
            }
            None => {
                debug!(client = %id, "WebSocket stream ended.");
                break;
            }
        };

        let frame = match Frame::decode(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client = %id, "Malformed frame, closing connection: {}", e);
                break;
            }
        };

        match frame.into_event() {
            Ok(event) => {
                debug!(client = %id, "Received {}", event);
                if hub.broadcast(event).await.is_err() {
                    info!(client = %id, "Hub stopped, closing connection.");
                    break;
                }
            }
            Err(action) => {
                warn!(client = %id, "Unknown action {} received, ignoring frame.", action);
            }
        }
    }
    disconnect.cancel();
    debug!(client = %id, "WebSocket receive task finished.");
}

/// Sends every mailbox entry to the socket. Owns the sink, so it is also the one
/// place the socket gets closed.
async fn write_pump<K>(
    id: ClientId,
    mut sender: K,
    mut mailbox: MailboxReceiver,
    disconnect: CancellationToken,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    loop {
        let event = tokio::select! {
            _ = disconnect.cancelled() => break,
            next = mailbox.recv() => match next {
                Some(event) => event,
                None => {
                    info!(client = %id, "Mailbox closed, WebSocket send task finishing.");
                    break;
                }
            },
        };
        let payload = match Frame::from(event.clone()).encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(client = %id, "Failed to serialize {} for WebSocket: {}", event, e);
                continue;
            }
        };
        let sent = tokio::select! {
            _ = disconnect.cancelled() => break,
            sent = sender.send(Message::Text(payload)) => sent,
        };
        if let Err(e) = sent {
            warn!(client = %id, "Could not send {}: {}", event, e);
            break;
        }
        debug!(client = %id, "Sent {}", event);
    }
    disconnect.cancel();

    if mailbox.dropped() > 0 {
        info!(client = %id, "Client missed {} events while lagging.", mailbox.dropped());
    }
    // The peer may already have completed the close handshake.
    match timeout(CLOSE_TIMEOUT, sender.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(client = %id, "Socket close: {}", e),
        Err(_) => warn!(client = %id, "Socket close timed out."),
    }
    debug!(client = %id, "WebSocket send task finished.");
}

fn log_close(id: ClientId, frame: Option<&CloseFrame<'static>>) {
    match frame {
        Some(frame) if frame.code != close_code::NORMAL && frame.code != close_code::AWAY => {
            warn!(client = %id, code = frame.code, reason = %frame.reason, "WebSocket closed unexpectedly.");
        }
        _ => debug!(client = %id, "WebSocket client sent Close frame."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::mailbox::{mailbox, DropPolicy};
    use futures_util::stream;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::sync::watch;

    /// A socket sink whose peer has gone away: every send fails.
    #[derive(Default, Clone)]
    struct BrokenSink {
        closes: Arc<AtomicUsize>,
    }

    impl Sink<Message> for BrokenSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), io::Error> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    async fn wait_for_roster(hub: &Hub, expected: &[ClientId]) {
        for _ in 0..100 {
            if hub.roster().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("roster never became {:?}", expected);
    }

    #[tokio::test]
    async fn failed_send_disconnects_a_silent_client() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hub, _hub_task) = Hub::spawn(16, shutdown_rx);
        let (tx, rx) = mailbox(4, DropPolicy::Oldest);
        let id = hub.next_client_id();
        let connection = Connection::new(Client::new(id, tx), rx, hub.clone());

        let sink = BrokenSink::default();
        let closes = sink.closes.clone();
        // The peer never sends anything, so only the writer can notice it is gone.
        let inbound = stream::pending::<Result<Message, axum::Error>>();
        let handle = tokio::spawn(connection.pump(sink, inbound));

        wait_for_roster(&hub, &[id]).await;
        hub.broadcast(Event::Create("a.txt".to_string()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("connection kept running after the send failed")
            .unwrap();
        assert!(hub.roster().await.unwrap().is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_close_stops_the_writer() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hub, _hub_task) = Hub::spawn(16, shutdown_rx);
        let (tx, rx) = mailbox(4, DropPolicy::Oldest);
        let id = hub.next_client_id();
        let connection = Connection::new(Client::new(id, tx), rx, hub.clone());

        let sink = BrokenSink::default();
        let closes = sink.closes.clone();
        let inbound = stream::iter(vec![Ok::<_, axum::Error>(Message::Close(None))]);

        tokio::time::timeout(Duration::from_secs(2), connection.pump(sink, inbound))
            .await
            .expect("connection kept running after the peer closed");
        assert!(hub.roster().await.unwrap().is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
