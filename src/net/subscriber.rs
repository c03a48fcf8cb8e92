use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::protocol::Command;
use super::{NetEvent, PeerId, connection};
use crate::pipeline::health::PlaybackHealth;

/// Peer id under which the authority's commands are reported
pub const AUTHORITY_PEER: PeerId = 0;

/// Connecting side of the sync protocol.
///
/// Losing the connection is reported once as `Disconnected`; there is no
/// reconnection.
pub struct Subscriber {
    outgoing: UnboundedSender<Bytes>,
    inbox: UnboundedReceiver<NetEvent>,
    cancel: CancellationToken,
}

impl Subscriber {
    /// Connect to the authority and send the greeting.
    pub async fn connect(addr: SocketAddr, health: Arc<PlaybackHealth>) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("unable to connect to {}", addr))?;
        connection::configure(&stream);
        log::info!("Subscriber: connected to {}", addr);

        let (events, inbox) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(connection::run(
            stream,
            AUTHORITY_PEER,
            events,
            outgoing_rx,
            cancel.clone(),
            health,
        ));

        let subscriber = Self {
            outgoing,
            inbox,
            cancel,
        };
        subscriber.send(&Command::Greeting);
        Ok(subscriber)
    }

    pub fn send(&self, command: &Command) {
        if self.outgoing.send(command.encode()).is_err() {
            log::debug!("Subscriber: connection closed, dropped {}", command.name());
        }
    }

    pub fn try_next(&mut self) -> Option<NetEvent> {
        self.inbox.try_recv().ok()
    }

    pub async fn next(&mut self) -> Option<NetEvent> {
        self.inbox.recv().await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shutdown();
    }
}
