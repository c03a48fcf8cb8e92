use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::protocol::Command;
use super::{NetEvent, PeerId, connection};
use crate::pipeline::health::PlaybackHealth;

type PeerMap = Arc<Mutex<HashMap<PeerId, UnboundedSender<Bytes>>>>;

/// Listening side of the sync protocol.
///
/// Owns the accept loop and one task per subscriber. Commands from any
/// subscriber are funneled into a single inbox; outgoing commands are
/// encoded once and queued to every peer without blocking the caller.
pub struct Authority {
    peers: PeerMap,
    inbox: UnboundedReceiver<NetEvent>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl Authority {
    /// Bind `addr` and start accepting subscribers on the current runtime.
    pub async fn bind(addr: SocketAddr, health: Arc<PlaybackHealth>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("unable to listen on {}", addr))?;
        let local_addr = listener.local_addr()?;
        log::info!("Authority: listening on {}", local_addr);

        let peers: PeerMap = Default::default();
        let (events, inbox) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            peers.clone(),
            events,
            cancel.clone(),
            health,
        ));

        Ok(Self {
            peers,
            inbox,
            cancel,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<PeerId, UnboundedSender<Bytes>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }

    /// Queue `command` to every connected subscriber.
    pub fn broadcast(&self, command: &Command) {
        self.broadcast_except(command, None);
    }

    /// Queue `command` to every subscriber but `skip`.
    pub fn broadcast_except(&self, command: &Command, skip: Option<PeerId>) {
        let payload = command.encode();
        for (peer, sender) in self.peers().iter() {
            if Some(*peer) != skip {
                // a closed channel means the peer task is already tearing down
                let _ = sender.send(payload.clone());
            }
        }
    }

    pub fn send_to(&self, peer: PeerId, command: &Command) {
        if let Some(sender) = self.peers().get(&peer) {
            let _ = sender.send(command.encode());
        }
    }

    /// Next pending event, without waiting.
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

impl Drop for Authority {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: PeerMap,
    events: UnboundedSender<NetEvent>,
    cancel: CancellationToken,
    health: Arc<PlaybackHealth>,
) {
    let mut next_peer: PeerId = 1;

    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Authority: accept failed: {}", e);
                    continue;
                }
            },
        };

        let peer = next_peer;
        next_peer += 1;
        log::info!("Authority: peer {} connected from {}", peer, addr);
        connection::configure(&stream);

        let (sender, outgoing) = mpsc::unbounded_channel();
        peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, sender);
        let _ = events.send(NetEvent::Connected { peer, addr });

        let peers = peers.clone();
        let events = events.clone();
        let cancel = cancel.child_token();
        let health = health.clone();
        tokio::spawn(async move {
            connection::run(stream, peer, events, outgoing, cancel, health).await;
            peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&peer);
            log::info!("Authority: peer {} disconnected", peer);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::subscriber::Subscriber;
    use crate::pipeline::types::Timestamp;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    async fn authority() -> Authority {
        Authority::bind("127.0.0.1:0".parse().unwrap(), Arc::new(PlaybackHealth::new()))
            .await
            .unwrap()
    }

    async fn next_command(authority: &mut Authority) -> (PeerId, Command) {
        loop {
            match timeout(Duration::from_secs(5), authority.next()).await {
                Ok(Some(NetEvent::Command { peer, command })) => return (peer, command),
                Ok(Some(_)) => continue,
                other => panic!("no command received: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_greeting_reaches_authority() {
        let mut authority = authority().await;
        let _subscriber = Subscriber::connect(authority.local_addr(), Arc::new(PlaybackHealth::new()))
            .await
            .unwrap();

        let (_, command) = next_command(&mut authority).await;
        assert_eq!(command, Command::Greeting);
        assert_eq!(authority.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let authority = authority().await;
        let health = Arc::new(PlaybackHealth::new());
        let mut first = Subscriber::connect(authority.local_addr(), health.clone())
            .await
            .unwrap();
        let mut second = Subscriber::connect(authority.local_addr(), health)
            .await
            .unwrap();

        while authority.peer_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let seek = Command::Seek(Timestamp::from_micros(42));
        authority.broadcast(&seek);

        for subscriber in [&mut first, &mut second] {
            let event = timeout(Duration::from_secs(5), subscriber.next()).await.unwrap();
            assert_eq!(
                event,
                Some(NetEvent::Command {
                    peer: 0,
                    command: seek.clone()
                })
            );
        }
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let health = Arc::new(PlaybackHealth::new());
        let mut authority = Authority::bind("127.0.0.1:0".parse().unwrap(), health.clone())
            .await
            .unwrap();

        let mut raw = tokio::net::TcpStream::connect(authority.local_addr()).await.unwrap();
        // unknown tag, then a truncated seek, then a valid pause toggle
        raw.write_all(&[0, 0, 0, 1, b'Q']).await.unwrap();
        raw.write_all(&[0, 0, 0, 3, b'S', 0, 0]).await.unwrap();
        raw.write_all(&[0, 0, 0, 1, b'Z']).await.unwrap();

        let (_, command) = next_command(&mut authority).await;
        assert_eq!(command, Command::PauseToggle);
        assert_eq!(health.summary().malformed_messages, 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_reported() {
        let mut authority = authority().await;
        let raw = tokio::net::TcpStream::connect(authority.local_addr()).await.unwrap();
        drop(raw);

        let mut saw_disconnect = false;
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), authority.next()).await {
            if matches!(event, NetEvent::Disconnected { .. }) {
                saw_disconnect = true;
                break;
            }
        }
        assert!(saw_disconnect);
    }
}
