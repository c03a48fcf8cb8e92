use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use socket2::TcpKeepalive;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::protocol::Command;
use super::{NetEvent, PeerId};
use crate::assets::MAX_MESSAGE_LEN;
use crate::pipeline::health::PlaybackHealth;

/// `u32` big-endian length prefix
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_MESSAGE_LEN)
        .new_codec()
}

pub fn configure(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Net: unable to set TCP_NODELAY: {}", e);
    }

    let keep_alive = TcpKeepalive::new()
        .with_time(Duration::from_secs(20))
        .with_interval(Duration::from_secs(20));
    if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keep_alive) {
        log::debug!("Net: unable to set keepalive: {}", e);
    }
}

/// Pump one connection until it closes or `cancel` fires.
///
/// Incoming payloads are parsed one at a time; a malformed payload is
/// logged and dropped without closing the connection. Always ends with
/// a `Disconnected` event.
pub async fn run(
    stream: TcpStream,
    peer: PeerId,
    events: UnboundedSender<NetEvent>,
    mut outgoing: UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    health: Arc<PlaybackHealth>,
) {
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, codec());
    let mut writer = FramedWrite::new(write, codec());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = reader.next() => match frame {
                Some(Ok(payload)) => match Command::decode(payload.freeze()) {
                    Ok(command) => {
                        if events.send(NetEvent::Command { peer, command }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        health.record_malformed_message();
                        log::warn!("Net: dropped malformed message from peer {}: {}", peer, e);
                    }
                },
                Some(Err(e)) => {
                    log::warn!("Net: peer {} read failed: {}", peer, e);
                    break;
                }
                None => break,
            },

            payload = outgoing.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = writer.send(payload).await {
                        log::warn!("Net: peer {} write failed: {}", peer, e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = events.send(NetEvent::Disconnected { peer });
}
