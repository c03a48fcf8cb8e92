//! Raw frame distribution over UDP multicast
//!
//! A frame is cut into datagrams carrying `{u64 start_offset, u64 tick,
//! u16 chunk_length}` (big-endian) followed by the chunk. All datagrams of
//! one frame share a tick. Receivers reassemble into a triple buffer:
//! the network writes into one slot, a completed frame waits in the
//! ready slot, and the renderer reads the display slot. A frame is
//! considered complete when a datagram with a newer tick shows up.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};

use super::message::ParseError;
use crate::assets::{MULTICAST_CHUNK_LEN, MULTICAST_HEADER_LEN, SOCKET_POLL};
use crate::pipeline::frame_pool::FrameBuffer;
use crate::utils::sos::SignalOfStop;

/// Per-datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub start_offset: u64,
    pub tick: u64,
    pub len: u16,
}

impl ChunkHeader {
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u64(self.start_offset);
        out.put_u64(self.tick);
        out.put_u16(self.len);
    }

    /// Split a datagram into its header and chunk.
    pub fn decode(mut datagram: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        if datagram.len() < MULTICAST_HEADER_LEN {
            return Err(ParseError::Truncated {
                needed: MULTICAST_HEADER_LEN,
                remaining: datagram.len(),
            });
        }
        let header = Self {
            start_offset: datagram.get_u64(),
            tick: datagram.get_u64(),
            len: datagram.get_u16(),
        };

        let len = header.len as usize;
        match datagram.len() {
            n if n < len => Err(ParseError::Truncated {
                needed: len,
                remaining: n,
            }),
            n if n > len => Err(ParseError::TrailingBytes(n - len)),
            _ => Ok((header, datagram)),
        }
    }
}

/// Cut one frame into datagrams of at most `chunk_len` payload bytes.
pub fn split_frame(tick: u64, frame: &[u8], chunk_len: usize) -> Vec<Bytes> {
    let chunk_len = chunk_len.clamp(1, u16::MAX as usize);
    frame
        .chunks(chunk_len)
        .enumerate()
        .map(|(index, chunk)| {
            let mut datagram = BytesMut::with_capacity(MULTICAST_HEADER_LEN + chunk.len());
            ChunkHeader {
                start_offset: (index * chunk_len) as u64,
                tick,
                len: chunk.len() as u16,
            }
            .encode(&mut datagram);
            datagram.put_slice(chunk);
            datagram.freeze()
        })
        .collect()
}

/// What happened to one received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Copied into the frame being assembled
    Stored,
    /// Started a new tick; the previous one became presentable
    Flipped { completed: u64 },
    /// Older than the frame being assembled
    Stale,
    /// Header or range invalid
    Rejected,
}

struct Slots {
    write: Vec<u8>,
    ready: Vec<u8>,
    display: Vec<u8>,
    write_tick: Option<u64>,
    ready_tick: Option<u64>,
    display_tick: Option<u64>,
}

/// Triple-buffered frame reassembly.
///
/// All slot swaps happen under one lock, so a reader never sees a frame
/// that is still being written.
pub struct Reassembler {
    slots: Mutex<Slots>,
    frame_len: usize,
}

impl Reassembler {
    pub fn new(frame_len: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                write: vec![0; frame_len],
                ready: vec![0; frame_len],
                display: vec![0; frame_len],
                write_tick: None,
                ready_tick: None,
                display_tick: None,
            }),
            frame_len,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ingest(&self, datagram: &[u8]) -> Ingest {
        let Ok((header, chunk)) = ChunkHeader::decode(datagram) else {
            return Ingest::Rejected;
        };

        let start = header.start_offset as usize;
        let Some(end) = start
            .checked_add(chunk.len())
            .filter(|end| *end <= self.frame_len)
        else {
            return Ingest::Rejected;
        };

        let mut slots = self.slots();
        let mut outcome = Ingest::Stored;

        match slots.write_tick {
            Some(current) if header.tick < current => return Ingest::Stale,
            Some(current) if header.tick > current => {
                let Slots { write, ready, .. } = &mut *slots;
                std::mem::swap(write, ready);
                slots.ready_tick = Some(current);
                slots.write_tick = Some(header.tick);
                outcome = Ingest::Flipped { completed: current };
            }
            Some(_) => {}
            None => slots.write_tick = Some(header.tick),
        }

        slots.write[start..end].copy_from_slice(chunk);
        outcome
    }

    /// Move the newest completed frame to the display slot and copy it into `dest`.
    ///
    /// Returns its tick, or `None` when nothing new arrived since the last call.
    pub fn take_latest(&self, dest: &mut FrameBuffer) -> Option<u64> {
        let mut slots = self.slots();
        let tick = slots.ready_tick?;
        if slots.display_tick == Some(tick) {
            return None;
        }

        let Slots { ready, display, .. } = &mut *slots;
        std::mem::swap(ready, display);
        slots.display_tick = Some(tick);

        let len = dest.len().min(slots.display.len());
        dest.data_mut()[..len].copy_from_slice(&slots.display[..len]);
        Some(tick)
    }
}

fn multicast_socket() -> std::io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
}

/// Multicast group settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastGroup {
    pub group: Ipv4Addr,
    pub interface: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
}

/// Sends every presented frame to the group, one tick per frame.
pub struct MulticastSender {
    socket: UdpSocket,
    target: SocketAddr,
    tick: u64,
    chunk_len: usize,
}

impl MulticastSender {
    pub fn new(group: MulticastGroup) -> anyhow::Result<Self> {
        let socket = multicast_socket().context("unable to create multicast socket")?;
        socket.set_multicast_ttl_v4(group.ttl)?;
        socket.set_multicast_if_v4(&group.interface)?;
        socket.set_multicast_loop_v4(true)?;
        socket
            .bind(&SocketAddrV4::new(group.interface, 0).into())
            .context("unable to bind multicast sender")?;

        log::info!(
            "Multicast: sending to {}:{} (ttl {})",
            group.group,
            group.port,
            group.ttl
        );

        Ok(Self {
            socket: socket.into(),
            target: SocketAddrV4::new(group.group, group.port).into(),
            tick: 0,
            chunk_len: MULTICAST_CHUNK_LEN,
        })
    }

    pub fn send_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.tick += 1;
        for datagram in split_frame(self.tick, frame, self.chunk_len) {
            self.socket.send_to(&datagram, self.target)?;
        }
        Ok(())
    }
}

/// Background thread feeding a [`Reassembler`] from the group.
pub struct MulticastReceiver {
    reassembler: Arc<Reassembler>,
    sos: SignalOfStop,
    thread: Option<JoinHandle<()>>,
}

impl MulticastReceiver {
    pub fn start(group: MulticastGroup, frame_len: usize) -> anyhow::Result<Self> {
        let socket = multicast_socket().context("unable to create multicast socket")?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port).into())
            .with_context(|| format!("unable to bind multicast port {}", group.port))?;
        socket
            .join_multicast_v4(&group.group, &group.interface)
            .with_context(|| format!("unable to join {}", group.group))?;
        socket.set_read_timeout(Some(SOCKET_POLL))?;
        let socket: UdpSocket = socket.into();

        let reassembler = Arc::new(Reassembler::new(frame_len));
        let sos = SignalOfStop::new();

        let thread = {
            let reassembler = reassembler.clone();
            let sos = sos.clone();
            std::thread::Builder::new()
                .name("multicast".into())
                .spawn(move || receive_loop(socket, reassembler, sos))
                .context("unable to spawn multicast thread")?
        };

        log::info!("Multicast: listening on {}:{}", group.group, group.port);

        Ok(Self {
            reassembler,
            sos,
            thread: Some(thread),
        })
    }

    pub fn reassembler(&self) -> &Arc<Reassembler> {
        &self.reassembler
    }

    pub fn stop(&mut self) {
        self.sos.cancel();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("Multicast: receive thread panicked");
        }
    }
}

impl Drop for MulticastReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: UdpSocket, reassembler: Arc<Reassembler>, sos: SignalOfStop) {
    let mut buf = vec![0u8; u16::MAX as usize];
    let mut rejected = 0u64;

    while !sos.cancelled() {
        match socket.recv(&mut buf) {
            Ok(n) => {
                if reassembler.ingest(&buf[..n]) == Ingest::Rejected {
                    rejected += 1;
                    if rejected.is_power_of_two() {
                        log::warn!("Multicast: {} datagrams rejected", rejected);
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                log::error!("Multicast: receive failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_header_layout() {
        let mut out = BytesMut::new();
        ChunkHeader {
            start_offset: 1,
            tick: 2,
            len: 3,
        }
        .encode(&mut out);
        assert_eq!(
            out.as_ref(),
            &[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 3]
        );
    }

    #[test]
    fn test_truncated_datagram() {
        let datagrams = split_frame(1, &[1, 2, 3, 4], 4);
        let datagram = &datagrams[0];
        for len in 0..datagram.len() {
            assert!(ChunkHeader::decode(&datagram[..len]).is_err());
        }
        assert!(ChunkHeader::decode(datagram).is_ok());
    }

    #[test]
    fn test_reassembly_is_bit_identical() {
        let original = frame(1000, 7);
        let reassembler = Reassembler::new(original.len());

        let datagrams = split_frame(5, &original, 600);
        assert_eq!(datagrams.len(), 2);
        // arrival order does not matter within a tick
        assert_eq!(reassembler.ingest(&datagrams[1]), Ingest::Stored);
        assert_eq!(reassembler.ingest(&datagrams[0]), Ingest::Stored);

        let mut dest = FrameBuffer::new(1000, 1);
        assert_eq!(reassembler.take_latest(&mut dest), None);

        let next = split_frame(6, &frame(1000, 9), 600);
        assert_eq!(reassembler.ingest(&next[0]), Ingest::Flipped { completed: 5 });

        let mut dest = FrameBuffer::new(1000, 1);
        assert_eq!(reassembler.take_latest(&mut dest), Some(5));
        assert_eq!(&dest.data()[..1000], original.as_slice());
        assert_eq!(reassembler.take_latest(&mut dest), None);
    }

    #[test]
    fn test_late_lower_tick_is_discarded() {
        let reassembler = Reassembler::new(8);
        let old = split_frame(1, &[1; 8], 4);
        let new = split_frame(2, &[2; 8], 4);

        reassembler.ingest(&old[0]);
        reassembler.ingest(&new[0]);
        assert_eq!(reassembler.ingest(&old[1]), Ingest::Stale);

        reassembler.ingest(&new[1]);
        reassembler.ingest(&split_frame(3, &[3; 8], 8)[0]);

        let mut dest = FrameBuffer::new(8, 1);
        assert_eq!(reassembler.take_latest(&mut dest), Some(2));
        assert!(dest.data()[..8].iter().all(|b| *b == 2));
    }

    #[test]
    fn test_out_of_range_chunk_rejected() {
        let reassembler = Reassembler::new(4);
        let datagrams = split_frame(1, &[0; 8], 8);
        assert_eq!(reassembler.ingest(&datagrams[0]), Ingest::Rejected);
        assert_eq!(reassembler.ingest(&[0; 3]), Ingest::Rejected);
    }
}
