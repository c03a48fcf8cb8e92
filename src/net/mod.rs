//! Network synchronization between the authority and its subscribers
//!
//! Control messages travel over TCP, each one a `u32` big-endian length
//! followed by the payload. Socket I/O runs on tokio tasks; received
//! commands land in an inbox the presentation loop drains without blocking.
//! Raw frames can additionally be distributed over UDP multicast.

mod connection;

pub mod authority;
pub mod message;
pub mod multicast;
pub mod protocol;
pub mod subscriber;

use std::net::SocketAddr;

pub use authority::Authority;
pub use protocol::Command;
pub use subscriber::Subscriber;

/// Connection identifier, unique for the lifetime of an authority
pub type PeerId = u64;

/// Something that happened on the network, in receipt order per connection
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connected { peer: PeerId, addr: SocketAddr },
    Command { peer: PeerId, command: Command },
    Disconnected { peer: PeerId },
}
