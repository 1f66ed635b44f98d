// src/transport/mod.rs

//! Multicast acquisition: socket setup, RTP detection and stripping,
//! reordering and the packet channel handed to consumers.

pub mod error;
pub mod packet;
pub mod reorder;
pub mod rtp;
pub mod session;
pub mod socket;

pub use error::TransportError;
pub use packet::{Packet, PacketPool, PACKET_MTU};
pub use reorder::{ReorderStats, Reorderer, MAX_PENDING};
pub use rtp::{Profile, StreamKind};
pub use session::{Session, CHANNEL_CAPACITY};
