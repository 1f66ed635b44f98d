use std::io;

use thiserror::Error;

/// Errors raised by the multicast transport.
///
/// Startup failures (`Socket`, `MalformedPacket`, `UnsupportedVersion`,
/// `UnsupportedProfile`) are returned synchronously from session creation or
/// [`Session::start`](super::Session::start) and never enter the packet channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Interface lookup, address resolution or multicast join failed.
    #[error("socket error: {context}: {source}")]
    Socket {
        context: String,
        #[source]
        source: io::Error,
    },
    /// Datagram too short to carry an RTP header.
    #[error("invalid packet length: {0}")]
    MalformedPacket(usize),
    /// RTP version bits other than 2.
    #[error("unsupported RTP version: {0}")]
    UnsupportedVersion(u8),
    /// RTP payload type outside the accepted MPEG profiles.
    #[error("unknown payload profile: {0:#x}")]
    UnsupportedProfile(u8),
    /// Socket read failed, including a read interrupted by session close.
    #[error("read error: {0}")]
    Read(#[source] io::Error),
}

impl TransportError {
    pub(crate) fn socket(context: impl Into<String>, source: io::Error) -> Self {
        TransportError::Socket {
            context: context.into(),
            source,
        }
    }
}
