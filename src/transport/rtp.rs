// src/transport/rtp.rs

use bytes::Buf;
use log::{info, trace};
use std::fmt;

use super::error::TransportError;
use super::packet::Packet;

/// Size of the fixed RTP header.
pub const RTP_HEADER_SIZE: usize = 12;

/// First byte of every MPEG transport-stream packet.
pub const MPEG_TS_SYNC_BYTE: u8 = 0x47;

const RTP_VERSION: u8 = 2;
const PADDING_BIT: u8 = 0x20;
const EXTENSION_BIT: u8 = 0x10;
const CSRC_COUNT_MASK: u8 = 0x0F;
const PAYLOAD_TYPE_MASK: u8 = 0x7F;

/// RTP payload profiles the relay accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// MPEG transport stream over RTP (payload type 33).
    MpegTs,
    /// MPEG-1/2 video elementary stream (payload type 32).
    MpegVideo,
    /// MPEG-1/2 audio elementary stream (payload type 14).
    MpegAudio,
}

impl Profile {
    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            0x21 => Some(Profile::MpegTs),
            0x20 => Some(Profile::MpegVideo),
            0x0E => Some(Profile::MpegAudio),
            _ => None,
        }
    }

    pub fn payload_type(self) -> u8 {
        match self {
            Profile::MpegTs => 0x21,
            Profile::MpegVideo => 0x20,
            Profile::MpegAudio => 0x0E,
        }
    }

    /// RFC 2250 payload-specific header carried by elementary-stream profiles.
    fn payload_header_len(self) -> usize {
        match self {
            Profile::MpegTs => 0,
            Profile::MpegVideo | Profile::MpegAudio => 4,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::MpegTs => write!(f, "MPEG-TS"),
            Profile::MpegVideo => write!(f, "MPEG video"),
            Profile::MpegAudio => write!(f, "MPEG audio"),
        }
    }
}

/// How a session's datagrams are encapsulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Bare MPEG-TS, relayed as received.
    Raw,
    /// RTP-encapsulated, stripped and reordered.
    Rtp(Profile),
}

/// Classifies the first datagram of a session.
pub fn detect(pkt: &Packet) -> Result<StreamKind, TransportError> {
    let data = pkt.datagram();
    if data.len() < RTP_HEADER_SIZE {
        return Err(TransportError::MalformedPacket(data.len()));
    }

    let sign = data[0];
    if sign == MPEG_TS_SYNC_BYTE {
        info!("MPEG TS stream detected");
        return Ok(StreamKind::Raw);
    }

    let version = (sign & 0xC0) >> 6;
    if version != RTP_VERSION {
        return Err(TransportError::UnsupportedVersion(version));
    }

    let pt = data[1] & PAYLOAD_TYPE_MASK;
    match Profile::from_payload_type(pt) {
        Some(profile) => {
            info!("RTP stream detected: {} ({:#x})", profile, pt);
            Ok(StreamKind::Rtp(profile))
        }
        None => Err(TransportError::UnsupportedProfile(pt)),
    }
}

/// Strips the RTP header in place: sets the packet's sequence number and
/// narrows its window to the media payload.
///
/// Headers whose optional fields run past the datagram leave an empty window
/// rather than failing; only a datagram too short to hold the fixed header is
/// an error, since it carries no sequence number.
pub fn strip(pkt: &mut Packet, profile: Profile) -> Result<(), TransportError> {
    let data = pkt.datagram();
    let len = data.len();
    if len < RTP_HEADER_SIZE {
        return Err(TransportError::MalformedPacket(len));
    }

    let sign = data[0];
    let sequence = (&data[2..4]).get_u16();
    let mut offset = RTP_HEADER_SIZE + profile.payload_header_len();

    let csrc_count = (sign & CSRC_COUNT_MASK) as usize;
    if csrc_count > 0 {
        trace!("csrc count: {}", csrc_count);
        offset += 4 * csrc_count;
    }

    if sign & EXTENSION_BIT != 0 {
        // Extension length is taken from the word right after the fixed header.
        if len < RTP_HEADER_SIZE + 4 {
            pkt.set_sequence(sequence);
            pkt.set_window(len, len);
            return Ok(());
        }
        let words = (&data[RTP_HEADER_SIZE + 2..RTP_HEADER_SIZE + 4]).get_u16() as usize;
        trace!("header extension: {} words", words);
        offset += 4 + 4 * words;
    }

    let mut length = len;
    if sign & PADDING_BIT != 0 {
        length = length.saturating_sub(data[len - 1] as usize);
    }

    pkt.set_sequence(sequence);
    pkt.set_window(offset, length);
    Ok(())
}
