// src/route.rs

use std::fmt;
use std::net::SocketAddrV4;
use thiserror::Error;
use url::Url;

/// Path prefix a client used. Both map to the same transport; the stream
/// format is detected from the packets themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Udp,
    Rtp,
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Udp => write!(f, "udp"),
            Prefix::Rtp => write!(f, "rtp"),
        }
    }
}

/// A request path resolved to a multicast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub prefix: Prefix,
    pub group: SocketAddrV4,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid request: {0}")]
    Malformed(String),
    #[error("not an IPv4 multicast group: {0}")]
    NotMulticast(SocketAddrV4),
}

/// Maps a request target such as `/udp/239.1.1.1:1234` to its group.
pub fn parse(target: &str) -> Result<Route, RouteError> {
    let malformed = || RouteError::Malformed(target.to_string());

    let base = Url::parse("http://localhost/").map_err(|_| malformed())?;
    let url = base.join(target).map_err(|_| malformed())?;
    let mut segments = url.path_segments().ok_or_else(malformed)?;

    let prefix = match segments.next() {
        Some("udp") => Prefix::Udp,
        Some("rtp") => Prefix::Rtp,
        _ => return Err(malformed()),
    };
    let group: SocketAddrV4 = segments
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;
    if segments.next().is_some() {
        return Err(malformed());
    }
    if !group.ip().is_multicast() {
        return Err(RouteError::NotMulticast(group));
    }
    Ok(Route { prefix, group })
}
