// src/transport/socket.rs

use log::debug;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::net::UdpSocket;

use super::error::TransportError;

/// Resolves a multicast interface to its IPv4 address.
///
/// Accepts either an interface name (`eth0`) or a literal IPv4 address.
pub fn interface_addr(interface: &str) -> Result<Ipv4Addr, TransportError> {
    if let Ok(addr) = interface.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    lookup_interface(interface)
}

#[cfg(unix)]
fn lookup_interface(name: &str) -> Result<Ipv4Addr, TransportError> {
    use std::ffi::CStr;

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills `ifap` with a list we free below.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(TransportError::socket(
            "getifaddrs",
            io::Error::last_os_error(),
        ));
    }

    let mut known = false;
    let mut found = None;
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: `cur` is a node of the list returned by getifaddrs.
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_name.is_null() {
            continue;
        }
        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let ifa_name = unsafe { CStr::from_ptr(ifa.ifa_name) };
        if ifa_name.to_bytes() != name.as_bytes() {
            continue;
        }
        known = true;
        if ifa.ifa_addr.is_null() {
            continue;
        }
        // SAFETY: ifa_addr is non-null; the family tells us its real layout.
        let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
        if family == libc::AF_INET {
            let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
            found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
            break;
        }
    }
    // SAFETY: `ifap` came from a successful getifaddrs call.
    unsafe { libc::freeifaddrs(ifap) };

    match found {
        Some(addr) => Ok(addr),
        None if known => Err(TransportError::socket(
            format!("interface {}", name),
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv4 address"),
        )),
        None => Err(TransportError::socket(
            format!("interface {}", name),
            io::Error::new(io::ErrorKind::NotFound, "no such network interface"),
        )),
    }
}

#[cfg(not(unix))]
fn lookup_interface(name: &str) -> Result<Ipv4Addr, TransportError> {
    Err(TransportError::socket(
        format!("interface {}", name),
        io::Error::new(
            io::ErrorKind::Unsupported,
            "interface names are not supported here, pass its IPv4 address",
        ),
    ))
}

/// Opens a UDP socket bound to `group` and joined to it on `interface`.
///
/// The address is bound with `SO_REUSEADDR`, so any number of sessions can
/// listen to the same group concurrently. Must be called from inside a Tokio
/// runtime.
pub fn join_multicast(group: SocketAddrV4, interface: Ipv4Addr) -> Result<UdpSocket, TransportError> {
    let socket = reusable_socket(group)
        .map_err(|e| TransportError::socket(format!("bind {}", group), e))?;
    socket
        .join_multicast_v4(group.ip(), &interface)
        .map_err(|e| TransportError::socket(format!("join {} on {}", group.ip(), interface), e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::socket("set_nonblocking", e))?;
    debug!("joined multicast group {} via {}", group, interface);
    UdpSocket::from_std(socket).map_err(|e| TransportError::socket("register socket", e))
}

#[cfg(unix)]
fn reusable_socket(addr: SocketAddrV4) -> io::Result<std::net::UdpSocket> {
    use std::mem;
    use std::os::fd::FromRawFd;

    // SAFETY: plain socket(2) call; the fd is owned by `socket` right after.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is a freshly created socket nobody else owns.
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };

    let one: libc::c_int = 1;
    // SAFETY: `one` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: an all-zero sockaddr_in is valid; the fields are set below.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    // SAFETY: `sin` is a valid sockaddr_in for the length passed.
    let rc = unsafe {
        libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(socket)
}

#[cfg(not(unix))]
fn reusable_socket(addr: SocketAddrV4) -> io::Result<std::net::UdpSocket> {
    std::net::UdpSocket::bind(addr)
}
