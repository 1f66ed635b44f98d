// src/transport/session.rs

use log::{debug, info, trace};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use super::error::TransportError;
use super::packet::{Packet, PacketPool};
use super::reorder::{Reorderer, ReorderStats, MAX_PENDING};
use super::rtp::{self, Profile, StreamKind};
use super::socket;

/// Packets buffered between the acquisition task and the consumer.
pub const CHANNEL_CAPACITY: usize = 16;

/// One multicast subscription feeding one consumer.
///
/// The session owns its socket. [`Session::start`] classifies the stream and
/// spawns the acquisition task; [`Session::close`] (or dropping the session)
/// stops it, which closes the packet channel. The socket, and with it the
/// group membership, is closed once the task has let go of it.
pub struct Session {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    pool: PacketPool,
    closed: watch::Sender<bool>,
    label: String,
}

impl Session {
    /// Joins `group` on `interface` (a name or an IPv4 address).
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn open(interface: &str, group: SocketAddrV4) -> Result<Self, TransportError> {
        let iface = socket::interface_addr(interface)?;
        let socket = socket::join_multicast(group, iface)?;
        info!("Joined multicast group {} on {} ({})", group, interface, iface);
        Ok(Self::with_label(socket, group.to_string()))
    }

    /// Wraps an already bound socket, multicast or not.
    pub fn from_socket(socket: UdpSocket) -> Self {
        let label = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unbound".to_string());
        Self::with_label(socket, label)
    }

    fn with_label(socket: UdpSocket, label: String) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            pool: PacketPool::new(),
            closed,
            label,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.socket() {
            Some(socket) => socket.local_addr(),
            None => Err(closed_error()),
        }
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The pool packets of this session are recycled into.
    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// Reads and classifies the first datagram, then starts relaying.
    ///
    /// Returns once the first packet is queued; the rest of the stream is
    /// acquired on a spawned task. The channel closes when the socket fails,
    /// the session is closed, or `cancel` is set to `true` (or its sender is
    /// dropped). Classification failures are returned here and nothing is
    /// spawned.
    pub async fn start(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<Packet>, TransportError> {
        let socket = self.socket().ok_or_else(|| TransportError::Read(closed_error()))?;
        let mut closed = self.closed.subscribe();
        let mut cancel = cancel;

        let mut first = tokio::select! {
            biased;
            _ = signalled(&mut cancel) => {
                return Err(TransportError::Read(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "cancelled before the first packet",
                )));
            }
            res = read_packet(&socket, &self.pool, &mut closed) => res?,
        };

        let kind = rtp::detect(&first)?;
        let mut mode = Mode::from(kind);
        let mut ready = Vec::with_capacity(1);
        match &mut mode {
            Mode::Raw => ready.push(first),
            Mode::Rtp { profile, reorderer } => {
                rtp::strip(&mut first, *profile)?;
                reorderer.push(first, &mut ready);
            }
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut acquisition = Acquisition {
            socket,
            pool: self.pool.clone(),
            label: self.label.clone(),
            tx,
            cancel,
            closed,
            mode,
            out: Vec::with_capacity(MAX_PENDING + 1),
            stats: SessionStats::default(),
        };
        for pkt in ready {
            acquisition.queue_first(pkt);
        }

        tokio::spawn(acquisition.run());
        Ok(rx)
    }

    /// Stops the acquisition task and closes the socket. Safe to call more
    /// than once, and after the channel has already closed.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Closing session {}", self.label);
        }
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Per-session counters, logged when the stream ends.
#[derive(Debug, Default, Clone, Copy)]
struct SessionStats {
    read: u64,
    relayed: u64,
    malformed: u64,
    empty: u64,
}

enum Mode {
    Raw,
    Rtp { profile: Profile, reorderer: Reorderer },
}

impl From<StreamKind> for Mode {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Raw => Mode::Raw,
            StreamKind::Rtp(profile) => Mode::Rtp {
                profile,
                reorderer: Reorderer::new(),
            },
        }
    }
}

struct Acquisition {
    socket: Arc<UdpSocket>,
    pool: PacketPool,
    label: String,
    tx: mpsc::Sender<Packet>,
    cancel: watch::Receiver<bool>,
    closed: watch::Receiver<bool>,
    mode: Mode,
    out: Vec<Packet>,
    stats: SessionStats,
}

impl Acquisition {
    /// The channel is fresh, so the first packet never waits.
    fn queue_first(&mut self, pkt: Packet) {
        self.stats.read += 1;
        if pkt.is_empty() {
            self.stats.empty += 1;
            return;
        }
        if self.tx.try_send(pkt).is_ok() {
            self.stats.relayed += 1;
        }
    }

    async fn run(mut self) {
        loop {
            let read = tokio::select! {
                biased;
                _ = signalled(&mut self.cancel) => {
                    debug!("{}: context canceled", self.label);
                    break;
                }
                res = read_packet(&self.socket, &self.pool, &mut self.closed) => res,
            };
            let pkt = match read {
                Ok(pkt) => pkt,
                Err(e) => {
                    debug!("{}: acquisition stopped: {}", self.label, e);
                    break;
                }
            };
            self.stats.read += 1;

            let delivered = match &mut self.mode {
                Mode::Raw => {
                    let delivered = send(&self.tx, pkt, &mut self.cancel, &mut self.closed).await;
                    if delivered {
                        self.stats.relayed += 1;
                    }
                    delivered
                }
                Mode::Rtp { profile, reorderer } => {
                    let mut pkt = pkt;
                    if let Err(e) = rtp::strip(&mut pkt, *profile) {
                        trace!("{}: {}", self.label, e);
                        self.stats.malformed += 1;
                        continue;
                    }
                    reorderer.push(pkt, &mut self.out);
                    let mut delivered = true;
                    for pkt in self.out.drain(..) {
                        if pkt.is_empty() {
                            self.stats.empty += 1;
                            continue;
                        }
                        if !send(&self.tx, pkt, &mut self.cancel, &mut self.closed).await {
                            delivered = false;
                            break;
                        }
                        self.stats.relayed += 1;
                    }
                    delivered
                }
            };
            if !delivered {
                debug!("{}: consumer gone", self.label);
                break;
            }
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.out.clear();
        let SessionStats {
            read,
            relayed,
            malformed,
            empty,
        } = self.stats;
        match &self.mode {
            Mode::Raw => info!(
                "{}: stream ended, {} packets read, {} relayed",
                self.label, read, relayed
            ),
            Mode::Rtp { reorderer, .. } => {
                let ReorderStats {
                    reordered,
                    skipped,
                    late,
                    resyncs,
                    ..
                } = reorderer.stats();
                info!(
                    "{}: stream ended, {} packets read, {} relayed, {} reordered, {} lost, {} late, {} resyncs, {} malformed, {} empty",
                    self.label, read, relayed, reordered, skipped, late, resyncs, malformed, empty
                );
            }
        }
    }
}

/// Reads one datagram into a pooled packet.
///
/// Datagrams larger than the packet buffer are truncated to it; the read
/// does not report an error for them.
async fn read_packet(
    socket: &UdpSocket,
    pool: &PacketPool,
    closed: &mut watch::Receiver<bool>,
) -> Result<Packet, TransportError> {
    let mut pkt = pool.acquire();
    tokio::select! {
        biased;
        _ = signalled(closed) => Err(TransportError::Read(closed_error())),
        res = socket.recv(pkt.buffer_mut()) => match res {
            Ok(n) => {
                pkt.set_filled(n);
                Ok(pkt)
            }
            Err(e) => Err(TransportError::Read(e)),
        },
    }
}

/// Queues a packet unless the consumer is cancelled or the session closed
/// first. Returns `false` when the packet could not be delivered.
async fn send(
    tx: &mpsc::Sender<Packet>,
    pkt: Packet,
    cancel: &mut watch::Receiver<bool>,
    closed: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        biased;
        _ = signalled(cancel) => false,
        _ = signalled(closed) => false,
        res = tx.send(pkt) => res.is_ok(),
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "session closed")
}

/// Resolves once the flag is `true` or its sender is gone.
async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}
