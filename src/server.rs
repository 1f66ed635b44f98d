// src/server.rs

//! Minimal HTTP/1.1 front end: one multicast session per `GET` request,
//! streamed back as the response body until either side goes away.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use uuid::Uuid;

use crate::route;
use crate::transport::Session;

/// Upper bound on the request line plus headers.
const MAX_REQUEST_HEAD: usize = 8 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const STREAM_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: application/octet-stream\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\r\n";

/// Handle to the listening HTTP server.
pub struct HttpServer {
    listener: TcpListener,
    interface: Arc<str>,
}

impl HttpServer {
    /// Binds the listener. `interface` is where multicast groups get joined.
    pub async fn bind(addr: &str, interface: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        Ok(Self {
            listener,
            interface: Arc::from(interface),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` turns `true` or its sender is dropped. Open
    /// streams observe the same signal and end with it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Listen at {}", self.local_addr()?);
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => {
                    info!("HTTP server shutting down");
                    break;
                }
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let interface = self.interface.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, interface, shutdown).await;
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }
        Ok(())
    }
}

struct Request {
    method: String,
    target: String,
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    interface: Arc<str>,
    shutdown: watch::Receiver<bool>,
) {
    let id = Uuid::new_v4().simple().to_string();
    let id = &id[..8];

    let request = match tokio::time::timeout(REQUEST_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!("[{}] bad request from {}: {}", id, peer, e);
            let _ = reply(&mut stream, 400, "Bad Request", "Bad request\n").await;
            return;
        }
        Err(_) => {
            debug!("[{}] request from {} timed out", id, peer);
            return;
        }
    };
    info!("[{}] {} {} from {}", id, request.method, request.target, peer);

    if request.method != "GET" {
        let _ = reply(&mut stream, 405, "Method Not Allowed", "Only GET is supported\n").await;
        return;
    }

    let route = match route::parse(&request.target) {
        Ok(route) => route,
        Err(e) => {
            warn!("[{}] {}", id, e);
            let _ = reply(&mut stream, 400, "Bad Request", &format!("{}\n", e)).await;
            return;
        }
    };

    let session = match Session::open(&interface, route.group) {
        Ok(session) => session,
        Err(e) => {
            warn!("[{}] failed initialize transport: {}", id, e);
            let body = format!("failed initialize transport: {}", e);
            let _ = reply(&mut stream, 400, "Bad Request", &body).await;
            return;
        }
    };

    let (reader, mut writer) = stream.into_split();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let watcher = tokio::spawn(watch_client(reader, shutdown, cancel_tx));

    relay(id, &session, cancel_rx, &mut writer).await;

    // Dropping the watcher's sender cancels the producer if it is still running.
    watcher.abort();
    session.close();
    info!("[{}] {} finished", id, route.group);
}

/// Drains the session into the response until the stream ends, the client
/// goes away or a write fails.
async fn relay(
    id: &str,
    session: &Session,
    cancel: watch::Receiver<bool>,
    writer: &mut OwnedWriteHalf,
) {
    let mut packets = match session.start(cancel).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("[{}] failed to establish connection: {}", id, e);
            let body = format!("failed to establish connection: {}", e);
            let _ = reply(writer, 500, "Internal Server Error", &body).await;
            return;
        }
    };

    if let Err(e) = writer.write_all(STREAM_HEADER).await {
        warn!("[{}] error occurs while sending response: {}", id, e);
        return;
    }

    let mut sent: u64 = 0;
    while let Some(pkt) = packets.recv().await {
        if let Err(e) = writer.write_all(pkt.payload()).await {
            warn!("[{}] error occurs while sending response: {}", id, e);
            break;
        }
        sent += pkt.payload().len() as u64;
        pkt.release();
    }
    info!("[{}] relayed {} bytes", id, sent);
}

/// Signals `cancel` once the client disconnects or the server shuts down.
async fn watch_client(
    mut reader: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
    cancel: watch::Sender<bool>,
) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                // Anything the client sends after the request is ignored.
                Ok(_) => {}
            },
        }
    }
    let _ = cancel.send(true);
}

async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Request> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed before request head");
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_REQUEST_HEAD {
            anyhow::bail!("request head larger than {} bytes", MAX_REQUEST_HEAD);
        }
    }
    parse_request_line(&head)
}

fn parse_request_line(head: &[u8]) -> Result<Request> {
    let end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .context("missing request line")?;
    let line = std::str::from_utf8(&head[..end]).context("request line is not UTF-8")?;
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if version.starts_with("HTTP/1.") => {
            Ok(Request {
                method: method.to_string(),
                target: target.to_string(),
            })
        }
        _ => anyhow::bail!("malformed request line: {:?}", line),
    }
}

async fn reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}

/// Resolves once the flag is `true` or its sender is gone.
async fn stopped(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}
