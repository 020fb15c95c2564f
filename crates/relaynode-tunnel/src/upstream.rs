use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relaynode_core::envelope::{ControlMessage, DestinationKey, Protocol};
use relaynode_core::time::now_ms;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::ClientChannel;
use crate::counters::RelayCounters;
use crate::error::{Result, TunnelError};

/// Writes queued per stream upstream before `forward` starts failing.
const STREAM_WRITE_QUEUE: usize = 1024;

/// Where upstream replies go, and how the upstream reports its own death.
#[derive(Clone)]
pub struct ReturnPath {
    pub channel: ClientChannel,
    pub counters: Arc<RelayCounters>,
    /// Called when the socket errors or the peer closes. Must be idempotent.
    pub on_closed: Arc<dyn Fn() + Send + Sync>,
    pub buffer_size: usize,
}

/// One live socket to an upstream game server.
pub enum Upstream {
    /// Connected TCP stream. Writes are queued to a writer task.
    Stream {
        writer: mpsc::Sender<Bytes>,
        writer_task: JoinHandle<()>,
        reader_task: JoinHandle<()>,
    },
    /// Locally bound UDP socket; each envelope is one `send_to`.
    Datagram {
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        reader_task: JoinHandle<()>,
    },
}

/// Write handle detached from the registry lock.
#[derive(Clone)]
pub enum UpstreamWriter {
    Stream(mpsc::Sender<Bytes>),
    Datagram {
        socket: Arc<UdpSocket>,
        target: SocketAddr,
    },
}

impl Upstream {
    /// Open a socket for `dest`, bounded by `timeout`, and start its reader.
    pub async fn connect(dest: &DestinationKey, timeout: Duration, ret: ReturnPath) -> Result<Self> {
        match dest.protocol {
            Protocol::Tcp => connect_stream(dest, timeout, ret).await,
            Protocol::Udp => bind_datagram(dest, timeout, ret).await,
        }
    }

    pub fn writer(&self) -> UpstreamWriter {
        match self {
            Upstream::Stream { writer, .. } => UpstreamWriter::Stream(writer.clone()),
            Upstream::Datagram { socket, target, .. } => UpstreamWriter::Datagram {
                socket: Arc::clone(socket),
                target: *target,
            },
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Upstream::Stream { .. } => Protocol::Tcp,
            Upstream::Datagram { .. } => Protocol::Udp,
        }
    }

    /// Stop the I/O tasks. Dropping their halves closes the socket.
    pub fn close(self) {
        match self {
            Upstream::Stream {
                writer,
                writer_task,
                reader_task,
            } => {
                drop(writer);
                writer_task.abort();
                reader_task.abort();
            }
            Upstream::Datagram { reader_task, .. } => reader_task.abort(),
        }
    }
}

impl UpstreamWriter {
    pub async fn write(&self, dest: &DestinationKey, data: Bytes) -> Result<()> {
        match self {
            UpstreamWriter::Stream(tx) => tx.try_send(data).map_err(|e| {
                let reason = match e {
                    TrySendError::Full(_) => "write queue full",
                    TrySendError::Closed(_) => "stream closed",
                };
                TunnelError::UpstreamWrite {
                    dest: dest.clone(),
                    reason: reason.to_string(),
                }
            }),
            UpstreamWriter::Datagram { socket, target } => socket
                .send_to(&data, *target)
                .await
                .map(|_| ())
                .map_err(|e| TunnelError::UpstreamWrite {
                    dest: dest.clone(),
                    reason: e.to_string(),
                }),
        }
    }
}

// ============================================================================
// Stream (TCP)
// ============================================================================

async fn connect_stream(dest: &DestinationKey, timeout: Duration, ret: ReturnPath) -> Result<Upstream> {
    let unreachable = |reason: String| TunnelError::UpstreamUnreachable {
        dest: dest.clone(),
        reason,
    };
    let stream = tokio::time::timeout(timeout, TcpStream::connect((dest.host.as_str(), dest.port)))
        .await
        .map_err(|_| unreachable(format!("connect timed out after {}ms", timeout.as_millis())))?
        .map_err(|e| unreachable(e.to_string()))?;
    let _ = stream.set_nodelay(true);
    debug!(dest = %dest, "Upstream stream connected");

    let (read_half, write_half) = stream.into_split();
    let (writer, rx) = mpsc::channel(STREAM_WRITE_QUEUE);
    let writer_task = tokio::spawn(stream_writer(dest.clone(), write_half, rx, ret.clone()));
    let reader_task = tokio::spawn(stream_reader(dest.clone(), read_half, ret));

    Ok(Upstream::Stream {
        writer,
        writer_task,
        reader_task,
    })
}

async fn stream_writer(
    dest: DestinationKey,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    ret: ReturnPath,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = half.write_all(&chunk).await {
            warn!(dest = %dest, error = %e, "Upstream stream write failed");
            RelayCounters::incr(&ret.counters.upstream_failures);
            (ret.on_closed)();
            return;
        }
    }
    let _ = half.shutdown().await;
}

async fn stream_reader(dest: DestinationKey, mut half: OwnedReadHalf, ret: ReturnPath) {
    let mut buf = vec![0u8; ret.buffer_size.max(1)];
    loop {
        match half.read(&mut buf).await {
            Ok(0) => {
                debug!(dest = %dest, "Upstream stream closed by peer");
                break;
            }
            Ok(n) => deliver(&ret, dest.host.clone(), dest.port, Protocol::Tcp, &buf[..n]),
            Err(e) => {
                warn!(dest = %dest, error = %e, "Upstream stream read failed");
                break;
            }
        }
    }
    (ret.on_closed)();
}

// ============================================================================
// Datagram (UDP)
// ============================================================================

async fn bind_datagram(dest: &DestinationKey, timeout: Duration, ret: ReturnPath) -> Result<Upstream> {
    let unreachable = |reason: String| TunnelError::UpstreamUnreachable {
        dest: dest.clone(),
        reason,
    };
    let target = tokio::time::timeout(timeout, tokio::net::lookup_host((dest.host.as_str(), dest.port)))
        .await
        .map_err(|_| unreachable("address resolution timed out".to_string()))?
        .map_err(|e| unreachable(e.to_string()))?
        .next()
        .ok_or_else(|| unreachable("address did not resolve".to_string()))?;

    let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| unreachable(format!("bind failed: {}", e)))?;
    let socket = Arc::new(socket);
    debug!(dest = %dest, target = %target, "Upstream datagram socket bound");

    let reader_task = tokio::spawn(datagram_reader(dest.clone(), Arc::clone(&socket), ret));
    Ok(Upstream::Datagram {
        socket,
        target,
        reader_task,
    })
}

async fn datagram_reader(dest: DestinationKey, socket: Arc<UdpSocket>, ret: ReturnPath) {
    let mut buf = vec![0u8; ret.buffer_size.max(1)];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => deliver(
                &ret,
                from.ip().to_string(),
                from.port(),
                Protocol::Udp,
                &buf[..n],
            ),
            Err(e) => {
                warn!(dest = %dest, error = %e, "Upstream datagram socket failed");
                break;
            }
        }
    }
    (ret.on_closed)();
}

/// Wrap upstream bytes as a `packet_response` and queue it to the client.
fn deliver(ret: &ReturnPath, source_ip: String, source_port: u16, protocol: Protocol, data: &[u8]) {
    RelayCounters::add(&ret.counters.bytes_returned, data.len() as u64);
    let message = ControlMessage::PacketResponse {
        source_ip,
        source_port,
        protocol,
        data: data.to_vec(),
        timestamp: now_ms(),
    };
    if ret.channel.send(message) {
        RelayCounters::incr(&ret.counters.responses_sent);
    } else {
        RelayCounters::incr(&ret.counters.responses_dropped);
    }
}
