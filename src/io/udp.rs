// Numan Thabit 2025
// io/udp.rs - UDP socket glue: socket2 setup, tokio receive and writer tasks
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::{Datagram, Transport, TransportResult};

/// Largest UDP payload.
const MAX_DATAGRAM_LEN: usize = 65_535;

const DEFAULT_INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum UdpError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("udp writer task stopped")]
    WriterStopped,
}

/// Datagram transport over a single bound UDP socket.
///
/// Received datagrams are forwarded to the [`Receiver`] returned by
/// [`UdpTransport::bind`]; the receive task stops when that receiver is dropped
/// or the transport is dropped. Outbound datagrams are queued and written by a
/// separate task, so a socket that is not yet writable delays rather than fails
/// a send.
#[derive(Debug)]
pub struct UdpTransport {
    outbound: UnboundedSender<(Bytes, SocketAddr)>,
    local_addr: SocketAddr,
    recv_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Binds `local` with the default inbound queue depth. Must run inside a Tokio runtime.
    pub fn bind(local: SocketAddr) -> Result<(Self, Receiver<Datagram>), UdpError> {
        Self::bind_with_capacity(local, DEFAULT_INBOUND_CAPACITY)
    }

    pub fn bind_with_capacity(
        local: SocketAddr,
        inbound_capacity: usize,
    ) -> Result<(Self, Receiver<Datagram>), UdpError> {
        let domain = Domain::for_address(local);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if local.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;

        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        let local_addr = socket.local_addr()?;

        let (tx, rx) = mpsc::channel(inbound_capacity.max(1));
        let recv_task = tokio::spawn(receive_loop(Arc::clone(&socket), tx));
        let (outbound, pending) = mpsc::unbounded_channel();
        let send_task = tokio::spawn(send_loop(socket, pending));
        debug!(%local_addr, "udp transport bound");

        Ok((
            Self {
                outbound,
                local_addr,
                recv_task,
                send_task,
            },
            rx,
        ))
    }

    /// Address actually bound, with any ephemeral port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for UdpTransport {
    type Error = UdpError;

    /// Queues the datagram for the writer task. Fails only once that task has stopped.
    fn send(&mut self, payload: Bytes, addr: SocketAddr) -> TransportResult<(), Self::Error> {
        self.outbound
            .send((payload, addr))
            .map_err(|_| UdpError::WriterStopped)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
        self.send_task.abort();
    }
}

async fn send_loop(socket: Arc<UdpSocket>, mut pending: UnboundedReceiver<(Bytes, SocketAddr)>) {
    while let Some((payload, addr)) = pending.recv().await {
        match socket.send_to(&payload, addr).await {
            Ok(written) if written == payload.len() => {}
            Ok(written) => {
                warn!(%addr, written, len = payload.len(), "short datagram write");
            }
            // Best effort: a dropped datagram is indistinguishable from loss.
            Err(err) => {
                warn!(%addr, error = %err, "udp send failed; datagram dropped");
            }
        }
    }
    debug!("transport dropped; stopping writer task");
}

async fn receive_loop(socket: Arc<UdpSocket>, inbound: Sender<Datagram>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP errors from earlier sends surface here on some platforms.
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(err) => {
                warn!(error = %err, "udp receive failed; stopping receive task");
                break;
            }
        };
        let datagram = Datagram::new(Bytes::copy_from_slice(&buf[..len]), source);
        if inbound.send(datagram).await.is_err() {
            debug!("inbound receiver dropped; stopping receive task");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn datagrams_reach_the_inbound_channel() {
        let (mut sender, _sender_rx) = UdpTransport::bind(loopback()).expect("bind sender");
        let (receiver, mut inbound) = UdpTransport::bind(loopback()).expect("bind receiver");
        assert_ne!(receiver.local_addr().port(), 0);

        sender
            .send(Bytes::from_static(b"ping"), receiver.local_addr())
            .expect("send");

        let datagram = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .expect("datagram in time")
            .expect("channel open");
        assert_eq!(datagram.payload, Bytes::from_static(b"ping"));
        assert_eq!(datagram.source, sender.local_addr());
    }

    #[tokio::test]
    async fn burst_right_after_bind_is_delivered() {
        let (receiver, mut inbound) = UdpTransport::bind(loopback()).expect("bind receiver");
        let (mut sender, _sender_rx) = UdpTransport::bind(loopback()).expect("bind sender");

        for n in 0u8..16 {
            sender
                .send(Bytes::copy_from_slice(&[n]), receiver.local_addr())
                .expect("queued");
        }

        let mut seen = Vec::new();
        while seen.len() < 16 {
            let datagram = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
                .await
                .expect("datagram in time")
                .expect("channel open");
            seen.push(datagram.payload[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0u8..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn send_after_writer_stops_is_an_error() {
        let (mut transport, _inbound) = UdpTransport::bind(loopback()).expect("bind");
        transport.send_task.abort();
        let _ = (&mut transport.send_task).await;

        let err = transport
            .send(Bytes::from_static(b"late"), loopback())
            .expect_err("writer gone");
        assert!(matches!(err, UdpError::WriterStopped));
    }

    #[tokio::test]
    async fn dropping_transport_closes_inbound() {
        let (transport, mut inbound) = UdpTransport::bind(loopback()).expect("bind");
        drop(transport);
        let closed = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .expect("receive task aborted");
        assert!(closed.is_none());
    }
}
