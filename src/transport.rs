use async_trait::async_trait;
use bytes::Bytes;
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{config::GatewayConfig, error::Result};

/// Largest datagram the panels send
const MAX_DATAGRAM: usize = 2048;

/// Received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sender address
    pub from: SocketAddr,
    /// Payload
    pub data: Bytes,
}

/// Datagram transport used by the session manager
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a datagram on the session socket
    async fn send_to(&self, data: Bytes, target: SocketAddr) -> Result<()>;

    /// Send a datagram to the local broadcast address on the broadcast socket
    async fn broadcast(&self, data: Bytes, port: u16) -> Result<()>;
}

/// UDP sockets for the session port and the broadcast port
pub struct UdpTransport {
    session: Arc<UdpSocket>,
    broadcast: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind both sockets
    ///
    /// # Errors
    ///
    /// Returns [`crate::GatewayError::Io`] if a port cannot be bound.
    pub async fn bind(config: &GatewayConfig) -> Result<Self> {
        let session =
            UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.session_port)).await?;
        info!("Listening for sessions on {}", session.local_addr()?);

        let broadcast = UdpSocket::bind(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            config.broadcast_listen_port,
        ))
        .await?;
        broadcast.set_broadcast(true)?;
        info!("Listening for announcements on {}", broadcast.local_addr()?);

        Ok(Self {
            session: Arc::new(session),
            broadcast: Arc::new(broadcast),
        })
    }

    /// Start the receive loops of both sockets
    ///
    /// The loops end when the returned receivers are dropped.
    #[must_use]
    pub fn spawn_receivers(&self) -> Receivers {
        let (unicast_tx, unicast) = mpsc::channel(64);
        let (broadcast_tx, broadcast) = mpsc::channel(64);
        Receivers {
            unicast,
            broadcast,
            tasks: ReceiveTasks(vec![
                spawn_receive_loop("session", self.session.clone(), unicast_tx),
                spawn_receive_loop("broadcast", self.broadcast.clone(), broadcast_tx),
            ]),
        }
    }
}

/// Inbound datagram streams of a [`UdpTransport`]
pub struct Receivers {
    /// Session socket datagrams
    pub unicast: mpsc::Receiver<Packet>,
    /// Broadcast socket datagrams
    pub broadcast: mpsc::Receiver<Packet>,
    tasks: ReceiveTasks,
}

impl Receivers {
    /// Take the session stream, the broadcast stream and the receive loops
    ///
    /// The loops stop when the returned [`ReceiveTasks`] is dropped.
    #[must_use]
    pub fn split(self) -> (mpsc::Receiver<Packet>, mpsc::Receiver<Packet>, ReceiveTasks) {
        (self.unicast, self.broadcast, self.tasks)
    }
}

/// Running receive loops, aborted on drop
pub struct ReceiveTasks(Vec<JoinHandle<()>>);

impl Drop for ReceiveTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

fn spawn_receive_loop(
    name: &'static str,
    socket: Arc<UdpSocket>,
    sender: mpsc::Sender<Packet>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    debug!("[{}] {} bytes from {}", name, len, from);
                    let packet = Packet {
                        from,
                        data: Bytes::copy_from_slice(&buf[..len]),
                    };
                    if sender.send(packet).await.is_err() {
                        debug!("[{}] receiver closed, stopping", name);
                        break;
                    }
                }
                Err(e) => warn!("[{}] receive failed: {}", name, e),
            }
        }
    })
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, data: Bytes, target: SocketAddr) -> Result<()> {
        self.session.send_to(&data, target).await?;
        Ok(())
    }

    async fn broadcast(&self, data: Bytes, port: u16) -> Result<()> {
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, port);
        self.broadcast.send_to(&data, target).await?;
        Ok(())
    }
}

/// Datagram recorded by a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// Unicast on the session socket
    Unicast {
        /// Destination
        target: SocketAddr,
        /// Payload
        data: Bytes,
    },
    /// Broadcast on the broadcast socket
    Broadcast {
        /// Destination port
        port: u16,
        /// Payload
        data: Bytes,
    },
}

impl Sent {
    /// Payload of the datagram
    #[must_use]
    pub const fn data(&self) -> &Bytes {
        match self {
            Self::Unicast { data, .. } | Self::Broadcast { data, .. } => data,
        }
    }
}

/// Transport that records datagrams instead of sending them
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<Sent>>,
}

impl MemoryTransport {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything sent so far
    pub async fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().await)
    }

    /// Number of datagrams sent so far
    pub async fn len(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Nothing has been sent
    pub async fn is_empty(&self) -> bool {
        self.sent.lock().await.is_empty()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, data: Bytes, target: SocketAddr) -> Result<()> {
        self.sent.lock().await.push(Sent::Unicast { target, data });
        Ok(())
    }

    async fn broadcast(&self, data: Bytes, port: u16) -> Result<()> {
        self.sent.lock().await.push(Sent::Broadcast { port, data });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_records() {
        let transport = MemoryTransport::new();
        let target: SocketAddr = "127.0.0.1:51112".parse().unwrap();
        transport
            .send_to(Bytes::from_static(&[0x02]), target)
            .await
            .unwrap();
        transport
            .broadcast(Bytes::from_static(&[0x04, 12]), 54378)
            .await
            .unwrap();

        assert_eq!(transport.len().await, 2);
        let sent = transport.take().await;
        assert_eq!(sent[0].data().as_ref(), &[0x02]);
        assert!(matches!(sent[1], Sent::Broadcast { port: 54378, .. }));
        assert!(transport.is_empty().await);
    }

    #[tokio::test]
    async fn test_udp_receive_loop() {
        let config = GatewayConfig {
            session_port: 0,
            broadcast_listen_port: 0,
            ..GatewayConfig::default()
        };
        let transport = UdpTransport::bind(&config).await.unwrap();
        let mut receivers = transport.spawn_receivers();

        let port = transport.session.local_addr().unwrap().port();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&[0x83, 0, 0, 0, 1], ("127.0.0.1", port))
            .await
            .unwrap();

        let packet = receivers.unicast.recv().await.unwrap();
        assert_eq!(packet.data.as_ref(), &[0x83, 0, 0, 0, 1]);
        assert_eq!(packet.from, peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_split_receivers_stop_with_tasks() {
        let config = GatewayConfig {
            session_port: 0,
            broadcast_listen_port: 0,
            ..GatewayConfig::default()
        };
        let transport = UdpTransport::bind(&config).await.unwrap();
        let (mut unicast, mut broadcast, tasks) = transport.spawn_receivers().split();

        let port = transport.broadcast.local_addr().unwrap().port();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&[0x40], ("127.0.0.1", port)).await.unwrap();
        let packet = broadcast.recv().await.unwrap();
        assert_eq!(packet.data.as_ref(), &[0x40]);

        drop(tasks);
        assert!(unicast.recv().await.is_none());
        assert!(broadcast.recv().await.is_none());
    }
}
