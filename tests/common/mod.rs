#![allow(dead_code)]

use std::sync::Arc;

use chrono::FixedOffset;
use tokio::sync::mpsc;
use tylohelo_bridge::{
    protocol::{Announcement, ConnectReply, Inbound, Outbound, StateUpdate, CONNECT_STATUS_SUCCESS},
    BusMessage, ChannelPublisher, DeviceId, GatewayConfig, MemoryTransport, Packet,
    SessionManager, TimerEvent,
};

pub const DEVICE: DeviceId = DeviceId(1_000_001);
pub const OTHER: DeviceId = DeviceId(1_000_002);

/// Session manager wired to in-memory transport and bus
pub struct Bridge {
    pub session: SessionManager,
    pub timers: mpsc::UnboundedReceiver<TimerEvent>,
    pub transport: Arc<MemoryTransport>,
    pub bus: mpsc::UnboundedReceiver<BusMessage>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig {
            auto_connect: false,
            utc_offset: FixedOffset::east_opt(0),
            ..GatewayConfig::default()
        })
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let (publisher, bus) = ChannelPublisher::channel();
        let (session, timers) = SessionManager::new(config, transport.clone(), Arc::new(publisher));
        Self {
            session,
            timers,
            transport,
            bus,
        }
    }

    pub fn published(&mut self) -> Vec<BusMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.bus.try_recv() {
            out.push(message);
        }
        out
    }

    pub async fn sent(&self) -> Vec<Outbound> {
        self.transport
            .take()
            .await
            .iter()
            .map(|sent| Outbound::from_bytes(sent.data()).unwrap())
            .collect()
    }

    pub async fn announce(&mut self, device: DeviceId) {
        let announcement = Announcement {
            system_id: device.0,
            port: Some(51112),
            brand: 10,
            board: 37,
            system_type: None,
            name: "Sauna".to_string(),
        };
        let packet = Packet {
            from: "192.168.0.40:54378".parse().unwrap(),
            data: announcement.to_bytes(),
        };
        self.session.on_announcement(&packet).await.unwrap();
    }

    pub async fn receive(&mut self, message: Inbound) {
        let packet = Packet {
            from: "192.168.0.40:51112".parse().unwrap(),
            data: message.to_bytes(),
        };
        self.session.on_unicast(&packet).await.unwrap();
    }

    pub async fn update(&mut self, update: StateUpdate) {
        self.receive(Inbound::StateUpdate(Box::new(update))).await;
    }

    /// Deliver a connect reply with the given status from `device`
    pub async fn reply(&mut self, device: DeviceId, status: u8) {
        self.receive(Inbound::ConnectReply(ConnectReply {
            status,
            system_id: device.0,
            keepalive_interval: 10,
            lost_connection_timeout: 30,
            system_type: 20,
            application_description: "Pure".to_string(),
            application_version: "3.0".to_string(),
        }))
        .await;
    }

    /// Announce, connect and accept the connect reply
    pub async fn connected(device: DeviceId) -> Self {
        let mut bridge = Self::new();
        bridge.announce(device).await;
        bridge.session.connect(device).await.unwrap();
        bridge.reply(device, CONNECT_STATUS_SUCCESS).await;
        bridge.transport.take().await;
        bridge.published();
        bridge
    }
}
