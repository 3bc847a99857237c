use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::protocol::{Announcement, ConnectReply};
use crate::types::{
    BoardProduct, Brand, ConnectionStatus, DeviceId, SessionTimeouts, DEFAULT_SYSTEM_TYPE,
    SYSTEM_TYPE_MULTISTEAM, SYSTEM_TYPE_TYLARIUM,
};

/// Everything known about an announced device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// System id
    pub id: DeviceId,
    /// Address of the session socket on the device
    pub address: SocketAddr,
    /// Brand code
    pub brand: u8,
    /// Control board product code
    pub board: u8,
    /// System type code
    pub system_type: u8,
    /// Display name
    pub name: String,
    /// PIN used to connect
    pub pin: String,
    /// Session status
    pub status: ConnectionStatus,
    /// Timeouts from the last connect reply
    pub timeouts: SessionTimeouts,
    /// Firmware description from the connect reply
    pub application_description: String,
    /// Firmware version from the connect reply
    pub application_version: String,
    /// Announced recently
    pub available: bool,
    /// Time of the last announcement
    pub last_seen: Option<Instant>,
}

impl DeviceRecord {
    /// Brand classification
    #[must_use]
    pub fn brand(&self) -> Brand {
        Brand::from(self.brand)
    }

    /// Brand display name
    #[must_use]
    pub fn brand_name(&self) -> String {
        self.brand().to_string()
    }

    /// Type display name; Multisteam and Tylarium systems override the board name
    #[must_use]
    pub fn type_name(&self) -> String {
        match self.system_type {
            SYSTEM_TYPE_MULTISTEAM => "Multisteam".to_string(),
            SYSTEM_TYPE_TYLARIUM => "Tylarium".to_string(),
            _ => BoardProduct::from(self.board).to_string(),
        }
    }

    /// Humidity controls are offered for combi manual boards and Tylarium systems
    #[must_use]
    pub fn show_humidity(&self) -> bool {
        BoardProduct::from(self.board) == BoardProduct::CombiManual
            || self.system_type == SYSTEM_TYPE_TYLARIUM
    }

    /// Session established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceRecord>,
    default_pin: String,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(default_pin: impl Into<String>) -> Self {
        Self {
            devices: HashMap::new(),
            default_pin: default_pin.into(),
        }
    }

    /// Look up a device
    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&id)
    }

    /// Look up a device for modification
    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(&id)
    }

    /// All known devices
    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Record an announcement that carries a port
    ///
    /// Returns `None` when the announcement has no port; such announcements
    /// cannot be connected to and are ignored.
    pub fn record_announcement(
        &mut self,
        announcement: &Announcement,
        from: SocketAddr,
        now: Instant,
    ) -> Option<&DeviceRecord> {
        let port = announcement.port?;
        let id = DeviceId(announcement.system_id);
        let address = SocketAddr::new(from.ip(), port);
        let system_type = announcement.system_type.unwrap_or(DEFAULT_SYSTEM_TYPE);

        let record = self.devices.entry(id).or_insert_with(|| {
            info!(
                "Discovered device {} ({}) at {}",
                id, announcement.name, address
            );
            DeviceRecord {
                id,
                address,
                brand: announcement.brand,
                board: announcement.board,
                system_type,
                name: announcement.name.clone(),
                pin: self.default_pin.clone(),
                status: ConnectionStatus::Disconnected,
                timeouts: SessionTimeouts::default(),
                application_description: String::new(),
                application_version: String::new(),
                available: true,
                last_seen: Some(now),
            }
        });

        record.address = address;
        record.brand = announcement.brand;
        record.board = announcement.board;
        record.system_type = system_type;
        record.name.clone_from(&announcement.name);
        record.available = true;
        record.last_seen = Some(now);
        Some(record)
    }

    /// Record a successful connect reply
    pub fn record_connect_reply(&mut self, reply: &ConnectReply) -> Option<&DeviceRecord> {
        let record = self.devices.get_mut(&DeviceId(reply.system_id))?;
        record.timeouts =
            SessionTimeouts::from_secs(reply.keepalive_interval, reply.lost_connection_timeout);
        record.application_description.clone_from(&reply.application_description);
        record.application_version.clone_from(&reply.application_version);
        if reply.system_type != 0 {
            record.system_type = reply.system_type;
        }
        record.status = ConnectionStatus::Connected;
        Some(record)
    }

    /// Update the session status of a device
    pub fn set_status(&mut self, id: DeviceId, status: ConnectionStatus) {
        if let Some(record) = self.devices.get_mut(&id) {
            debug!("Device {} status {} -> {}", id, record.status, status);
            record.status = status;
        }
    }

    /// Mark silent devices unavailable and return the ones that just flipped
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<DeviceId> {
        let mut expired = Vec::new();
        for record in self.devices.values_mut() {
            let silent = record
                .last_seen
                .is_none_or(|seen| now.saturating_duration_since(seen) > timeout);
            if silent && record.available {
                info!("Device {} ({}) is no longer available", record.id, record.name);
                record.available = false;
                expired.push(record.id);
            }
        }
        expired.sort();
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(system_type: Option<u8>, board: u8) -> Announcement {
        Announcement {
            system_id: 42,
            port: Some(51112),
            brand: 40,
            board,
            system_type,
            name: "Cabin".to_string(),
        }
    }

    fn from() -> SocketAddr {
        "192.168.1.50:54377".parse().unwrap()
    }

    #[test]
    fn test_announcement_creates_record() {
        let mut registry = DeviceRegistry::new("0000");
        let record = registry
            .record_announcement(&announcement(None, 37), from(), Instant::now())
            .unwrap();
        assert_eq!(record.address, "192.168.1.50:51112".parse().unwrap());
        assert_eq!(record.system_type, DEFAULT_SYSTEM_TYPE);
        assert_eq!(record.pin, "0000");
        assert_eq!(record.brand_name(), "Tylö");
        assert_eq!(record.type_name(), "Sauna");
        assert!(!record.show_humidity());
        assert_eq!(record.status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_announcement_without_port_is_ignored() {
        let mut registry = DeviceRegistry::new("0000");
        let mut msg = announcement(None, 37);
        msg.port = None;
        assert!(registry
            .record_announcement(&msg, from(), Instant::now())
            .is_none());
        assert!(registry.get(DeviceId(42)).is_none());
    }

    #[test]
    fn test_system_type_overrides_type_name() {
        let mut registry = DeviceRegistry::new("0000");
        let record = registry
            .record_announcement(&announcement(Some(22), 37), from(), Instant::now())
            .unwrap();
        assert_eq!(record.type_name(), "Tylarium");
        assert!(record.show_humidity());

        let record = registry
            .record_announcement(&announcement(Some(21), 30), from(), Instant::now())
            .unwrap();
        assert_eq!(record.type_name(), "Multisteam");
        assert!(record.show_humidity());
    }

    #[test]
    fn test_connect_reply_updates_record() {
        let mut registry = DeviceRegistry::new("0000");
        registry.record_announcement(&announcement(None, 37), from(), Instant::now());
        let record = registry
            .record_connect_reply(&ConnectReply {
                status: 10,
                system_id: 42,
                keepalive_interval: 8,
                lost_connection_timeout: 24,
                system_type: 20,
                application_description: "Elite".to_string(),
                application_version: "2.1".to_string(),
            })
            .unwrap();
        assert!(record.is_connected());
        assert_eq!(record.timeouts.keepalive_period(), Duration::from_secs(4));
        assert_eq!(record.application_version, "2.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_flips_once() {
        let mut registry = DeviceRegistry::new("0000");
        registry.record_announcement(&announcement(None, 37), from(), Instant::now());
        let timeout = Duration::from_secs(20);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(registry.sweep(Instant::now(), timeout).is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(registry.sweep(Instant::now(), timeout), vec![DeviceId(42)]);
        assert!(!registry.get(DeviceId(42)).unwrap().available);
        assert!(registry.sweep(Instant::now(), timeout).is_empty());
    }
}
