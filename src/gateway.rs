use std::{future::Future, sync::Arc};

use tokio::{
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::{
    bus::{self, BusMessage, InboundCommand, Publisher},
    config::GatewayConfig,
    error::{GatewayError, Result},
    session::{SessionManager, TimerEvent},
    transport::{Packet, Transport},
};

/// Streams feeding the gateway event loop
pub struct GatewayInputs {
    /// Datagrams received on the session socket
    pub unicast: mpsc::Receiver<Packet>,
    /// Datagrams received on the broadcast socket
    pub broadcast: mpsc::Receiver<Packet>,
    /// Messages received on the command topics; `retain` is ignored
    pub commands: mpsc::Receiver<BusMessage>,
}

/// The bridge: a session manager driven by a single event loop
pub struct Gateway {
    session: SessionManager,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
    publisher: Arc<dyn Publisher>,
}

impl Gateway {
    /// Create a gateway over a transport and a bus publisher
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let (session, timers) = SessionManager::new(config, transport, publisher.clone());
        Self {
            session,
            timers,
            publisher,
        }
    }

    /// Session manager, for queries and direct commands
    #[must_use]
    pub const fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Session manager, for direct commands
    pub fn session_mut(&mut self) -> &mut SessionManager {
        &mut self.session
    }

    /// Run until `shutdown` completes or every input closes
    ///
    /// Every inbound datagram, timer firing and bus command is handled to
    /// completion before the next one is taken, so handlers never overlap.
    ///
    /// # Errors
    ///
    /// Returns the first error the loop cannot recover from, such as a
    /// second device claiming the session port.
    pub async fn run(
        mut self,
        mut inputs: GatewayInputs,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        tokio::pin!(shutdown);

        let topics = self.session.topics().clone();
        self.publish(bus::bridge_available(&topics, true)).await;
        info!(
            "Bridge up, commands on {}",
            topics.command_filters().join(", ")
        );
        if self.session.config().announce_on_start {
            self.session.request_announcements().await;
        }

        let mut sweep = time::interval(self.session.config().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let result = tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(packet) = inputs.unicast.recv() => self.session.on_unicast(&packet).await,
                Some(packet) = inputs.broadcast.recv() => self.session.on_announcement(&packet).await,
                Some(event) = self.timers.recv() => self.session.on_timer(event).await,
                Some(message) = inputs.commands.recv() => self.on_command(&message).await,
                _ = sweep.tick() => {
                    self.session.sweep(Instant::now()).await;
                    Ok(())
                }
                else => break Err(GatewayError::ChannelClosed("gateway inputs")),
            };
            if let Err(e) = check(result) {
                break Err(e);
            }
        };

        self.session.disconnect_all().await;
        self.publish(bus::bridge_available(&topics, false)).await;
        outcome
    }

    async fn on_command(&mut self, message: &BusMessage) -> Result<()> {
        match InboundCommand::parse(self.session.topics(), &message.topic, &message.payload) {
            Some(command) => self.session.handle_command(command).await,
            None => Ok(()),
        }
    }

    async fn publish(&self, message: BusMessage) {
        if let Err(e) = self.publisher.publish(message).await {
            warn!("Failed to publish bridge availability: {}", e);
        }
    }
}

/// Log recoverable failures and pass on the rest
fn check(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_recoverable() => {
            warn!("{}", e);
            Ok(())
        }
        Err(e) => {
            error!("Stopping gateway: {}", e);
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelPublisher;
    use crate::protocol::{Announcement, Outbound};
    use crate::transport::MemoryTransport;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn test_run_announces_and_shuts_down() {
        let transport = Arc::new(MemoryTransport::new());
        let (publisher, mut bus) = ChannelPublisher::channel();
        let gateway = Gateway::new(GatewayConfig::default(), transport.clone(), Arc::new(publisher));

        let (_unicast_tx, unicast) = mpsc::channel(4);
        let (broadcast_tx, broadcast) = mpsc::channel(4);
        let (_command_tx, commands) = mpsc::channel(4);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(gateway.run(
            GatewayInputs {
                unicast,
                broadcast,
                commands,
            },
            async move {
                let _ = stop_rx.await;
            },
        ));

        let announcement = Announcement {
            system_id: 77,
            port: Some(51112),
            brand: 20,
            board: 37,
            system_type: None,
            name: "Spa".to_string(),
        };
        broadcast_tx
            .send(Packet {
                from: "10.0.0.9:54378".parse().unwrap(),
                data: announcement.to_bytes(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let sent = transport.take().await;
        assert!(matches!(
            Outbound::from_bytes(sent[0].data()).unwrap(),
            Outbound::AnnouncementRequest { .. }
        ));
        assert!(matches!(
            Outbound::from_bytes(sent[1].data()).unwrap(),
            Outbound::ConnectRequest { .. }
        ));

        let first = bus.recv().await.unwrap();
        assert_eq!(first.topic, "tylohelo-mqtt-ha/available");
        assert_eq!(first.payload, "true");
        assert!(first.retain);
        let mut last = first;
        while let Ok(message) = bus.try_recv() {
            last = message;
        }
        assert_eq!(last.topic, "tylohelo-mqtt-ha/available");
        assert_eq!(last.payload, "false");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_device_stops_the_loop() {
        let transport = Arc::new(MemoryTransport::new());
        let (publisher, _bus) = ChannelPublisher::channel();
        let config = GatewayConfig {
            announce_on_start: false,
            ..GatewayConfig::default()
        };
        let gateway = Gateway::new(config, transport, Arc::new(publisher));

        let (_unicast_tx, unicast) = mpsc::channel(4);
        let (broadcast_tx, broadcast) = mpsc::channel(4);
        let (_command_tx, commands) = mpsc::channel(4);
        for system_id in [1, 2] {
            let announcement = Announcement {
                system_id,
                port: Some(51112),
                brand: 10,
                board: 37,
                system_type: None,
                name: "Cabin".to_string(),
            };
            broadcast_tx
                .send(Packet {
                    from: "10.0.0.9:54378".parse().unwrap(),
                    data: announcement.to_bytes(),
                })
                .await
                .unwrap();
        }

        let result = gateway
            .run(
                GatewayInputs {
                    unicast,
                    broadcast,
                    commands,
                },
                std::future::pending(),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::PortInUse { .. })));
    }
}
