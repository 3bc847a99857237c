use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{self, BusCommand, BusMessage, InboundCommand, Publisher, Topics},
    calendar::{is_date_program, CalendarEngine, CalendarEntry, TimeGap, WindowEntry, WorkingEntry},
    config::GatewayConfig,
    error::{GatewayError, Result},
    protocol::{
        Announcement, AuxRelay, ConnectReply, Favorite, GeneralCommand, Inbound, IntegerValueType,
        Outbound, StateUpdate, UserMessage, ANSWER_OK, ANSWER_PENDING, CONNECT_STATUS_SUCCESS,
        MESSAGE_TYPE_ERROR, MESSAGE_TYPE_OK, PROFILE_HOME_AUTOMATION,
    },
    registry::{DeviceRecord, DeviceRegistry},
    state::{DeviceState, StateEvent, StateModel},
    transport::{Packet, Transport},
    types::{ConnectionStatus, DeviceId, RunMode, RunState},
};

/// Kind of a per-device timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// One-shot delay before the first discovery publish
    Discovery,
    /// Periodic keepalive send
    KeepAlive,
    /// One-shot silence timeout, re-armed by every keepalive ack
    LostConnection,
}

/// A timer firing, delivered through the channel returned by [`SessionManager::new`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Device the timer belongs to
    pub device_id: DeviceId,
    /// Which timer fired
    pub kind: TimerKind,
    /// Arming generation; firings of replaced timers are discarded
    pub generation: u64,
}

#[derive(Debug, Default)]
struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    fn arm_once(
        &mut self,
        device_id: DeviceId,
        kind: TimerKind,
        delay: Duration,
        sender: &mpsc::UnboundedSender<TimerEvent>,
    ) {
        self.cancel();
        let event = TimerEvent {
            device_id,
            kind,
            generation: self.generation,
        };
        let sender = sender.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(event);
        }));
    }

    fn arm_repeating(
        &mut self,
        device_id: DeviceId,
        kind: TimerKind,
        period: Duration,
        sender: &mpsc::UnboundedSender<TimerEvent>,
    ) {
        self.cancel();
        let event = TimerEvent {
            device_id,
            kind,
            generation: self.generation,
        };
        let sender = sender.clone();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if sender.send(event).is_err() {
                    break;
                }
            }
        }));
    }

    const fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
struct DeviceTimers {
    discovery: TimerSlot,
    keepalive: TimerSlot,
    lost: TimerSlot,
}

impl DeviceTimers {
    fn cancel_all(&mut self) {
        self.discovery.cancel();
        self.keepalive.cancel();
        self.lost.cancel();
    }

    const fn slot(&self, kind: TimerKind) -> &TimerSlot {
        match kind {
            TimerKind::Discovery => &self.discovery,
            TimerKind::KeepAlive => &self.keepalive,
            TimerKind::LostConnection => &self.lost,
        }
    }
}

/// Session lifecycle manager
///
/// Owns every piece of per-device state: the registry, state snapshots,
/// calendar lists, timers and the session port binding. All methods run on
/// the gateway event loop, so nothing here is shared across tasks except
/// the timer channel.
pub struct SessionManager {
    config: GatewayConfig,
    topics: Topics,
    registry: DeviceRegistry,
    states: StateModel,
    calendar: CalendarEngine,
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publisher>,
    bindings: HashMap<u16, DeviceId>,
    timers: HashMap<DeviceId, DeviceTimers>,
    keepalive_sequences: HashMap<DeviceId, u32>,
    discovery_sent: HashMap<DeviceId, bool>,
    timer_sender: mpsc::UnboundedSender<TimerEvent>,
}

impl SessionManager {
    /// Create a manager and the receiving end of its timer channel
    ///
    /// Timer events must be fed back through [`SessionManager::on_timer`].
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        publisher: Arc<dyn Publisher>,
    ) -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (timer_sender, timer_receiver) = mpsc::unbounded_channel();
        let manager = Self {
            topics: Topics::new(config.topic_prefix.clone()),
            registry: DeviceRegistry::new(config.default_pin.clone()),
            states: StateModel::new(),
            calendar: CalendarEngine::new(config.noon_offset()),
            config,
            transport,
            publisher,
            bindings: HashMap::new(),
            timers: HashMap::new(),
            keepalive_sequences: HashMap::new(),
            discovery_sent: HashMap::new(),
            timer_sender,
        };
        (manager, timer_receiver)
    }

    /// Runtime configuration
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Topic layout
    #[must_use]
    pub const fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Known devices
    #[must_use]
    pub const fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Record of one device
    #[must_use]
    pub fn device(&self, device_id: DeviceId) -> Option<&DeviceRecord> {
        self.registry.get(device_id)
    }

    /// State snapshot of one device
    #[must_use]
    pub fn state(&self, device_id: DeviceId) -> Option<&DeviceState> {
        self.states.get(device_id)
    }

    /// Device bound to a local port
    #[must_use]
    pub fn bound_device(&self, port: u16) -> Option<DeviceId> {
        self.bindings.get(&port).copied()
    }

    /// Whether the initial discovery configs of the session were published
    #[must_use]
    pub fn discovery_sent(&self, device_id: DeviceId) -> bool {
        self.discovery_sent.get(&device_id).copied().unwrap_or(false)
    }

    /// Devices with an established session
    pub fn connected_devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.registry
            .devices()
            .filter(|record| record.is_connected())
            .map(|record| record.id)
    }

    // ---- inbound traffic ----

    /// Handle a datagram from the broadcast socket
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PortInUse`] when auto-connect targets a second
    /// device while the session port is bound.
    pub async fn on_announcement(&mut self, packet: &Packet) -> Result<()> {
        let announcement = match Announcement::from_bytes(&packet.data) {
            Ok(announcement) => announcement,
            Err(e) => {
                error!("Dropping undecodable announcement from {}: {}", packet.from, e);
                return Ok(());
            }
        };
        if announcement.port.is_none() {
            error!(
                "Announcement of device {} carries no port, cannot connect",
                announcement.system_id
            );
            return Ok(());
        }

        let Some(record) =
            self.registry
                .record_announcement(&announcement, packet.from, Instant::now())
        else {
            return Ok(());
        };
        let device_id = record.id;
        let status = record.status;
        let message = bus::available(&self.topics, record, true);
        self.publish(message).await;

        if self.config.auto_connect && status == ConnectionStatus::Disconnected {
            self.connect(device_id).await?;
        }
        Ok(())
    }

    /// Handle a datagram from the session socket
    ///
    /// Datagrams that arrive while no device is bound, or that fail to
    /// decode, are logged and dropped.
    ///
    /// # Errors
    ///
    /// Only errors that the event loop cannot recover from are returned.
    pub async fn on_unicast(&mut self, packet: &Packet) -> Result<()> {
        let Some(device_id) = self.bound_device(self.config.session_port) else {
            warn!(
                "Received packet from {} on an unbound port, waiting for announcement...",
                packet.from
            );
            return Ok(());
        };
        let message = match Inbound::from_bytes(&packet.data) {
            Ok(message) => message,
            Err(e) => {
                error!("Dropping undecodable packet from {}: {}", packet.from, e);
                return Ok(());
            }
        };
        debug!("[IN] {} from device {}", message.name(), device_id);

        match message {
            Inbound::ConnectReply(reply) => self.on_connect_reply(device_id, &reply).await,
            Inbound::NoConnection => self.disconnect_device(device_id, true).await,
            Inbound::KeepAliveAck { .. } => {
                self.on_keepalive_ack(device_id);
                Ok(())
            }
            Inbound::StateUpdate(update) => {
                self.on_state_update(device_id, &update).await;
                Ok(())
            }
        }
    }

    async fn on_connect_reply(&mut self, device_id: DeviceId, reply: &ConnectReply) -> Result<()> {
        if reply.system_id != device_id.0 {
            warn!(
                "Connect reply from system {} while bound to device {} - ignoring",
                reply.system_id, device_id
            );
            return Ok(());
        }
        if reply.status != CONNECT_STATUS_SUCCESS {
            error!(
                "Connection to device {} refused with status {}",
                device_id, reply.status
            );
            self.registry
                .set_status(device_id, ConnectionStatus::Disconnected);
            self.timers_of(device_id).cancel_all();
            self.release_binding(device_id);
            return Ok(());
        }

        let Some(record) = self.registry.record_connect_reply(reply) else {
            return Err(GatewayError::UnknownDevice(device_id));
        };
        info!(
            "Connected to device {} ({} {}), firmware {} {}",
            device_id,
            record.brand_name(),
            record.type_name(),
            record.application_description,
            record.application_version
        );
        let period = record.timeouts.keepalive_period();
        let address = record.address;
        let message = bus::connected(&self.topics, record, true);

        let sender = self.timer_sender.clone();
        self.timers_of(device_id)
            .keepalive
            .arm_repeating(device_id, TimerKind::KeepAlive, period, &sender);

        for command in [
            GeneralCommand::SendCharacterTable,
            GeneralCommand::SendMaxHumidityTable,
            GeneralCommand::SendMaxTemperatureTable,
        ] {
            self.send(address, &Outbound::GeneralCommands(vec![command]))
                .await;
        }
        self.publish(message).await;
        Ok(())
    }

    fn on_keepalive_ack(&mut self, device_id: DeviceId) {
        let Some(record) = self.registry.get(device_id) else {
            return;
        };
        if !record.is_connected() {
            debug!("Keepalive ack from device {} outside a session", device_id);
            return;
        }
        let timeout = record.timeouts.lost_connection_timeout;
        let sender = self.timer_sender.clone();
        self.timers_of(device_id).lost.arm_once(
            device_id,
            TimerKind::LostConnection,
            timeout,
            &sender,
        );
    }

    async fn on_state_update(&mut self, device_id: DeviceId, update: &StateUpdate) {
        let events = self.states.apply(device_id, update, &mut self.calendar);
        for event in events {
            self.publish_state_event(device_id, &event).await;
        }
    }

    async fn publish_state_event(&self, device_id: DeviceId, event: &StateEvent) {
        let Some(record) = self.registry.get(device_id) else {
            return;
        };
        let messages = if matches!(event, StateEvent::DiscoveryRequested) {
            if !self.discovery_sent(device_id) {
                return;
            }
            let Some(state) = self.states.get(device_id) else {
                return;
            };
            bus::discovery_messages(&self.topics, record, state, false)
        } else {
            bus::publications_for(&self.topics, record, event)
        };
        for message in messages {
            self.publish(message).await;
        }
    }

    /// Handle a timer firing
    ///
    /// Firings of cancelled or replaced timers are ignored.
    ///
    /// # Errors
    ///
    /// Only errors that the event loop cannot recover from are returned.
    pub async fn on_timer(&mut self, event: TimerEvent) -> Result<()> {
        let current = self
            .timers
            .get(&event.device_id)
            .is_some_and(|timers| timers.slot(event.kind).is_current(event.generation));
        if !current {
            debug!("Discarding stale {:?} timer of device {}", event.kind, event.device_id);
            return Ok(());
        }

        match event.kind {
            TimerKind::Discovery => {
                self.timers_of(event.device_id).discovery.handle = None;
                self.publish_discovery(event.device_id).await;
                Ok(())
            }
            TimerKind::KeepAlive => {
                self.send_keepalive(event.device_id).await;
                Ok(())
            }
            TimerKind::LostConnection => {
                self.timers_of(event.device_id).lost.handle = None;
                warn!("Lost connection to device {}", event.device_id);
                self.disconnect_device(event.device_id, false).await
            }
        }
    }

    async fn publish_discovery(&mut self, device_id: DeviceId) {
        let Some(record) = self.registry.get(device_id) else {
            return;
        };
        let state = self.states.state(device_id);
        let messages = bus::discovery_messages(&self.topics, record, state, true);
        info!(
            "Publishing {} discovery configs for device {}",
            messages.len(),
            device_id
        );
        for message in messages {
            self.publish(message).await;
        }
        self.discovery_sent.insert(device_id, true);
    }

    async fn send_keepalive(&mut self, device_id: DeviceId) {
        let Some(address) = self.ensure_connected(device_id, "keepAlive") else {
            return;
        };
        let sequence = self.keepalive_sequences.entry(device_id).or_insert(0);
        *sequence = sequence.wrapping_add(1);
        let message = Outbound::KeepAlive {
            sequence: *sequence,
        };
        self.send(address, &message).await;
    }

    /// Report devices that stopped announcing
    pub async fn sweep(&mut self, now: Instant) {
        let expired = self
            .registry
            .sweep(now, self.config.availability_timeout);
        for device_id in expired {
            if let Some(record) = self.registry.get(device_id) {
                let message = bus::available(&self.topics, record, false);
                self.publish(message).await;
            }
        }
    }

    // ---- session lifecycle ----

    /// Open a session with an announced device
    ///
    /// Binds the session port, restores default state, sends the connect
    /// request and arms the discovery timer. Reconnecting an already bound
    /// device replaces all of its timers.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownDevice`] if the device was never
    /// announced and [`GatewayError::PortInUse`] if the session port is bound
    /// to another device. Nothing is sent in either case.
    pub async fn connect(&mut self, device_id: DeviceId) -> Result<()> {
        let record = self
            .registry
            .get(device_id)
            .ok_or(GatewayError::UnknownDevice(device_id))?;
        let port = self.config.session_port;
        if let Some(&bound) = self.bindings.get(&port) {
            if bound != device_id {
                return Err(GatewayError::PortInUse {
                    port,
                    bound,
                    requested: device_id,
                });
            }
        }

        info!("Connecting to device {} ({}) at {}...", device_id, record.name, record.address);
        let address = record.address;
        let request = Outbound::connect_request(&record.pin, &self.config.application_description);

        self.bindings.insert(port, device_id);
        self.timers_of(device_id).cancel_all();
        self.states.reset(device_id);
        self.calendar.clear_working_entry(device_id);
        self.registry
            .set_status(device_id, ConnectionStatus::Connecting);
        self.send(address, &request).await;

        self.discovery_sent.insert(device_id, false);
        let delay = self.config.discovery_delay;
        let sender = self.timer_sender.clone();
        self.timers_of(device_id)
            .discovery
            .arm_once(device_id, TimerKind::Discovery, delay, &sender);
        Ok(())
    }

    /// Close the session with a device
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownDevice`] if the device was never announced.
    pub async fn disconnect(&mut self, device_id: DeviceId) -> Result<()> {
        self.disconnect_device(device_id, false).await
    }

    /// Close every open session, used on shutdown
    pub async fn disconnect_all(&mut self) {
        let devices: Vec<DeviceId> = self.connected_devices().collect();
        for device_id in devices {
            if let Err(e) = self.disconnect_device(device_id, false).await {
                warn!("Failed to disconnect device {}: {}", device_id, e);
            }
        }
    }

    /// `forced` means the device already dropped the session, so no
    /// disconnect request is sent
    async fn disconnect_device(&mut self, device_id: DeviceId, forced: bool) -> Result<()> {
        let address = self
            .registry
            .get(device_id)
            .map(|record| record.address)
            .ok_or(GatewayError::UnknownDevice(device_id))?;

        self.timers_of(device_id).cancel_all();
        if forced {
            info!("Device {} reports no connection", device_id);
        } else {
            info!("Disconnecting from device {}...", device_id);
            self.send(address, &Outbound::DisconnectRequest).await;
        }

        self.registry
            .set_status(device_id, ConnectionStatus::Disconnected);
        self.states.reset(device_id);
        self.calendar.clear_working_entry(device_id);
        self.release_binding(device_id);
        if let Some(record) = self.registry.get(device_id) {
            let message = bus::connected(&self.topics, record, false);
            self.publish(message).await;
        }
        Ok(())
    }

    fn release_binding(&mut self, device_id: DeviceId) {
        self.bindings.retain(|_, bound| *bound != device_id);
    }

    fn timers_of(&mut self, device_id: DeviceId) -> &mut DeviceTimers {
        self.timers.entry(device_id).or_default()
    }

    // ---- commands ----

    /// Dispatch a command parsed from a bus topic
    ///
    /// # Errors
    ///
    /// Only errors that the event loop cannot recover from are returned.
    pub async fn handle_command(&mut self, command: InboundCommand) -> Result<()> {
        let device_id = command.device_id;
        match command.command {
            BusCommand::SetMode(mode) => self.set_mode(device_id, mode).await,
            BusCommand::SetTargetTemperature(value) => {
                self.set_target_temperature(device_id, value).await;
            }
            BusCommand::SetTargetHumidity(value) => {
                self.set_target_humidity(device_id, value).await;
            }
            BusCommand::SetLight(on) => self.set_lighting(device_id, on).await,
            BusCommand::AckError => self.acknowledge_error(device_id).await,
        }
        Ok(())
    }

    /// Request a new target temperature
    pub async fn set_target_temperature(&self, device_id: DeviceId, value: i32) {
        self.send_command(
            device_id,
            "setTargetTemperature",
            Outbound::integer(IntegerValueType::TargetTemperature, value),
        )
        .await;
    }

    /// Request a new target humidity
    pub async fn set_target_humidity(&self, device_id: DeviceId, value: i32) {
        self.send_command(
            device_id,
            "setTargetHumidity",
            Outbound::integer(IntegerValueType::TargetHumidity, value),
        )
        .await;
    }

    /// Request a new bath time in minutes
    pub async fn set_bath_time(&self, device_id: DeviceId, minutes: i32) {
        self.send_command(
            device_id,
            "setBathTime",
            Outbound::integer(IntegerValueType::BathTime, minutes),
        )
        .await;
    }

    /// Start a stored favorite
    pub async fn start_favorite(&self, device_id: DeviceId, index: u8) {
        self.send_command(
            device_id,
            "startFavorite",
            Outbound::integer(IntegerValueType::StartFavorite, i32::from(index)),
        )
        .await;
    }

    /// Request a run state change
    pub async fn set_run_state(&self, device_id: DeviceId, state: RunState) {
        self.send_command(device_id, "setSaunaState", Outbound::RunStateChange(state.code()))
            .await;
    }

    /// Request the run state behind a climate mode
    pub async fn set_mode(&self, device_id: DeviceId, mode: RunMode) {
        self.set_run_state(device_id, mode.run_state()).await;
    }

    /// Switch the cabin light
    pub async fn set_lighting(&self, device_id: DeviceId, on: bool) {
        self.send_command(device_id, "setLighting", Outbound::lighting(on))
            .await;
    }

    /// Replace favorites on the device
    pub async fn set_favorites(&self, device_id: DeviceId, favorites: Vec<Favorite>) {
        self.send_command(device_id, "setFavorites", Outbound::Favorites(favorites))
            .await;
    }

    /// Replace auxiliary relay settings on the device
    pub async fn set_aux_relays(&self, device_id: DeviceId, relays: Vec<AuxRelay>) {
        self.send_command(device_id, "setAux", Outbound::AuxRelays(relays))
            .await;
    }

    /// Send a user message answer
    pub async fn post_user_message(&self, device_id: DeviceId, message: UserMessage) {
        self.send_command(device_id, "postUserMessage", Outbound::UserMessage(message))
            .await;
    }

    /// Acknowledge the pending panel message
    ///
    /// Only OK and error messages that still wait for an answer are
    /// acknowledged; anything else is ignored.
    pub async fn acknowledge_error(&mut self, device_id: DeviceId) {
        if self.ensure_connected(device_id, "ackError").is_none() {
            return;
        }
        let Some(message) = self
            .states
            .get(device_id)
            .and_then(|state| state.user_message.as_ref())
        else {
            debug!("No panel message to acknowledge on device {}", device_id);
            return;
        };
        if !matches!(message.message_type, MESSAGE_TYPE_OK | MESSAGE_TYPE_ERROR)
            || message.answer != ANSWER_PENDING
        {
            debug!(
                "Panel message {} of device {} needs no answer",
                message.identity, device_id
            );
            return;
        }

        let mut answer = message.clone();
        answer.answer = ANSWER_OK;
        if let Some(stored) = self.states.state_mut(device_id).user_message.as_mut() {
            stored.answer = ANSWER_OK;
        }
        self.post_user_message(device_id, answer).await;
    }

    /// Store or update a date program on the device
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidCalendarIndex`] for slots outside the
    /// date programs, before anything is sent.
    pub async fn save_calendar_entry(
        &self,
        device_id: DeviceId,
        entry: &CalendarEntry,
    ) -> Result<()> {
        if !is_date_program(entry.index) {
            return Err(GatewayError::InvalidCalendarIndex(entry.index));
        }
        self.send_command(
            device_id,
            "saveCalendarEntry",
            Outbound::CalendarPosts(vec![entry.to_program()]),
        )
        .await;
        Ok(())
    }

    /// Invalidate a date program on the device
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidCalendarIndex`] for slots outside the
    /// date programs, before anything is sent.
    pub async fn delete_calendar_entry(
        &self,
        device_id: DeviceId,
        entry: &CalendarEntry,
    ) -> Result<()> {
        if !is_date_program(entry.index) {
            return Err(GatewayError::InvalidCalendarIndex(entry.index));
        }
        let mut program = entry.to_program();
        program.valid = false;
        self.send_command(
            device_id,
            "deleteCalendarEntry",
            Outbound::CalendarPosts(vec![program]),
        )
        .await;
        Ok(())
    }

    /// Broadcast an announcement request
    pub async fn request_announcements(&self) {
        let message = Outbound::AnnouncementRequest {
            profile: PROFILE_HOME_AUTOMATION,
        };
        let port = self.config.broadcast_send_port;
        debug!("[OUT] {} to broadcast:{}", message.name(), port);
        if let Err(e) = self.transport.broadcast(message.to_bytes(), port).await {
            warn!("Failed to broadcast {}: {}", message.name(), e);
        }
    }

    // ---- calendar queries ----

    /// Date programs intersecting the next 24 hours of device time
    #[must_use]
    pub fn calendar_window(&self, device_id: DeviceId) -> Vec<WindowEntry<'_>> {
        self.states
            .get(device_id)
            .map(|state| self.calendar.window_entries(device_id, state))
            .unwrap_or_default()
    }

    /// Free time in the next 24 hours of device time
    #[must_use]
    pub fn free_gaps(&self, device_id: DeviceId) -> Vec<TimeGap> {
        self.states
            .get(device_id)
            .map(|state| self.calendar.free_gaps(device_id, state))
            .unwrap_or_default()
    }

    /// Best gap for a new program, capped at the preferred bath length
    #[must_use]
    pub fn preferred_gap(&self, device_id: DeviceId) -> Option<TimeGap> {
        let state = self.states.get(device_id)?;
        self.calendar.preferred_gap(device_id, state)
    }

    /// New program in the first free slot at the preferred gap
    #[must_use]
    pub fn synthesize_calendar_entry(&self, device_id: DeviceId) -> Option<CalendarEntry> {
        let state = self.states.get(device_id)?;
        self.calendar.synthesize_entry(device_id, state)
    }

    /// Entry being edited, created on first access
    pub fn working_calendar_entry(
        &mut self,
        device_id: DeviceId,
        index: Option<u8>,
    ) -> Option<&WorkingEntry> {
        let state = self.states.get(device_id)?;
        self.calendar.working_entry(device_id, index, state)
    }

    /// Forget the entry being edited
    pub fn clear_working_calendar_entry(&mut self, device_id: DeviceId) {
        self.calendar.clear_working_entry(device_id);
    }

    // ---- plumbing ----

    fn ensure_connected(&self, device_id: DeviceId, operation: &str) -> Option<SocketAddr> {
        match self.registry.get(device_id) {
            Some(record) if record.is_connected() => Some(record.address),
            Some(_) => {
                warn!("[{}] Not connected to device {}!", operation, device_id);
                None
            }
            None => {
                warn!("[{}] Unknown device {}", operation, device_id);
                None
            }
        }
    }

    async fn send_command(&self, device_id: DeviceId, operation: &str, message: Outbound) {
        if let Some(address) = self.ensure_connected(device_id, operation) {
            self.send(address, &message).await;
        }
    }

    async fn send(&self, address: SocketAddr, message: &Outbound) {
        debug!("[OUT] {} to {}", message.name(), address);
        let data: Bytes = message.to_bytes();
        if let Err(e) = self.transport.send_to(data, address).await {
            warn!("Failed to send {} to {}: {}", message.name(), address, e);
        }
    }

    async fn publish(&self, message: BusMessage) {
        let topic = message.topic.clone();
        if let Err(e) = self.publisher.publish(message).await {
            warn!("Failed to publish [{}]: {}", topic, e);
        }
    }
}
