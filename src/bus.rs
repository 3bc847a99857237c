//! Message bus side of the bridge.
//!
//! Maps state changes to topic publications, builds the Home Assistant
//! discovery payloads and parses inbound command topics.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::registry::DeviceRecord;
use crate::state::{DeviceState, StateEvent};
use crate::types::{DeviceId, RunMode, TemperatureUnit, WaterLevel};

/// Discovery topic root
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// User message identities that mean the door is open
const DOOR_MESSAGE_IDENTITIES: [u8; 2] = [19, 20];

/// A single publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Full topic
    pub topic: String,
    /// Payload text
    pub payload: String,
    /// Retained on the broker
    pub retain: bool,
}

impl BusMessage {
    fn new(topic: String, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: false,
        }
    }

    fn retained(topic: String, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: true,
        }
    }
}

/// Outbound side of the message bus
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message
    async fn publish(&self, message: BusMessage) -> Result<()>;
}

/// Publisher forwarding into a channel, for embedding and tests
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end of its channel
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BusMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| GatewayError::ChannelClosed("bus publications"))
    }
}

/// Publisher that only logs, used when no broker client is attached
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl Publisher for TracingPublisher {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        info!(
            topic = %message.topic,
            retain = message.retain,
            "[BUS] {}",
            message.payload
        );
        Ok(())
    }
}

/// Lowercase ASCII slug with dashes, as used in topic paths and unique ids
#[must_use]
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars().flat_map(char::to_lowercase) {
        let c = match c {
            'ä' | 'å' | 'á' | 'à' | 'â' => 'a',
            'ö' | 'ø' | 'ó' | 'ò' | 'ô' => 'o',
            'ü' | 'ú' | 'ù' | 'û' => 'u',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            other => other,
        };
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Topic layout below a configurable prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    /// Create the layout; `prefix` ends with a slash
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix of every topic
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Availability topic of the bridge itself
    #[must_use]
    pub fn bridge_available(&self) -> String {
        format!("{}available", self.prefix)
    }

    /// `<prefix><brand>-<type>/<id>/`
    #[must_use]
    pub fn device_base(&self, record: &DeviceRecord) -> String {
        format!(
            "{}{}-{}/{}/",
            self.prefix,
            slugify(&record.brand_name()),
            slugify(&record.type_name()),
            record.id
        )
    }

    /// Topic of one device field
    #[must_use]
    pub fn device(&self, record: &DeviceRecord, partial: &str) -> String {
        format!("{}{partial}", self.device_base(record))
    }

    /// Subscription filters of the command topics
    #[must_use]
    pub fn command_filters(&self) -> Vec<String> {
        ["mode/set", "target-temperature/set", "target-humidity/set", "error/ack", "light/set"]
            .iter()
            .map(|command| format!("{}+/+/{command}", self.prefix))
            .collect()
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

/// Publications for a device connectivity change
#[must_use]
pub fn connected(topics: &Topics, record: &DeviceRecord, connected: bool) -> BusMessage {
    BusMessage::new(topics.device(record, "connected"), connected.to_string())
}

/// Publications for a device availability change
#[must_use]
pub fn available(topics: &Topics, record: &DeviceRecord, available: bool) -> BusMessage {
    BusMessage::new(topics.device(record, "available"), available.to_string())
}

/// Retained bridge availability
#[must_use]
pub fn bridge_available(topics: &Topics, available: bool) -> BusMessage {
    BusMessage::retained(topics.bridge_available(), available.to_string())
}

/// Publications triggered by one state change
#[must_use]
pub fn publications_for(
    topics: &Topics,
    record: &DeviceRecord,
    event: &StateEvent,
) -> Vec<BusMessage> {
    let topic = |partial: &str| topics.device(record, partial);
    match event {
        StateEvent::DiscoveryRequested => Vec::new(),
        StateEvent::RunState { state, .. } => state
            .labels()
            .map(|(mode, preset)| {
                vec![
                    BusMessage::new(topic("mode"), mode),
                    BusMessage::new(topic("state"), preset),
                ]
            })
            .unwrap_or_default(),
        StateEvent::TargetTemperature(v) => {
            vec![BusMessage::new(topic("target-temperature"), v.to_string())]
        }
        StateEvent::TargetHumidity(v) => {
            vec![BusMessage::new(topic("target-humidity"), v.to_string())]
        }
        StateEvent::Temperature(v) => vec![BusMessage::new(topic("temperature"), v.to_string())],
        StateEvent::Humidity(v) => vec![BusMessage::new(topic("humidity"), v.to_string())],
        StateEvent::StandbyOffsetTemperature(v) => {
            vec![BusMessage::new(topic("standby-offset-temp"), v.to_string())]
        }
        StateEvent::TankWaterTemperature(v) => {
            vec![BusMessage::new(topic("tank-water-temp"), v.to_string())]
        }
        StateEvent::TankStandbyTemperature(v) => {
            vec![BusMessage::new(topic("tank-standby-temp"), v.to_string())]
        }
        StateEvent::BathTime(v) => vec![BusMessage::new(topic("bath-time"), v.to_string())],
        StateEvent::RunTimeLeft(v) => {
            vec![BusMessage::new(topic("run-time-left"), v.to_string())]
        }
        StateEvent::WaterLevel(code) => WaterLevel::from_code(*code)
            .map(|level| vec![BusMessage::new(topic("water-level"), level.to_string())])
            .unwrap_or_default(),
        StateEvent::Light(on) => vec![BusMessage::new(topic("light"), on_off(*on))],
        StateEvent::Door { open } => vec![BusMessage::new(topic("door"), on_off(*open))],
        StateEvent::ErrorRaised(message) => {
            let payload = json!({ "state": "ON", "message": message });
            let mut out = vec![BusMessage::new(topic("error"), payload.to_string())];
            if DOOR_MESSAGE_IDENTITIES.contains(&message.identity) {
                out.push(BusMessage::new(topic("door"), "ON"));
            }
            out
        }
        StateEvent::ErrorCleared => vec![
            BusMessage::new(topic("error"), json!({ "state": "OFF" }).to_string()),
            BusMessage::new(topic("door"), "OFF"),
        ],
    }
}

/// Home Assistant discovery configs
///
/// The climate entity is always included. Sensors, binary sensors, the
/// error acknowledge button and the light are only part of the initial
/// publish of a session.
#[must_use]
pub fn discovery_messages(
    topics: &Topics,
    record: &DeviceRecord,
    state: &DeviceState,
    initial: bool,
) -> Vec<BusMessage> {
    let bn = slugify(&record.brand_name());
    let tn = slugify(&record.type_name());
    let id = record.id;
    let base = topics.device_base(record);
    let unique = |suffix: &str| {
        if suffix.is_empty() {
            slugify(&format!("{bn}-{tn}-{id}"))
        } else {
            slugify(&format!("{bn}-{tn}-{id}-{suffix}"))
        }
    };

    let device = json!({
        "manufacturer": record.brand_name(),
        "model": record.type_name(),
        "identifiers": [bn, format!("{bn}-{tn}")],
        "name": format!("{} {}", record.brand_name(), record.type_name()),
        "sw_version": record.application_version,
    });
    let availability = json!([
        { "topic": topics.bridge_available(), "payload_available": "true", "payload_not_available": "false" },
        { "topic": format!("{base}available"), "payload_available": "true", "payload_not_available": "false" },
        { "topic": format!("{base}connected"), "payload_available": "true", "payload_not_available": "false" },
    ]);

    let fahrenheit = state.unit() == TemperatureUnit::Fahrenheit;
    let (unit, value_template, command_template, initial_temp) = if fahrenheit {
        (
            "F",
            "{{ value | float / 5 + 32 }}",
            "{{ (value | float - 32) * 5 | round(0) }}",
            194,
        )
    } else {
        ("C", "{{ value | float / 9 }}", "{{ value | float * 9 | round(0) }}", 90)
    };
    let to_display = |raw: i32| {
        if fahrenheit {
            f64::from(raw) / 5.0 + 32.0
        } else {
            f64::from(raw) / 9.0
        }
    };

    let climate_id = unique("");
    let climate = json!({
        "unique_id": climate_id,
        "name": record.name,
        "device": device,
        "icon": "mdi:radiator",
        "availability": availability,
        "availability_mode": "all",
        "modes": ["off", "heat", "auto"],
        "mode_state_topic": format!("{base}mode"),
        "mode_command_topic": format!("{base}mode/set"),
        "preset_modes": ["on", "standby", "dryup", "cleanup", "descaling"],
        "preset_mode_state_topic": format!("{base}state"),
        "preset_mode_command_topic": format!("{base}state/set"),
        "temperature_unit": unit,
        "current_temperature_topic": format!("{base}temperature"),
        "current_temperature_template": value_template,
        "temperature_state_topic": format!("{base}target-temperature"),
        "temperature_state_template": value_template,
        "temperature_command_topic": format!("{base}target-temperature/set"),
        "temperature_command_template": command_template,
        "current_humidity_topic": format!("{base}humidity"),
        "target_humidity_state_topic": format!("{base}target-humidity"),
        "target_humidity_command_topic": format!("{base}target-humidity/set"),
        "initial": initial_temp,
        "min_temp": to_display(state.lower_limit_temperature),
        "max_temp": to_display(state.upper_limit_temperature),
        "min_humidity": 0,
        "max_humidity": state.max_humidity_for_target(),
    });

    let config_topic =
        |component: &str, unique_id: &str| format!("{DISCOVERY_PREFIX}/{component}/{unique_id}/config");

    let mut out = vec![BusMessage::retained(
        config_topic("climate", &climate_id),
        climate.to_string(),
    )];
    if !initial {
        return out;
    }

    let entity = |suffix: &str, label: &str, extra: Value| {
        let mut config = json!({
            "unique_id": unique(suffix),
            "name": format!("{} {label}", record.name),
            "device": device,
            "availability": availability,
            "availability_mode": "all",
        });
        if let (Value::Object(target), Value::Object(extra)) = (&mut config, extra) {
            target.extend(extra);
        }
        config
    };

    let binary_sensors = [
        entity(
            "door",
            "Door",
            json!({ "device_class": "door", "state_topic": format!("{base}door") }),
        ),
        entity(
            "error",
            "Error",
            json!({
                "device_class": "problem",
                "state_topic": format!("{base}error"),
                "value_template": "{{ value_json.state }}",
                "json_attributes_topic": format!("{base}error"),
                "json_attributes_template": "{{ value_json.message | tojson }}",
            }),
        ),
    ];
    let button = entity(
        "error-ack",
        "Error Ack",
        json!({ "command_topic": format!("{base}error/ack") }),
    );
    let light = entity(
        "light",
        "Light",
        json!({
            "state_topic": format!("{base}light"),
            "command_topic": format!("{base}light/set"),
        }),
    );

    let temperature_sensor = |suffix: &str, label: &str, partial: &str| {
        entity(
            suffix,
            label,
            json!({
                "device_class": "temperature",
                "unit_of_measurement": "°C",
                "state_topic": format!("{base}{partial}"),
                "value_template": "{{ value | float / 9 }}",
            }),
        )
    };
    let sensors = [
        temperature_sensor("temperature", "Temperature", "temperature"),
        entity(
            "humidity",
            "Humidity",
            json!({
                "device_class": "humidity",
                "unit_of_measurement": "%",
                "state_topic": format!("{base}humidity"),
            }),
        ),
        temperature_sensor("standby-offset-temp", "Standby Offset Temp", "standby-offset-temp"),
        temperature_sensor("tank-water-temp", "Tank Water Temp", "tank-water-temp"),
        temperature_sensor("tank-standby-temp", "Tank Standby Temp", "tank-standby-temp"),
        entity(
            "water-level",
            "Water Level",
            json!({ "device_class": "enum", "state_topic": format!("{base}water-level") }),
        ),
        entity(
            "bath-time",
            "Bath Time",
            json!({ "state_topic": format!("{base}bath-time"), "unit_of_measurement": "min" }),
        ),
        entity(
            "run-time-left",
            "Run Time Left",
            json!({ "state_topic": format!("{base}run-time-left"), "unit_of_measurement": "min" }),
        ),
    ];

    let mut push = |component: &str, config: Value| {
        let unique_id = config["unique_id"].as_str().unwrap_or_default().to_string();
        out.push(BusMessage::retained(
            config_topic(component, &unique_id),
            config.to_string(),
        ));
    };
    for config in binary_sensors {
        push("binary_sensor", config);
    }
    push("button", button);
    push("light", light);
    for config in sensors {
        push("sensor", config);
    }
    out
}

/// Command received on a bus topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCommand {
    /// `mode/set`
    SetMode(RunMode),
    /// `target-temperature/set`
    SetTargetTemperature(i32),
    /// `target-humidity/set`
    SetTargetHumidity(i32),
    /// `light/set`
    SetLight(bool),
    /// `error/ack`
    AckError,
}

/// Command addressed to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundCommand {
    /// Device id taken from the topic path
    pub device_id: DeviceId,
    /// The command
    pub command: BusCommand,
}

impl InboundCommand {
    /// Parse `<prefix><brand>-<type>/<id>/<command>`
    ///
    /// Returns `None` and logs a warning for foreign topics, unknown
    /// commands and malformed payloads.
    #[must_use]
    pub fn parse(topics: &Topics, topic: &str, payload: &str) -> Option<Self> {
        let Some(rest) = topic.strip_prefix(topics.prefix()) else {
            warn!("Ignoring command on foreign topic [{}]", topic);
            return None;
        };
        let mut parts = rest.splitn(3, '/');
        let (Some(_device_slug), Some(id), Some(command)) = (parts.next(), parts.next(), parts.next())
        else {
            warn!("Device id not found in topic [{}] - ignoring", topic);
            return None;
        };
        let Ok(id) = id.parse::<u32>() else {
            warn!("Device id not found in topic [{}] - ignoring", topic);
            return None;
        };

        let payload = payload.trim();
        let command = match command {
            "mode/set" => BusCommand::SetMode(RunMode::parse(payload)?),
            "target-temperature/set" => BusCommand::SetTargetTemperature(parse_number(payload)?),
            "target-humidity/set" => BusCommand::SetTargetHumidity(parse_number(payload)?),
            "light/set" => BusCommand::SetLight(payload == "ON"),
            "error/ack" => BusCommand::AckError,
            other => {
                warn!("Unknown command [{}] for device {}", other, id);
                return None;
            }
        };
        Some(Self {
            device_id: DeviceId(id),
            command,
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn parse_number(payload: &str) -> Option<i32> {
    payload.parse::<i32>().ok().or_else(|| {
        let value = payload.parse::<f64>().ok()?;
        if value.is_finite() && value.abs() < f64::from(i32::MAX) {
            Some(value.round() as i32)
        } else {
            warn!("Invalid numeric payload {:?}", payload);
            None
        }
    })
}
