use crate::error::{GatewayError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Serialize;

/// Connect reply status meaning the session was accepted
pub const CONNECT_STATUS_SUCCESS: u8 = 10;

/// Connection profile of a home automation system
pub const PROFILE_HOME_AUTOMATION: u8 = 12;

/// Calendar favorite reference meaning "no favorite"
pub const FAVORITE_NONE: u8 = 100;

/// Application identity sent in the connect request
pub const APPLICATION_DESCRIPTION: &str = "TylöHelo MQTT-HA bridge";

/// Feature flag: the device may reject the connection while the door switch is open
pub const FEATURE_REJECT_DOOR_SWITCH: u8 = 0x01;

/// Start mode "ready at": the cabin is heated up when the program starts
pub const START_MODE_READY_AT: u8 = 2;

/// User message type that clears the active message
pub const MESSAGE_TYPE_NONE: u8 = 10;
/// User message type asking for an OK
pub const MESSAGE_TYPE_OK: u8 = 11;
/// User message type reporting an error
pub const MESSAGE_TYPE_ERROR: u8 = 13;
/// Answer code of an unanswered message
pub const ANSWER_PENDING: u8 = 20;
/// Answer code acknowledging a message
pub const ANSWER_OK: u8 = 21;

/// Device clock epoch, 2000-01-01T00:00:00Z
#[must_use]
pub fn device_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert a millisecond offset from the device epoch into an instant
///
/// Returns `None` when the offset lies outside the representable range.
#[must_use]
pub fn from_device_millis(millis: i64) -> Option<DateTime<Utc>> {
    device_epoch().checked_add_signed(ChronoDuration::try_milliseconds(millis)?)
}

/// Distance a device time must keep from the representable limits, so that
/// bath times and the scheduling window can be added to it
fn device_time_margin() -> ChronoDuration {
    ChronoDuration::minutes(i64::from(u16::MAX)) + ChronoDuration::days(1)
}

/// Check that a device time converts to an instant with room for a bath
fn checked_device_time(millis: i64) -> Result<i64> {
    let margin = device_time_margin();
    from_device_millis(millis)
        .and_then(|instant| instant.checked_add_signed(margin))
        .and_then(|instant| instant.checked_sub_signed(margin + margin))
        .map(|_| millis)
        .ok_or_else(|| GatewayError::Decode(format!("Device time out of range: {millis}")))
}

/// Convert an instant into a millisecond offset from the device epoch
#[must_use]
pub fn to_device_millis(instant: DateTime<Utc>) -> i64 {
    (instant - device_epoch()).num_milliseconds()
}

/// Frame kinds, the first byte of every datagram
///
/// Outbound kinds have the high bit clear, inbound kinds have it set and the
/// broadcast announcement lives in its own range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a session
    ConnectRequest = 0x01,
    /// Close a session
    DisconnectRequest = 0x02,
    /// Liveness check
    KeepAlive = 0x03,
    /// Ask devices to announce themselves
    AnnouncementRequest = 0x04,
    /// Integer value change requests
    IntegerValues = 0x05,
    /// Boolean value change requests
    BooleanValues = 0x06,
    /// Run state change request
    RunStateChange = 0x07,
    /// Favorite programs
    Favorites = 0x08,
    /// Auxiliary relays
    AuxRelays = 0x09,
    /// Calendar programs
    CalendarPosts = 0x0A,
    /// User message answer
    UserMessage = 0x0B,
    /// General commands
    GeneralCommands = 0x0C,
    /// Reply to a connect request
    ConnectReply = 0x81,
    /// Device does not know this session
    NoConnection = 0x82,
    /// Keepalive acknowledgment
    KeepAliveAck = 0x83,
    /// Composite state update
    StateUpdate = 0x84,
    /// Broadcast device announcement
    Announcement = 0xA0,
}

impl FrameKind {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ConnectRequest),
            0x02 => Some(Self::DisconnectRequest),
            0x03 => Some(Self::KeepAlive),
            0x04 => Some(Self::AnnouncementRequest),
            0x05 => Some(Self::IntegerValues),
            0x06 => Some(Self::BooleanValues),
            0x07 => Some(Self::RunStateChange),
            0x08 => Some(Self::Favorites),
            0x09 => Some(Self::AuxRelays),
            0x0A => Some(Self::CalendarPosts),
            0x0B => Some(Self::UserMessage),
            0x0C => Some(Self::GeneralCommands),
            0x81 => Some(Self::ConnectReply),
            0x82 => Some(Self::NoConnection),
            0x83 => Some(Self::KeepAliveAck),
            0x84 => Some(Self::StateUpdate),
            0xA0 => Some(Self::Announcement),
            _ => None,
        }
    }
}

/// Integer value types shared by state reports and change requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IntegerValueType {
    /// Target cabin temperature
    TargetTemperature = 10,
    /// Standby offset below the target temperature
    StandbyOffsetTemperature = 11,
    /// Cabin temperature from the external sensor
    ExternalTemperature = 12,
    /// Lowest selectable temperature
    LowerLimitTemperature = 13,
    /// Highest selectable temperature
    UpperLimitTemperature = 14,
    /// System lower temperature limit
    SystemLowerLimitTemperature = 15,
    /// System upper temperature limit
    SystemUpperLimitTemperature = 16,
    /// Bath time in minutes
    BathTime = 17,
    /// Maximum bath time in minutes
    MaxBathTime = 18,
    /// Cabin humidity from the external sensor
    ExternalHumidity = 19,
    /// Target humidity
    TargetHumidity = 20,
    /// Steam tank water temperature
    TankWaterTemperature = 21,
    /// Minutes left of the running bath
    RunTimeLeft = 22,
    /// Minutes until a start is allowed
    TimeToAllowedStart = 23,
    /// Steam tank standby temperature
    TankStandbyTemperature = 24,
    /// Start the favorite with the given index
    StartFavorite = 25,
}

impl IntegerValueType {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            10 => Some(Self::TargetTemperature),
            11 => Some(Self::StandbyOffsetTemperature),
            12 => Some(Self::ExternalTemperature),
            13 => Some(Self::LowerLimitTemperature),
            14 => Some(Self::UpperLimitTemperature),
            15 => Some(Self::SystemLowerLimitTemperature),
            16 => Some(Self::SystemUpperLimitTemperature),
            17 => Some(Self::BathTime),
            18 => Some(Self::MaxBathTime),
            19 => Some(Self::ExternalHumidity),
            20 => Some(Self::TargetHumidity),
            21 => Some(Self::TankWaterTemperature),
            22 => Some(Self::RunTimeLeft),
            23 => Some(Self::TimeToAllowedStart),
            24 => Some(Self::TankStandbyTemperature),
            25 => Some(Self::StartFavorite),
            _ => None,
        }
    }
}

/// Boolean value types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BooleanValueType {
    /// Cabin lighting
    Lighting = 10,
    /// Standby enabled
    StandbyEnable = 11,
    /// Humidity sensor present
    HumiditySensorAvailable = 12,
    /// Delayed start enabled
    DelayedStartEnable = 13,
    /// Delayed start is counting down
    DelayedStartRunning = 14,
    /// Door magnetic sensor closed
    MagneticSensorConnected = 15,
    /// Weekday calendar programs disabled
    CalendarWeekdayProgramDisable = 16,
    /// Infrared elements enabled
    IrEnabled = 23,
}

impl BooleanValueType {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            10 => Some(Self::Lighting),
            11 => Some(Self::StandbyEnable),
            12 => Some(Self::HumiditySensorAvailable),
            13 => Some(Self::DelayedStartEnable),
            14 => Some(Self::DelayedStartRunning),
            15 => Some(Self::MagneticSensorConnected),
            16 => Some(Self::CalendarWeekdayProgramDisable),
            23 => Some(Self::IrEnabled),
            _ => None,
        }
    }
}

/// General commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneralCommand {
    /// Request the supported character table
    SendCharacterTable = 10,
    /// Request the max humidity per temperature table
    SendMaxHumidityTable = 11,
    /// Request the max temperature table
    SendMaxTemperatureTable = 12,
}

impl GeneralCommand {
    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            10 => Some(Self::SendCharacterTable),
            11 => Some(Self::SendMaxHumidityTable),
            12 => Some(Self::SendMaxTemperatureTable),
            _ => None,
        }
    }
}

/// Tagged integer value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerValue {
    /// Raw [`IntegerValueType`] code
    pub value_type: u8,
    /// Value
    pub value: i32,
}

impl IntegerValue {
    /// Create an integer value for a known type
    #[must_use]
    pub const fn new(value_type: IntegerValueType, value: i32) -> Self {
        Self {
            value_type: value_type as u8,
            value,
        }
    }
}

/// Tagged boolean value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BooleanValue {
    /// Raw [`BooleanValueType`] code
    pub value_type: u8,
    /// Value
    pub value: bool,
}

/// Enumerated settings reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumValue {
    /// Water level code
    WaterLevel(u8),
    /// Region code
    Region(u8),
    /// Facility type code
    FacilityType(u8),
}

/// Panel and presentation settings; absent fields were not part of the update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserSettings {
    /// Temperature unit code
    pub temperature_unit: Option<u8>,
    /// Authoritative temperature source code
    pub temperature_presentation: Option<u8>,
    /// Authoritative humidity source code
    pub humidity_presentation: Option<u8>,
    /// Date format code
    pub date_format: Option<u8>,
    /// Time format code
    pub time_format: Option<u8>,
    /// First day of week code
    pub weekstart: Option<u8>,
    /// Language code
    pub language: Option<u16>,
}

/// Named preset bath program
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Favorite {
    /// Position in the favorite list
    pub index: u8,
    /// Display name
    pub name: String,
    /// Bath time in minutes
    pub bath_time: u16,
    /// Target temperature
    pub temperature_set_point: i32,
    /// Target humidity
    pub humidity_set_point: i32,
}

/// Auxiliary relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuxRelay {
    /// Relay index
    pub index: u8,
    /// Display name
    pub name: String,
    /// Relay enabled
    pub enabled: bool,
}

/// Run state and device clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStateReport {
    /// State code, see [`crate::types::RunState`]
    pub state: Option<u8>,
    /// Device wall clock as milliseconds since the device epoch
    pub device_time: Option<i64>,
}

/// Message shown on the control panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    /// Message type, [`MESSAGE_TYPE_NONE`] clears the panel
    pub message_type: u8,
    /// Message identity (19 and 20 are door messages)
    pub identity: u8,
    /// Answer code
    pub answer: u8,
    /// Formatted panel text, carried as UTF-16 code units on the wire
    pub text: String,
}

/// Descaling configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descaling {
    /// Descaling via auxiliary relay enabled
    pub enabled: bool,
    /// Relay used for descaling
    pub aux_index: u8,
}

/// Calendar program as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarProgram {
    /// Slot index, 1..=21 for date programs
    pub index: u8,
    /// Slot holds a program
    pub valid: bool,
    /// Activation as milliseconds since the device epoch
    pub activation_time: Option<i64>,
    /// Bath time in minutes
    pub bath_time: u16,
    /// Target temperature
    pub temperature_set_point: i32,
    /// Target humidity
    pub humidity_set_point: i32,
    /// Weekday program instead of a date program
    pub weekday: bool,
    /// Start mode code
    pub start_mode: u8,
    /// Start in standby
    pub standby: bool,
    /// Favorite index or [`FAVORITE_NONE`]
    pub favorite: u8,
}

/// Values as presented on the panel; zero means not reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresentedValue {
    /// Presented temperature
    pub temperature: Option<i32>,
    /// Presented humidity
    pub humidity: Option<i32>,
}

/// Control board capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlBoardSupport {
    /// Board is the lite variant
    pub is_lite_variant: bool,
}

/// One-time capability tables
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionSupport {
    /// Characters the panel can display, as UTF-16 code units
    pub supported_characters: Vec<u16>,
    /// Max humidity per temperature step
    pub max_humidity: Vec<i32>,
    /// Max temperature table
    pub max_temperature: Vec<i32>,
}

/// Composite state update; every category is optional
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateUpdate {
    /// Integer values
    pub integer_values: Vec<IntegerValue>,
    /// Enum values
    pub enum_values: Vec<EnumValue>,
    /// Boolean values
    pub boolean_values: Vec<BooleanValue>,
    /// User settings
    pub user_settings: Option<UserSettings>,
    /// Favorites
    pub favorites: Vec<Favorite>,
    /// Run state and device clock
    pub run_state: Option<RunStateReport>,
    /// Panel message
    pub user_message: Option<UserMessage>,
    /// Auxiliary relays
    pub aux_relays: Vec<AuxRelay>,
    /// Descaling configuration
    pub descaling: Option<Descaling>,
    /// Calendar programs
    pub calendar_programs: Vec<CalendarProgram>,
    /// Presented values
    pub presented_value: Option<PresentedValue>,
    /// Control board capabilities
    pub control_board: Option<ControlBoardSupport>,
    /// Capability tables
    pub function_support: Option<FunctionSupport>,
}

/// Reply to a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    /// Status, [`CONNECT_STATUS_SUCCESS`] on success
    pub status: u8,
    /// System id of the replying device
    pub system_id: u32,
    /// Communication timeout in seconds
    pub keepalive_interval: u16,
    /// Lost connection timeout in seconds
    pub lost_connection_timeout: u16,
    /// System type code
    pub system_type: u8,
    /// Firmware application description
    pub application_description: String,
    /// Firmware application version
    pub application_version: String,
}

/// Broadcast announcement of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// System id
    pub system_id: u32,
    /// Session port of the device, required
    pub port: Option<u16>,
    /// Brand code
    pub brand: u8,
    /// Control board product code
    pub board: u8,
    /// System type code, absent on older firmware
    pub system_type: Option<u8>,
    /// Display name
    pub name: String,
}

/// Messages sent from the bridge to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Open a session
    ConnectRequest {
        /// Connection profile
        profile: u8,
        /// Device PIN
        pin: String,
        /// Application identity
        application: String,
        /// Feature flags
        features: u8,
    },
    /// Close the session
    DisconnectRequest,
    /// Liveness check
    KeepAlive {
        /// Sequence number
        sequence: u32,
    },
    /// Broadcast request for announcements
    AnnouncementRequest {
        /// Connection profile
        profile: u8,
    },
    /// Integer value change requests
    IntegerValues(Vec<IntegerValue>),
    /// Boolean value change requests
    BooleanValues(Vec<BooleanValue>),
    /// Run state change request
    RunStateChange(u8),
    /// Favorite list
    Favorites(Vec<Favorite>),
    /// Auxiliary relay list
    AuxRelays(Vec<AuxRelay>),
    /// Calendar posts
    CalendarPosts(Vec<CalendarProgram>),
    /// User message answer
    UserMessage(UserMessage),
    /// General commands
    GeneralCommands(Vec<GeneralCommand>),
}

/// Messages received from a device on the session port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Connect reply
    ConnectReply(ConnectReply),
    /// The device has no session for us
    NoConnection,
    /// Keepalive acknowledgment
    KeepAliveAck {
        /// Echoed sequence number
        sequence: u32,
    },
    /// State update
    StateUpdate(Box<StateUpdate>),
}

impl Inbound {
    /// Short name used in frame logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectReply(_) => "connectReply",
            Self::NoConnection => "noConnection",
            Self::KeepAliveAck { .. } => "keepAlive",
            Self::StateUpdate(_) => "stateUpdate",
        }
    }
}

impl Outbound {
    /// Connect request for the home automation profile
    #[must_use]
    pub fn connect_request(pin: &str, application: &str) -> Self {
        Self::ConnectRequest {
            profile: PROFILE_HOME_AUTOMATION,
            pin: pin.to_string(),
            application: application.to_string(),
            features: FEATURE_REJECT_DOOR_SWITCH,
        }
    }

    /// Single integer change request
    #[must_use]
    pub fn integer(value_type: IntegerValueType, value: i32) -> Self {
        Self::IntegerValues(vec![IntegerValue::new(value_type, value)])
    }

    /// Lighting on/off request
    #[must_use]
    pub fn lighting(on: bool) -> Self {
        Self::BooleanValues(vec![BooleanValue {
            value_type: BooleanValueType::Lighting as u8,
            value: on,
        }])
    }

    /// Short name used in frame logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectRequest { .. } => "connectRequest",
            Self::DisconnectRequest => "disconnectRequest",
            Self::KeepAlive { .. } => "keepAlive",
            Self::AnnouncementRequest { .. } => "announcementRequest",
            Self::IntegerValues(_) => "integerValue",
            Self::BooleanValues(_) => "booleanValue",
            Self::RunStateChange(_) => "saunaState",
            Self::Favorites(_) => "favorite",
            Self::AuxRelays(_) => "aux",
            Self::CalendarPosts(_) => "calendar",
            Self::UserMessage(_) => "userMessage",
            Self::GeneralCommands(_) => "generalCommand",
        }
    }

    /// Serialize message to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::ConnectRequest {
                profile,
                pin,
                application,
                features,
            } => {
                buf.put_u8(FrameKind::ConnectRequest as u8);
                buf.put_u8(*profile);
                put_str(&mut buf, pin);
                put_str(&mut buf, application);
                buf.put_u8(*features);
            }
            Self::DisconnectRequest => buf.put_u8(FrameKind::DisconnectRequest as u8),
            Self::KeepAlive { sequence } => {
                buf.put_u8(FrameKind::KeepAlive as u8);
                buf.put_u32(*sequence);
            }
            Self::AnnouncementRequest { profile } => {
                buf.put_u8(FrameKind::AnnouncementRequest as u8);
                buf.put_u8(*profile);
            }
            Self::IntegerValues(values) => {
                buf.put_u8(FrameKind::IntegerValues as u8);
                put_list(&mut buf, values);
            }
            Self::BooleanValues(values) => {
                buf.put_u8(FrameKind::BooleanValues as u8);
                put_list(&mut buf, values);
            }
            Self::RunStateChange(state) => {
                buf.put_u8(FrameKind::RunStateChange as u8);
                buf.put_u8(*state);
            }
            Self::Favorites(values) => {
                buf.put_u8(FrameKind::Favorites as u8);
                put_list(&mut buf, values);
            }
            Self::AuxRelays(values) => {
                buf.put_u8(FrameKind::AuxRelays as u8);
                put_list(&mut buf, values);
            }
            Self::CalendarPosts(values) => {
                buf.put_u8(FrameKind::CalendarPosts as u8);
                put_list(&mut buf, values);
            }
            Self::UserMessage(message) => {
                buf.put_u8(FrameKind::UserMessage as u8);
                message.put(&mut buf);
            }
            Self::GeneralCommands(commands) => {
                buf.put_u8(FrameKind::GeneralCommands as u8);
                put_len(&mut buf, commands.len());
                for command in commands {
                    buf.put_u8(*command as u8);
                }
            }
        }
        buf.freeze()
    }

    /// Parse message from bytes
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Decode`] for truncated datagrams or unknown kinds.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let kind = frame_kind(&mut buf)?;
        let message = match kind {
            FrameKind::ConnectRequest => Self::ConnectRequest {
                profile: buf.take_u8()?,
                pin: get_str(&mut buf)?,
                application: get_str(&mut buf)?,
                features: buf.take_u8()?,
            },
            FrameKind::DisconnectRequest => Self::DisconnectRequest,
            FrameKind::KeepAlive => Self::KeepAlive {
                sequence: buf.take_u32()?,
            },
            FrameKind::AnnouncementRequest => Self::AnnouncementRequest {
                profile: buf.take_u8()?,
            },
            FrameKind::IntegerValues => Self::IntegerValues(get_list(&mut buf)?),
            FrameKind::BooleanValues => Self::BooleanValues(get_list(&mut buf)?),
            FrameKind::RunStateChange => Self::RunStateChange(buf.take_u8()?),
            FrameKind::Favorites => Self::Favorites(get_list(&mut buf)?),
            FrameKind::AuxRelays => Self::AuxRelays(get_list(&mut buf)?),
            FrameKind::CalendarPosts => Self::CalendarPosts(get_list(&mut buf)?),
            FrameKind::UserMessage => Self::UserMessage(UserMessage::get(&mut buf)?),
            FrameKind::GeneralCommands => {
                let count = buf.take_u8()?;
                let mut commands = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let code = buf.take_u8()?;
                    commands.push(GeneralCommand::from_u8(code).ok_or_else(|| {
                        GatewayError::Decode(format!("Unknown general command: {code}"))
                    })?);
                }
                Self::GeneralCommands(commands)
            }
            other => {
                return Err(GatewayError::Decode(format!(
                    "Frame kind {other:?} is not an outbound message"
                )))
            }
        };
        Ok(message)
    }
}

/// State update section tags, in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Section {
    IntegerValues = 1,
    EnumValues = 2,
    BooleanValues = 3,
    UserSettings = 4,
    Favorites = 5,
    RunState = 6,
    UserMessage = 7,
    AuxRelays = 8,
    Descaling = 9,
    CalendarPrograms = 10,
    PresentedValue = 11,
    ControlBoard = 12,
    FunctionSupport = 13,
}

impl Inbound {
    /// Serialize message to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::ConnectReply(reply) => {
                buf.put_u8(FrameKind::ConnectReply as u8);
                buf.put_u8(reply.status);
                buf.put_u32(reply.system_id);
                buf.put_u16(reply.keepalive_interval);
                buf.put_u16(reply.lost_connection_timeout);
                buf.put_u8(reply.system_type);
                put_str(&mut buf, &reply.application_description);
                put_str(&mut buf, &reply.application_version);
            }
            Self::NoConnection => buf.put_u8(FrameKind::NoConnection as u8),
            Self::KeepAliveAck { sequence } => {
                buf.put_u8(FrameKind::KeepAliveAck as u8);
                buf.put_u32(*sequence);
            }
            Self::StateUpdate(update) => {
                buf.put_u8(FrameKind::StateUpdate as u8);
                put_state_update(&mut buf, update);
            }
        }
        buf.freeze()
    }

    /// Parse message from bytes
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Decode`] for truncated datagrams or unknown kinds.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let kind = frame_kind(&mut buf)?;
        match kind {
            FrameKind::ConnectReply => Ok(Self::ConnectReply(ConnectReply {
                status: buf.take_u8()?,
                system_id: buf.take_u32()?,
                keepalive_interval: buf.take_u16()?,
                lost_connection_timeout: buf.take_u16()?,
                system_type: buf.take_u8()?,
                application_description: get_str(&mut buf)?,
                application_version: get_str(&mut buf)?,
            })),
            FrameKind::NoConnection => Ok(Self::NoConnection),
            FrameKind::KeepAliveAck => Ok(Self::KeepAliveAck {
                sequence: buf.take_u32()?,
            }),
            FrameKind::StateUpdate => Ok(Self::StateUpdate(Box::new(get_state_update(&mut buf)?))),
            other => Err(GatewayError::Decode(format!(
                "Frame kind {other:?} is not a session message"
            ))),
        }
    }
}

impl Announcement {
    /// Serialize message to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(FrameKind::Announcement as u8);
        buf.put_u32(self.system_id);
        buf.put_u16(self.port.unwrap_or(0));
        buf.put_u8(self.brand);
        buf.put_u8(self.board);
        buf.put_u8(self.system_type.unwrap_or(0));
        put_str(&mut buf, &self.name);
        buf.freeze()
    }

    /// Parse a broadcast announcement
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Decode`] if the datagram is not an announcement.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let kind = frame_kind(&mut buf)?;
        if kind != FrameKind::Announcement {
            return Err(GatewayError::Decode(format!(
                "Expected announcement, got {kind:?}"
            )));
        }
        Ok(Self {
            system_id: buf.take_u32()?,
            port: non_zero_u16(buf.take_u16()?),
            brand: buf.take_u8()?,
            board: buf.take_u8()?,
            system_type: non_zero_u8(buf.take_u8()?),
            name: get_str(&mut buf)?,
        })
    }
}

fn put_state_update(buf: &mut BytesMut, update: &StateUpdate) {
    if !update.integer_values.is_empty() {
        put_section(buf, Section::IntegerValues, |b| put_list(b, &update.integer_values));
    }
    if !update.enum_values.is_empty() {
        put_section(buf, Section::EnumValues, |b| put_list(b, &update.enum_values));
    }
    if !update.boolean_values.is_empty() {
        put_section(buf, Section::BooleanValues, |b| put_list(b, &update.boolean_values));
    }
    if let Some(settings) = &update.user_settings {
        put_section(buf, Section::UserSettings, |b| settings.put(b));
    }
    if !update.favorites.is_empty() {
        put_section(buf, Section::Favorites, |b| put_list(b, &update.favorites));
    }
    if let Some(run_state) = &update.run_state {
        put_section(buf, Section::RunState, |b| run_state.put(b));
    }
    if let Some(message) = &update.user_message {
        put_section(buf, Section::UserMessage, |b| message.put(b));
    }
    if !update.aux_relays.is_empty() {
        put_section(buf, Section::AuxRelays, |b| put_list(b, &update.aux_relays));
    }
    if let Some(descaling) = &update.descaling {
        put_section(buf, Section::Descaling, |b| descaling.put(b));
    }
    if !update.calendar_programs.is_empty() {
        put_section(buf, Section::CalendarPrograms, |b| {
            put_list(b, &update.calendar_programs);
        });
    }
    if let Some(presented) = &update.presented_value {
        put_section(buf, Section::PresentedValue, |b| presented.put(b));
    }
    if let Some(board) = &update.control_board {
        put_section(buf, Section::ControlBoard, |b| board.put(b));
    }
    if let Some(support) = &update.function_support {
        put_section(buf, Section::FunctionSupport, |b| support.put(b));
    }
}

fn put_section(buf: &mut BytesMut, section: Section, body: impl FnOnce(&mut BytesMut)) {
    let mut payload = BytesMut::new();
    body(&mut payload);
    buf.put_u8(section as u8);
    buf.put_u16(u16::try_from(payload.len()).unwrap_or(u16::MAX));
    buf.extend_from_slice(&payload);
}

fn get_state_update(buf: &mut &[u8]) -> Result<StateUpdate> {
    let mut update = StateUpdate::default();
    while buf.has_remaining() {
        let tag = buf.take_u8()?;
        let len = usize::from(buf.take_u16()?);
        buf.need(len)?;
        let mut section = &buf[..len];
        buf.advance(len);

        match tag {
            t if t == Section::IntegerValues as u8 => {
                update.integer_values = get_list(&mut section)?;
            }
            t if t == Section::EnumValues as u8 => update.enum_values = get_list(&mut section)?,
            t if t == Section::BooleanValues as u8 => {
                update.boolean_values = get_list(&mut section)?;
            }
            t if t == Section::UserSettings as u8 => {
                update.user_settings = Some(UserSettings::get(&mut section)?);
            }
            t if t == Section::Favorites as u8 => update.favorites = get_list(&mut section)?,
            t if t == Section::RunState as u8 => {
                update.run_state = Some(RunStateReport::get(&mut section)?);
            }
            t if t == Section::UserMessage as u8 => {
                update.user_message = Some(UserMessage::get(&mut section)?);
            }
            t if t == Section::AuxRelays as u8 => update.aux_relays = get_list(&mut section)?,
            t if t == Section::Descaling as u8 => {
                update.descaling = Some(Descaling::get(&mut section)?);
            }
            t if t == Section::CalendarPrograms as u8 => {
                update.calendar_programs = get_list(&mut section)?;
            }
            t if t == Section::PresentedValue as u8 => {
                update.presented_value = Some(PresentedValue::get(&mut section)?);
            }
            t if t == Section::ControlBoard as u8 => {
                update.control_board = Some(ControlBoardSupport::get(&mut section)?);
            }
            t if t == Section::FunctionSupport as u8 => {
                update.function_support = Some(FunctionSupport::get(&mut section)?);
            }
            _ => {}
        }
    }
    Ok(update)
}

/// Field level encoding shared by both directions
trait Wire: Sized {
    fn put(&self, buf: &mut BytesMut);
    fn get(buf: &mut &[u8]) -> Result<Self>;
}

impl Wire for IntegerValue {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.value_type);
        buf.put_i32(self.value);
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            value_type: buf.take_u8()?,
            value: buf.take_i32()?,
        })
    }
}

impl Wire for BooleanValue {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.value_type);
        buf.put_u8(u8::from(self.value));
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            value_type: buf.take_u8()?,
            value: buf.take_bool()?,
        })
    }
}

impl Wire for EnumValue {
    fn put(&self, buf: &mut BytesMut) {
        let (tag, value) = match self {
            Self::WaterLevel(v) => (1, *v),
            Self::Region(v) => (2, *v),
            Self::FacilityType(v) => (3, *v),
        };
        buf.put_u8(tag);
        buf.put_u8(value);
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let tag = buf.take_u8()?;
        let value = buf.take_u8()?;
        match tag {
            1 => Ok(Self::WaterLevel(value)),
            2 => Ok(Self::Region(value)),
            3 => Ok(Self::FacilityType(value)),
            other => Err(GatewayError::Decode(format!("Unknown enum value tag: {other}"))),
        }
    }
}

impl Wire for UserSettings {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.temperature_unit.unwrap_or(0));
        buf.put_u8(self.temperature_presentation.unwrap_or(0));
        buf.put_u8(self.humidity_presentation.unwrap_or(0));
        buf.put_u8(self.date_format.unwrap_or(0));
        buf.put_u8(self.time_format.unwrap_or(0));
        buf.put_u8(self.weekstart.unwrap_or(0));
        buf.put_u16(self.language.unwrap_or(0));
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            temperature_unit: non_zero_u8(buf.take_u8()?),
            temperature_presentation: non_zero_u8(buf.take_u8()?),
            humidity_presentation: non_zero_u8(buf.take_u8()?),
            date_format: non_zero_u8(buf.take_u8()?),
            time_format: non_zero_u8(buf.take_u8()?),
            weekstart: non_zero_u8(buf.take_u8()?),
            language: non_zero_u16(buf.take_u16()?),
        })
    }
}

impl Wire for Favorite {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.index);
        put_str(buf, &self.name);
        buf.put_u16(self.bath_time);
        buf.put_i32(self.temperature_set_point);
        buf.put_i32(self.humidity_set_point);
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            index: buf.take_u8()?,
            name: get_str(buf)?,
            bath_time: buf.take_u16()?,
            temperature_set_point: buf.take_i32()?,
            humidity_set_point: buf.take_i32()?,
        })
    }
}

impl Wire for AuxRelay {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.index);
        put_str(buf, &self.name);
        buf.put_u8(u8::from(self.enabled));
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            index: buf.take_u8()?,
            name: get_str(buf)?,
            enabled: buf.take_bool()?,
        })
    }
}

impl Wire for RunStateReport {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.state.unwrap_or(0));
        match self.device_time {
            Some(time) => {
                buf.put_u8(1);
                buf.put_i64(time);
            }
            None => buf.put_u8(0),
        }
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let state = non_zero_u8(buf.take_u8()?);
        let device_time = get_device_time(buf)?;
        Ok(Self { state, device_time })
    }
}

impl Wire for UserMessage {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type);
        buf.put_u8(self.identity);
        buf.put_u8(self.answer);
        let units: Vec<u16> = self.text.encode_utf16().collect();
        put_len(buf, units.len());
        for unit in units.iter().take(usize::from(u8::MAX)) {
            buf.put_u16(*unit);
        }
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let message_type = buf.take_u8()?;
        let identity = buf.take_u8()?;
        let answer = buf.take_u8()?;
        let count = buf.take_u8()?;
        let mut units = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            units.push(buf.take_u16()?);
        }
        Ok(Self {
            message_type,
            identity,
            answer,
            text: String::from_utf16_lossy(&units),
        })
    }
}

impl Wire for Descaling {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.enabled));
        buf.put_u8(self.aux_index);
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            enabled: buf.take_bool()?,
            aux_index: buf.take_u8()?,
        })
    }
}

impl Wire for CalendarProgram {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.index);
        buf.put_u8(u8::from(self.valid));
        match self.activation_time {
            Some(time) => {
                buf.put_u8(1);
                buf.put_i64(time);
            }
            None => buf.put_u8(0),
        }
        buf.put_u16(self.bath_time);
        buf.put_i32(self.temperature_set_point);
        buf.put_i32(self.humidity_set_point);
        buf.put_u8(u8::from(self.weekday));
        buf.put_u8(self.start_mode);
        buf.put_u8(u8::from(self.standby));
        buf.put_u8(self.favorite);
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let index = buf.take_u8()?;
        let valid = buf.take_bool()?;
        let activation_time = get_device_time(buf)?;
        Ok(Self {
            index,
            valid,
            activation_time,
            bath_time: buf.take_u16()?,
            temperature_set_point: buf.take_i32()?,
            humidity_set_point: buf.take_i32()?,
            weekday: buf.take_bool()?,
            start_mode: buf.take_u8()?,
            standby: buf.take_bool()?,
            favorite: buf.take_u8()?,
        })
    }
}

impl Wire for PresentedValue {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_i32(self.temperature.unwrap_or(0));
        buf.put_i32(self.humidity.unwrap_or(0));
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let temperature = buf.take_i32()?;
        let humidity = buf.take_i32()?;
        Ok(Self {
            temperature: (temperature != 0).then_some(temperature),
            humidity: (humidity != 0).then_some(humidity),
        })
    }
}

impl Wire for ControlBoardSupport {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.is_lite_variant));
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            is_lite_variant: buf.take_bool()?,
        })
    }
}

impl Wire for FunctionSupport {
    fn put(&self, buf: &mut BytesMut) {
        put_len(buf, self.supported_characters.len());
        for unit in &self.supported_characters {
            buf.put_u16(*unit);
        }
        put_len(buf, self.max_humidity.len());
        for value in &self.max_humidity {
            buf.put_i32(*value);
        }
        put_len(buf, self.max_temperature.len());
        for value in &self.max_temperature {
            buf.put_i32(*value);
        }
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let mut support = Self::default();
        for _ in 0..buf.take_u8()? {
            support.supported_characters.push(buf.take_u16()?);
        }
        for _ in 0..buf.take_u8()? {
            support.max_humidity.push(buf.take_i32()?);
        }
        for _ in 0..buf.take_u8()? {
            support.max_temperature.push(buf.take_i32()?);
        }
        Ok(support)
    }
}

/// Bounds checked reads; `bytes::Buf` panics on underflow
trait CheckedBuf {
    fn need(&self, len: usize) -> Result<()>;
    fn take_u8(&mut self) -> Result<u8>;
    fn take_u16(&mut self) -> Result<u16>;
    fn take_u32(&mut self) -> Result<u32>;
    fn take_i32(&mut self) -> Result<i32>;
    fn take_i64(&mut self) -> Result<i64>;
    fn take_bool(&mut self) -> Result<bool>;
}

impl CheckedBuf for &[u8] {
    fn need(&self, len: usize) -> Result<()> {
        if self.remaining() < len {
            return Err(GatewayError::Decode(format!(
                "Message too short: {} bytes left, expected {}",
                self.remaining(),
                len
            )));
        }
        Ok(())
    }

    fn take_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.get_u8())
    }

    fn take_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.get_u16())
    }

    fn take_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.get_u32())
    }

    fn take_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.get_i32())
    }

    fn take_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.get_i64())
    }

    fn take_bool(&mut self) -> Result<bool> {
        Ok(self.take_u8()? != 0)
    }
}

fn frame_kind(buf: &mut &[u8]) -> Result<FrameKind> {
    let kind = buf.take_u8()?;
    FrameKind::from_u8(kind)
        .ok_or_else(|| GatewayError::Decode(format!("Unknown frame kind: {kind:02X}")))
}

fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u8(u8::try_from(len).unwrap_or(u8::MAX));
}

fn put_str(buf: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(usize::from(u8::MAX));
    put_len(buf, len);
    buf.extend_from_slice(&bytes[..len]);
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    let len = usize::from(buf.take_u8()?);
    buf.need(len)?;
    let value = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(value)
}

fn get_device_time(buf: &mut &[u8]) -> Result<Option<i64>> {
    if buf.take_bool()? {
        Ok(Some(checked_device_time(buf.take_i64()?)?))
    } else {
        Ok(None)
    }
}

fn put_list<T: Wire>(buf: &mut BytesMut, items: &[T]) {
    put_len(buf, items.len());
    for item in items.iter().take(usize::from(u8::MAX)) {
        item.put(buf);
    }
}

fn get_list<T: Wire>(buf: &mut &[u8]) -> Result<Vec<T>> {
    let count = buf.take_u8()?;
    let mut items = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        items.push(T::get(buf)?);
    }
    Ok(items)
}

const fn non_zero_u8(value: u8) -> Option<u8> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

const fn non_zero_u16(value: u16) -> Option<u16> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}
