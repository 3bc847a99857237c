use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Stable numeric system id of a sauna control unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Manufacturer brand announced by the control unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Brand {
    /// Tylö
    Tylo,
    /// Helo
    Helo,
    /// Finnleo
    Finnleo,
    /// Amerec
    Amerec,
    /// Any other brand code
    Unknown,
}

impl From<u8> for Brand {
    fn from(value: u8) -> Self {
        match value {
            40 => Self::Tylo,
            41 => Self::Helo,
            42 => Self::Finnleo,
            43 => Self::Amerec,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tylo => write!(f, "Tylö"),
            Self::Helo => write!(f, "Helo"),
            Self::Finnleo => write!(f, "Finnleo"),
            Self::Amerec => write!(f, "Amerec"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Control board product code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardProduct {
    /// Combi manual
    CombiManual = 30,
    /// Combi auto
    CombiAuto = 31,
    /// Steam private
    SteamPrivate = 32,
    /// Steam private auto
    SteamPrivateAuto = 33,
    /// Steam public
    SteamPublic = 34,
    /// Steam USA
    SteamUsa = 35,
    /// Sauna box add-on
    BoxAddon = 36,
    /// Sauna
    Sauna = 37,
    /// Sauna with reduced board functionality
    SaunaLow = 38,
    /// Infrared sauna
    SaunaIr = 39,
    /// Board type could not be determined
    Other = 40,
}

impl From<u8> for BoardProduct {
    fn from(value: u8) -> Self {
        match value {
            30 => Self::CombiManual,
            31 => Self::CombiAuto,
            32 => Self::SteamPrivate,
            33 => Self::SteamPrivateAuto,
            34 => Self::SteamPublic,
            35 => Self::SteamUsa,
            36 => Self::BoxAddon,
            37 => Self::Sauna,
            38 => Self::SaunaLow,
            39 => Self::SaunaIr,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for BoardProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CombiManual => "Combi manual",
            Self::CombiAuto => "Combi auto",
            Self::SteamPrivate => "Steam private",
            Self::SteamPrivateAuto => "Steam private auto",
            Self::SteamPublic => "Steam public",
            Self::SteamUsa => "Steam public/private Manual Empty",
            Self::BoxAddon => "Sauna box addon",
            Self::Sauna => "Sauna",
            Self::SaunaLow => "Sauna low",
            Self::SaunaIr => "Sauna IR",
            Self::Other => "Unknown",
        };
        write!(f, "{name}")
    }
}

/// System type reported when none is announced
pub const DEFAULT_SYSTEM_TYPE: u8 = 20;
/// Multisteam installation
pub const SYSTEM_TYPE_MULTISTEAM: u8 = 21;
/// Tylarium installation
pub const SYSTEM_TYPE_TYLARIUM: u8 = 22;

/// Operating state of the sauna as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Heater off
    Off,
    /// Heating
    On,
    /// Standby at offset temperature
    Standby,
    /// Drying the cabin after a bath
    DryUp,
    /// Cleaning program
    Cleanup,
    /// Descaling program
    Descaling,
    /// Any other state code
    Unknown(u8),
}

impl From<u8> for RunState {
    fn from(value: u8) -> Self {
        match value {
            10 => Self::Off,
            11 => Self::On,
            12 => Self::Standby,
            13 => Self::DryUp,
            14 => Self::Cleanup,
            15 => Self::Descaling,
            other => Self::Unknown(other),
        }
    }
}

impl RunState {
    /// Wire code of the state
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Off => 10,
            Self::On => 11,
            Self::Standby => 12,
            Self::DryUp => 13,
            Self::Cleanup => 14,
            Self::Descaling => 15,
            Self::Unknown(code) => code,
        }
    }

    /// Bus mode and preset labels for this state, `None` for unknown codes
    #[must_use]
    pub const fn labels(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Off => Some(("off", "None")),
            Self::On => Some(("heat", "on")),
            Self::Standby => Some(("auto", "standby")),
            Self::DryUp => Some(("off", "dryup")),
            Self::Cleanup => Some(("off", "cleanup")),
            Self::Descaling => Some(("off", "descaling")),
            Self::Unknown(_) => None,
        }
    }
}

/// Mode requested from the message bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Switch off
    Off,
    /// Start heating
    Heat,
    /// Standby
    Auto,
}

impl RunMode {
    /// Parse the bus payload, `None` for unsupported modes
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "off" => Some(Self::Off),
            "heat" => Some(Self::Heat),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    /// Device state requested by this mode
    #[must_use]
    pub const fn run_state(self) -> RunState {
        match self {
            Self::Off => RunState::Off,
            Self::Heat => RunState::On,
            Self::Auto => RunState::Standby,
        }
    }
}

/// Water tank level of steam generators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaterLevel {
    /// Low
    Low,
    /// Mid
    Mid,
    /// High
    High,
    /// Level sensor reports unknown
    Unknown,
}

impl WaterLevel {
    /// Decode the wire code, `None` for codes outside the enum
    #[must_use]
    pub const fn from_code(value: u8) -> Option<Self> {
        match value {
            10 => Some(Self::Low),
            11 => Some(Self::Mid),
            12 => Some(Self::High),
            13 => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for WaterLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Mid => write!(f, "Mid"),
            Self::High => write!(f, "High"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Facility classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacilityType {
    /// Supervised facility
    Supervised,
    /// Time controlled facility
    TimeControlled,
    /// Private sauna
    Private,
    /// Public sauna
    Public,
    /// Not reported
    Unknown,
}

impl From<u8> for FacilityType {
    fn from(value: u8) -> Self {
        match value {
            20 => Self::Supervised,
            21 => Self::TimeControlled,
            22 => Self::Private,
            23 => Self::Public,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for FacilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Supervised => write!(f, "Supervised"),
            Self::TimeControlled => write!(f, "Time Controlled"),
            Self::Private => write!(f, "Private"),
            Self::Public => write!(f, "Public"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Temperature unit shown on the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    /// Celsius (wire code 10)
    Celsius,
    /// Fahrenheit (wire code 11)
    Fahrenheit,
}

impl From<u8> for TemperatureUnit {
    fn from(value: u8) -> Self {
        if value == 11 {
            Self::Fahrenheit
        } else {
            Self::Celsius
        }
    }
}

/// Which input channel is authoritative for temperature or humidity readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingSource {
    /// Value presented by the control panel (wire code 10)
    PresentedValue,
    /// External sensor (wire code 11)
    ExternalSensor,
}

impl From<u8> for ReadingSource {
    fn from(value: u8) -> Self {
        if value == 10 {
            Self::PresentedValue
        } else {
            Self::ExternalSensor
        }
    }
}

/// Connection status of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No session
    Disconnected,
    /// Connect request sent, waiting for the reply
    Connecting,
    /// Session established
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Timeouts negotiated in the connect reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Communication timeout announced by the device
    pub keepalive_interval: Duration,
    /// Silence after which the session is considered lost
    pub lost_connection_timeout: Duration,
}

impl SessionTimeouts {
    /// Create timeouts from the whole seconds carried on the wire
    #[must_use]
    pub const fn from_secs(keepalive_interval: u16, lost_connection_timeout: u16) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(keepalive_interval as u64),
            lost_connection_timeout: Duration::from_secs(lost_connection_timeout as u64),
        }
    }

    /// Period of the keepalive timer, half the communication timeout
    #[must_use]
    pub fn keepalive_period(&self) -> Duration {
        (self.keepalive_interval / 2).max(Duration::from_millis(500))
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from_secs(10, 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brand_from_u8() {
        assert_eq!(Brand::from(40), Brand::Tylo);
        assert_eq!(Brand::from(41), Brand::Helo);
        assert_eq!(Brand::from(99), Brand::Unknown);
        assert_eq!(Brand::Tylo.to_string(), "Tylö");
    }

    #[test]
    fn test_board_product_names() {
        assert_eq!(BoardProduct::from(30).to_string(), "Combi manual");
        assert_eq!(BoardProduct::from(39).to_string(), "Sauna IR");
        assert_eq!(BoardProduct::from(7), BoardProduct::Other);
    }

    #[test]
    fn test_run_state_labels() {
        assert_eq!(RunState::from(11).labels(), Some(("heat", "on")));
        assert_eq!(RunState::from(15).labels(), Some(("off", "descaling")));
        assert_eq!(RunState::from(42), RunState::Unknown(42));
        assert_eq!(RunState::Unknown(42).labels(), None);
        assert_eq!(RunState::Standby.code(), 12);
    }

    #[test]
    fn test_run_mode_parsing() {
        assert_eq!(RunMode::parse("heat"), Some(RunMode::Heat));
        assert_eq!(RunMode::parse(" auto\n"), Some(RunMode::Auto));
        assert_eq!(RunMode::parse("cool"), None);
        assert_eq!(RunMode::Off.run_state().code(), 10);
    }

    #[test]
    fn test_water_level_codes() {
        assert_eq!(WaterLevel::from_code(11), Some(WaterLevel::Mid));
        assert_eq!(WaterLevel::from_code(0), None);
        assert_eq!(WaterLevel::High.to_string(), "High");
    }

    #[test]
    fn test_session_timeouts() {
        let timeouts = SessionTimeouts::from_secs(10, 30);
        assert_eq!(timeouts.keepalive_period(), Duration::from_secs(5));
        assert_eq!(timeouts.lost_connection_timeout, Duration::from_secs(30));

        let degenerate = SessionTimeouts::from_secs(0, 0);
        assert_eq!(degenerate.keepalive_period(), Duration::from_millis(500));
    }
}
