//! Runtime configuration.
//!
//! Defaults match the ports and timings of the TylöHelo panels; every value
//! can be overridden through `BRIDGE_*` environment variables.

use chrono::{FixedOffset, Local, Offset};
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::protocol::APPLICATION_DESCRIPTION;

/// Default unicast session port
pub const DEFAULT_SESSION_PORT: u16 = 51112;
/// Default port announcements are received on
pub const DEFAULT_BROADCAST_LISTEN_PORT: u16 = 54377;
/// Default port announcement requests are sent to
pub const DEFAULT_BROADCAST_SEND_PORT: u16 = 54378;
/// PIN used when none is configured
pub const DEFAULT_PIN: &str = "0000";
/// Topic prefix of every bus publication
pub const DEFAULT_TOPIC_PREFIX: &str = "tylohelo-mqtt-ha/";

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Local port of the unicast session socket
    pub session_port: u16,
    /// Local port receiving broadcast announcements
    pub broadcast_listen_port: u16,
    /// Remote port announcement requests are broadcast to
    pub broadcast_send_port: u16,
    /// Connect to announced devices automatically
    pub auto_connect: bool,
    /// Delay between the connect request and the first discovery publish
    pub discovery_delay: Duration,
    /// Cadence of the availability sweep
    pub sweep_interval: Duration,
    /// Silence after which a device is reported unavailable
    pub availability_timeout: Duration,
    /// PIN sent with connect requests
    pub default_pin: String,
    /// Prefix of every bus topic
    pub topic_prefix: String,
    /// Broadcast an announcement request when the gateway starts
    pub announce_on_start: bool,
    /// Offset used to find "next noon"; the host offset when unset
    pub utc_offset: Option<FixedOffset>,
    /// Application identity sent in connect requests
    pub application_description: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_port: DEFAULT_SESSION_PORT,
            broadcast_listen_port: DEFAULT_BROADCAST_LISTEN_PORT,
            broadcast_send_port: DEFAULT_BROADCAST_SEND_PORT,
            auto_connect: true,
            discovery_delay: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(3),
            availability_timeout: Duration::from_secs(20),
            default_pin: DEFAULT_PIN.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            announce_on_start: true,
            utc_offset: None,
            application_description: APPLICATION_DESCRIPTION.to_string(),
        }
    }
}

impl GatewayConfig {
    /// Build the configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when a variable is set but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when a variable is set but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let utc_offset = match var("BRIDGE_UTC_OFFSET_MINUTES") {
            Some(raw) => {
                let minutes: i32 = parse_number("BRIDGE_UTC_OFFSET_MINUTES", &raw)?;
                let offset = minutes.checked_mul(60).and_then(FixedOffset::east_opt);
                Some(offset.ok_or_else(|| {
                    GatewayError::Config(format!(
                        "BRIDGE_UTC_OFFSET_MINUTES out of range: {minutes}"
                    ))
                })?)
            }
            None => None,
        };

        let mut topic_prefix = var("BRIDGE_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix);
        if !topic_prefix.ends_with('/') {
            topic_prefix.push('/');
        }

        let config = Self {
            session_port: optional("BRIDGE_SESSION_PORT", var("BRIDGE_SESSION_PORT"))?
                .unwrap_or(defaults.session_port),
            broadcast_listen_port: optional(
                "BRIDGE_BROADCAST_LISTEN_PORT",
                var("BRIDGE_BROADCAST_LISTEN_PORT"),
            )?
            .unwrap_or(defaults.broadcast_listen_port),
            broadcast_send_port: optional(
                "BRIDGE_BROADCAST_SEND_PORT",
                var("BRIDGE_BROADCAST_SEND_PORT"),
            )?
            .unwrap_or(defaults.broadcast_send_port),
            auto_connect: var("BRIDGE_AUTO_CONNECT")
                .map_or(defaults.auto_connect, |s| parse_flag(&s)),
            discovery_delay: optional("BRIDGE_DISCOVERY_DELAY_SECS", var("BRIDGE_DISCOVERY_DELAY_SECS"))?
                .map_or(defaults.discovery_delay, Duration::from_secs),
            sweep_interval: optional("BRIDGE_SWEEP_INTERVAL_SECS", var("BRIDGE_SWEEP_INTERVAL_SECS"))?
                .map_or(defaults.sweep_interval, Duration::from_secs),
            availability_timeout: optional(
                "BRIDGE_AVAILABILITY_TIMEOUT_SECS",
                var("BRIDGE_AVAILABILITY_TIMEOUT_SECS"),
            )?
            .map_or(defaults.availability_timeout, Duration::from_secs),
            default_pin: var("BRIDGE_PIN").unwrap_or(defaults.default_pin),
            topic_prefix,
            announce_on_start: var("BRIDGE_ANNOUNCE_ON_START")
                .map_or(defaults.announce_on_start, |s| parse_flag(&s)),
            utc_offset,
            application_description: var("BRIDGE_APPLICATION_DESCRIPTION")
                .unwrap_or(defaults.application_description),
        };
        if config.sweep_interval.is_zero() {
            return Err(GatewayError::Config(
                "BRIDGE_SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Offset used for local noon, resolved against the host when unset
    #[must_use]
    pub fn noon_offset(&self) -> FixedOffset {
        self.utc_offset
            .unwrap_or_else(|| Local::now().offset().fix())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "yes" | "on")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| GatewayError::Config(format!("{key} must be a number, got {value:?}")))
}

fn optional<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
    value.map(|v| parse_number(key, &v)).transpose()
}
