#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # TylöHelo bridge
//!
//! Connects TylöHelo sauna and steam control panels to a home-automation
//! message bus. Panels announce themselves by UDP broadcast on the local
//! network; the bridge opens a session with an announced panel, keeps it
//! alive, mirrors its state and forwards commands from the bus back to it.
//!
//! ## Protocol Overview
//!
//! - **Discovery**: panels broadcast announcements carrying their system id,
//!   brand, board, name and session port. The bridge can request
//!   announcements with a broadcast of its own.
//! - **Session**: a connect request with the panel PIN, answered by a reply
//!   carrying the keepalive interval and the lost connection timeout. The
//!   bridge sends keepalives every half interval and drops the session when
//!   acknowledgments stop for the timeout.
//! - **State**: panels push sectioned state updates; each section is merged
//!   into a per-device snapshot and every change becomes a bus publication.
//! - **Commands**: set points, run state, lighting, favorites, relays,
//!   user message answers and calendar programs.
//!
//! Only one panel can hold the session port at a time.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tylohelo_bridge::{Gateway, GatewayConfig, GatewayInputs, TracingPublisher, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::from_env()?;
//!     let transport = UdpTransport::bind(&config).await?;
//!     let (unicast, broadcast, _receive_tasks) = transport.spawn_receivers().split();
//!     let (_commands_tx, commands) = mpsc::channel(16);
//!
//!     let gateway = Gateway::new(config, Arc::new(transport), Arc::new(TracingPublisher));
//!     gateway
//!         .run(
//!             GatewayInputs { unicast, broadcast, commands },
//!             async { let _ = tokio::signal::ctrl_c().await; },
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

/// Message bus topics, publications and commands
pub mod bus;
/// Date program scheduling
pub mod calendar;
/// Runtime configuration
pub mod config;
/// Error types and handling
pub mod error;
/// Event loop tying sockets, timers and the bus together
pub mod gateway;
/// Wire protocol message structures and parsing
pub mod protocol;
/// Known devices
pub mod registry;
/// Session lifecycle and device commands
pub mod session;
/// Per-device state snapshots
pub mod state;
/// UDP transport
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use bus::{BusCommand, BusMessage, ChannelPublisher, InboundCommand, Publisher, Topics, TracingPublisher};
pub use calendar::{CalendarEngine, CalendarEntry, TimeGap};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayInputs};
pub use registry::{DeviceRecord, DeviceRegistry};
pub use session::{SessionManager, TimerEvent, TimerKind};
pub use state::{DeviceState, StateEvent};
pub use transport::{MemoryTransport, Packet, ReceiveTasks, Receivers, Transport, UdpTransport};
pub use types::{
    BoardProduct, Brand, ConnectionStatus, DeviceId, FacilityType, ReadingSource, RunMode,
    RunState, SessionTimeouts, TemperatureUnit, WaterLevel,
};

/// Local session port
pub const SESSION_PORT: u16 = config::DEFAULT_SESSION_PORT;
/// Local port receiving announcements
pub const BROADCAST_LISTEN_PORT: u16 = config::DEFAULT_BROADCAST_LISTEN_PORT;
/// Remote port announcement requests go to
pub const BROADCAST_SEND_PORT: u16 = config::DEFAULT_BROADCAST_SEND_PORT;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

