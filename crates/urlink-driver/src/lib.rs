//! `urlink-driver` – connection and protocol layer for the arm driver.
//!
//! Two sockets, each owned by its own receive task:
//!
//! - [`connection`] – outbound primary connection: decodes robot-state
//!   packets and drives the [`ConnectionState`](urlink_types::ConnectionState)
//!   machine; uploads the control programs.
//! - [`command_channel`] – one handler per reverse connection opened by the
//!   uploaded program; tracks telemetry and sends motion commands.
//!
//! They meet in the [`registry`], which the [`supervisor`] watches to
//! sequence programming, reconnection and free-drive switching.
//!
//! # Modules
//!
//! - [`config`] – timing constants and the shared control flags.
//! - [`program`] – control programs uploaded over the primary channel.
//! - [`server`] – reverse-channel accept loop.
//! - [`endpoints`] – request/response facade for external callers.
//! - [`heartbeat`] – reverse-channel liveness monitor.
//! - [`throttle`] – log rate limiter.

pub mod command_channel;
pub mod config;
pub mod connection;
pub mod endpoints;
pub mod heartbeat;
pub mod program;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod throttle;

pub use command_channel::{ChannelContext, CommandChannel};
pub use config::{ControlFlags, FlagSnapshot, Timing};
pub use connection::{OutboundConnection, OutboundSettings};
pub use endpoints::CommandEndpoints;
pub use registry::ConnectionRegistry;
pub use server::ReverseServer;
pub use supervisor::Supervisor;
