//! `urlink-middleware` – telemetry fan-out for the arm driver.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe bus built on Tokio broadcast
//!   channels. The connection tasks publish normalized joint states, tool
//!   poses and driver alerts here; any number of consumers subscribe.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
