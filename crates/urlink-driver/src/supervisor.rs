//! [`Supervisor`] – keeps a programmed robot connected.
//!
//! Each iteration either runs the steady-state checks (a command channel is
//! registered) or the reconnect cycle (none is):
//!
//! 1. wait until the outbound connection is ready to program, reconnecting
//!    it when it dropped;
//! 2. upload the servo program;
//! 3. wait a bounded time for the program to connect back;
//! 4. repeat until a channel registers, then bind it to the endpoints.
//!
//! Flag changes are applied on edges only, computed by [`edge`].

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use urlink_types::{ConnectionState, UrError};

use crate::command_channel::CommandChannel;
use crate::config::{ControlFlags, FlagSnapshot, Timing};
use crate::connection::OutboundConnection;
use crate::endpoints::CommandEndpoints;
use crate::registry::ConnectionRegistry;
use crate::server::stopped;

/// Change of a boolean flag between two observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Steady,
}

pub fn edge(previous: bool, current: bool) -> Edge {
    match (previous, current) {
        (false, true) => Edge::Rising,
        (true, false) => Edge::Falling,
        _ => Edge::Steady,
    }
}

pub struct Supervisor {
    connection: Arc<OutboundConnection>,
    registry: Arc<ConnectionRegistry<CommandChannel>>,
    endpoints: Arc<CommandEndpoints>,
    flags: Arc<ControlFlags>,
    timing: Timing,
}

impl Supervisor {
    pub fn new(
        connection: Arc<OutboundConnection>,
        registry: Arc<ConnectionRegistry<CommandChannel>>,
        endpoints: Arc<CommandEndpoints>,
        flags: Arc<ControlFlags>,
        timing: Timing,
    ) -> Self {
        Self {
            connection,
            registry,
            endpoints,
            flags,
            timing,
        }
    }

    /// Run until `shutdown` turns `true` or the robot reports itself
    /// disabled. Either way a quit command is sent to the live channel, if
    /// any, on the way out.
    ///
    /// # Errors
    ///
    /// Returns [`UrError::RobotDisabled`] when stopped by the fatal signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), UrError> {
        let mut fatal = self.connection.fatal_signal();
        // Flags as last acted upon. Startup already reset the robot, so an
        // initially set prevent-programming flag is not an edge.
        let mut tracked = FlagSnapshot {
            prevent_programming: self.flags.prevent_programming(),
            free_drive: false,
        };

        let result = loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break Ok(()),
                _ = stopped(&mut fatal) => break Err(UrError::RobotDisabled),
                _ = self.step(&mut tracked) => {}
            }
        };

        if let Some(channel) = self.registry.current() {
            if let Err(e) = channel.send_quit().await {
                debug!(error = %e, "quit on shutdown failed");
            }
        }
        result
    }

    async fn step(&self, tracked: &mut FlagSnapshot) {
        if self.registry.current().is_some() {
            tokio::time::sleep(self.timing.steady_poll).await;
            self.apply_flags(tracked).await;
        } else {
            self.reconnect(tracked).await;
        }
    }

    async fn apply_flags(&self, tracked: &mut FlagSnapshot) {
        let flags = self.flags.snapshot();

        match edge(tracked.prevent_programming, flags.prevent_programming) {
            Edge::Rising => {
                info!("Programming now prevented");
                match self.connection.send_reset_program().await {
                    Ok(()) => tracked.prevent_programming = true,
                    Err(e) => warn!(error = %e, "Could not send reset program"),
                }
            }
            Edge::Falling => tracked.prevent_programming = false,
            Edge::Steady => {}
        }

        match edge(tracked.free_drive, flags.free_drive) {
            Edge::Rising => match self.connection.send_free_drive_program().await {
                Ok(()) => {
                    tracked.free_drive = true;
                    warn!("Robot free-drive enabled");
                }
                Err(e) => warn!(error = %e, "Could not enable free-drive"),
            },
            Edge::Falling => self.leave_free_drive(tracked).await,
            Edge::Steady => {}
        }
    }

    async fn leave_free_drive(&self, tracked: &mut FlagSnapshot) {
        match self.connection.send_reset_program().await {
            Ok(()) => {
                tracked.free_drive = false;
                warn!("Robot free-drive disabled");
            }
            Err(e) => warn!(error = %e, "Could not disable free-drive"),
        }
    }

    async fn reconnect(&self, tracked: &mut FlagSnapshot) {
        warn!("Disconnected. Reconnecting");
        loop {
            self.wait_until_ready(tracked).await;
            if let Err(e) = self.connection.send_program().await {
                warn!(error = %e, "Could not program the robot");
                tokio::time::sleep(self.timing.ready_poll).await;
                continue;
            }
            info!("Sent program");

            if let Some(channel) = self
                .registry
                .get(true, Some(self.timing.registry_wait))
                .await
            {
                info!(peer = %channel.peer(), "Robot connected");
                self.endpoints.bind(channel);
                return;
            }
        }
    }

    async fn wait_until_ready(&self, tracked: &mut FlagSnapshot) {
        loop {
            match self.connection.state() {
                state if state.ready_to_program() => return,
                ConnectionState::Disconnected => {
                    if let Err(e) = self.connection.connect().await {
                        warn!(error = %e, "Could not reach the controller");
                    }
                }
                // The free-drive program replaces the servo program, so the
                // toggle back has to be honoured here as well.
                ConnectionState::FreeDrive if tracked.free_drive && !self.flags.free_drive() => {
                    self.leave_free_drive(tracked).await;
                }
                _ => {}
            }
            info!(state = %self.connection.state(), "Waiting to program");
            tokio::time::sleep(self.timing.ready_poll).await;
        }
    }
}
