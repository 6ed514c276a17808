//! [`CommandEndpoints`] – request/response facade for external callers.
//!
//! Each endpoint forwards to the bound [`CommandChannel`] or reads one of
//! its telemetry snapshots. The supervisor rebinds the facade every time a
//! new reverse connection registers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};
use urlink_types::{JOINT_COUNT, JointStateRecord, Quaternion, TcpPose, UrError};

use crate::command_channel::{CommandChannel, Telemetry};
use crate::config::ControlFlags;

/// Waypoint id attached to moves requested through the endpoints.
pub const ENDPOINT_WAYPOINT_ID: i32 = 999;

struct Binding {
    channel: Arc<CommandChannel>,
    initial: Telemetry,
}

pub struct CommandEndpoints {
    flags: Arc<ControlFlags>,
    binding: Mutex<Option<Binding>>,
}

impl CommandEndpoints {
    pub fn new(flags: Arc<ControlFlags>) -> Self {
        Self {
            flags,
            binding: Mutex::new(None),
        }
    }

    /// Route subsequent requests to `channel`, remembering its telemetry at
    /// bind time.
    pub fn bind(&self, channel: Arc<CommandChannel>) {
        let initial = channel.snapshot();
        *self.lock() = Some(Binding { channel, initial });
        warn!("Robot connected to command endpoints");
    }

    pub fn channel(&self) -> Option<Arc<CommandChannel>> {
        self.lock().as_ref().map(|b| Arc::clone(&b.channel))
    }

    /// Linear move to a pose given as position and orientation.
    ///
    /// Returns the `[x, y, z, roll, pitch, yaw]` form that was sent.
    ///
    /// # Errors
    ///
    /// [`UrError::NotConnected`] when no channel is bound, or the channel's
    /// send error.
    pub async fn move_to_pose(
        &self,
        position: [f64; 3],
        orientation: Quaternion,
    ) -> Result<[f64; JOINT_COUNT], UrError> {
        let channel = self.channel().ok_or(UrError::NotConnected)?;
        let target = TcpPose::from_position_orientation(position, orientation).euler;
        channel.send_linear_move(ENDPOINT_WAYPOINT_ID, &target).await?;
        Ok(target)
    }

    /// Latest tool pose, carrying both the quaternion and the Euler form.
    pub fn current_pose(&self) -> Option<TcpPose> {
        self.channel()?.last_tcp_pose()
    }

    /// Request free-drive on or off; the supervisor applies it on its next
    /// iteration.
    pub fn set_free_drive(&self, active: bool) -> String {
        self.flags.set_free_drive(active);
        info!(active, "Free-drive requested");
        format!("set freedrive {active}")
    }

    pub fn initial_joint_state(&self) -> Option<JointStateRecord> {
        self.lock().as_ref()?.initial.joint_state.clone()
    }

    pub fn initial_pose(&self) -> Option<TcpPose> {
        self.lock().as_ref()?.initial.tcp_pose
    }

    fn lock(&self) -> MutexGuard<'_, Option<Binding>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbound_endpoints_report_not_connected() {
        let endpoints = CommandEndpoints::new(Arc::new(ControlFlags::default()));
        assert_eq!(
            endpoints
                .move_to_pose([0.0; 3], Quaternion::from_rpy(0.0, 0.0, 0.0))
                .await,
            Err(UrError::NotConnected)
        );
        assert!(endpoints.current_pose().is_none());
        assert!(endpoints.initial_joint_state().is_none());
    }

    #[test]
    fn free_drive_toggle_sets_flag_and_reports() {
        let flags = Arc::new(ControlFlags::default());
        let endpoints = CommandEndpoints::new(Arc::clone(&flags));
        assert_eq!(endpoints.set_free_drive(true), "set freedrive true");
        assert!(flags.free_drive());
        assert_eq!(endpoints.set_free_drive(false), "set freedrive false");
        assert!(!flags.free_drive());
    }
}
