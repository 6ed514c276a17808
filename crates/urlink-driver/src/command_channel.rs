//! [`CommandChannel`] – handler for one reverse connection.
//!
//! The uploaded program connects back to the driver and streams joint
//! states, tool poses, text output and waypoint acknowledgements. The
//! handler registers itself as the live channel for as long as its receive
//! loop runs and releases the slot when the loop ends, for whatever reason.
//!
//! Commands may be sent from any task; writes are serialized by a send lock
//! that is independent of the telemetry lock.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};
use urlink_codec::{Command, ReverseMessage, ReverseMessageCodec, encode_command};
use urlink_middleware::EventBus;
use urlink_types::{
    EventPayload, JOINT_COUNT, JointOffsets, JointStateRecord, TcpPose, UrError, joint_vector,
};

use crate::config::Timing;
use crate::heartbeat::HeartbeatMonitor;
use crate::registry::ConnectionRegistry;

const SOURCE: &str = "urlink-driver::reverse";
const FRAME_ID: &str = "From real-time state data";

/// Everything a handler needs besides its socket.
#[derive(Clone)]
pub struct ChannelContext {
    pub registry: Arc<ConnectionRegistry<CommandChannel>>,
    pub offsets: Arc<JointOffsets>,
    pub bus: EventBus,
    pub timing: Timing,
    /// Upper bound on joint velocity for move-joint commands (rad/s).
    pub max_velocity: f64,
}

/// Most recent telemetry from the reverse channel. Each field is replaced
/// wholesale as messages arrive.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub joint_state: Option<JointStateRecord>,
    pub tcp_pose: Option<TcpPose>,
}

pub struct CommandChannel {
    peer: SocketAddr,
    offsets: Arc<JointOffsets>,
    max_velocity: f64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    telemetry: Mutex<Telemetry>,
}

impl CommandChannel {
    /// Run the handler for an accepted reverse connection until the session
    /// ends.
    ///
    /// Returns `Ok(())` when the program sent a quit message, and the reason
    /// otherwise (socket closed, liveness timeout, decode error).
    pub async fn serve(stream: TcpStream, ctx: ChannelContext) -> Result<(), UrError> {
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        let channel = Arc::new(Self {
            peer,
            offsets: Arc::clone(&ctx.offsets),
            max_velocity: ctx.max_velocity,
            writer: tokio::sync::Mutex::new(write),
            telemetry: Mutex::new(Telemetry::default()),
        });

        ctx.registry.register(Arc::clone(&channel));
        info!(%peer, "Handling a reverse connection");

        let result = channel.receive_loop(read, &ctx).await;
        ctx.registry.release(&channel);
        // Sends through stale handles must fail.
        let _ = channel.writer.lock().await.shutdown().await;
        match &result {
            Ok(()) => info!(%peer, "Connection closed (command): robot quit"),
            Err(e) => warn!(%peer, error = %e, "Connection closed (command)"),
        }
        result
    }

    async fn receive_loop(&self, read: OwnedReadHalf, ctx: &ChannelContext) -> Result<(), UrError> {
        let mut messages = FramedRead::new(read, ReverseMessageCodec);
        let mut heartbeat = HeartbeatMonitor::new(ctx.timing.liveness);
        loop {
            match tokio::time::timeout(ctx.timing.reverse_poll, messages.next()).await {
                Err(_) => Self::check_liveness(&heartbeat)?,
                Ok(None) => {
                    return Err(UrError::SocketClosed("EOF on reverse connection".to_string()));
                }
                Ok(Some(message)) => match message? {
                    ReverseMessage::Quit => return Ok(()),
                    ReverseMessage::JointStates {
                        position,
                        velocity,
                        effort,
                    } => {
                        heartbeat.beat();
                        self.on_joint_states(&position, &velocity, &effort, &ctx.bus);
                    }
                    other => {
                        self.on_message(other, &ctx.bus);
                        Self::check_liveness(&heartbeat)?;
                    }
                },
            }
        }
    }

    fn check_liveness(heartbeat: &HeartbeatMonitor) -> Result<(), UrError> {
        heartbeat.check().inspect_err(|e| {
            error!(error = %e, "Stopped hearing from robot. Disconnected");
        })
    }

    fn on_joint_states(
        &self,
        position: &[f64; JOINT_COUNT],
        velocity: &[f64; JOINT_COUNT],
        effort: &[f64; JOINT_COUNT],
        bus: &EventBus,
    ) {
        let record = JointStateRecord {
            timestamp: chrono::Utc::now(),
            frame_id: FRAME_ID.to_string(),
            names: self.offsets.names().to_vec(),
            position: self.offsets.from_wire(position).to_vec(),
            velocity: velocity.to_vec(),
            effort: effort.to_vec(),
        };
        self.telemetry().joint_state = Some(record.clone());
        bus.publish_joint_state(SOURCE, record);
    }

    fn on_message(&self, message: ReverseMessage, bus: &EventBus) {
        match message {
            ReverseMessage::Out(text) => {
                info!(peer = %self.peer, "Out: {text}");
                bus.publish_alert(SOURCE, EventPayload::RobotMessage(text));
            }
            ReverseMessage::TcpState(euler) => {
                let pose = TcpPose::from_euler(euler);
                self.telemetry().tcp_pose = Some(pose);
                bus.publish_tcp_pose(SOURCE, pose);
            }
            ReverseMessage::WaypointFinished(id) => {
                debug!(waypoint = id, "Waypoint finished");
                bus.publish_alert(SOURCE, EventPayload::WaypointFinished(id));
            }
            ReverseMessage::JointStates { .. } | ReverseMessage::Quit => {}
        }
    }

    // ── Commands ────────────────────────────────────────────────────────────

    pub async fn send_quit(&self) -> Result<(), UrError> {
        self.send(&Command::Quit).await
    }

    pub async fn send_stop(&self) -> Result<(), UrError> {
        self.send(&Command::StopJ).await
    }

    /// Servo to calibrated joint angles `q` over `duration` seconds.
    ///
    /// # Errors
    ///
    /// * [`UrError::InvalidJointCount`] unless `q` has exactly six entries.
    /// * [`UrError::ValueOutOfRange`] for a NaN, infinite or oversized value.
    ///   Nothing is written in either case.
    pub async fn send_servo_joint(
        &self,
        waypoint_id: i32,
        q: &[f64],
        duration: f64,
    ) -> Result<(), UrError> {
        let q = self.offsets.to_wire(&joint_vector(q)?);
        self.send(&Command::ServoJ {
            waypoint_id,
            q,
            duration,
        })
        .await
    }

    /// Joint-space move to calibrated angles `q`. `velocity` is clamped to
    /// the configured maximum.
    pub async fn send_move_joint(
        &self,
        waypoint_id: i32,
        q: &[f64],
        acceleration: f64,
        velocity: f64,
        duration: f64,
        blend_radius: f64,
    ) -> Result<(), UrError> {
        let q = self.offsets.to_wire(&joint_vector(q)?);
        let velocity = if velocity > self.max_velocity {
            warn!(
                requested = velocity,
                max = self.max_velocity,
                "Clamping move-joint velocity"
            );
            self.max_velocity
        } else {
            velocity
        };
        self.send(&Command::MoveJ {
            waypoint_id,
            q,
            acceleration,
            velocity,
            duration,
            blend_radius,
        })
        .await
    }

    /// Linear move to `pose` (`[x, y, z, roll, pitch, yaw]`). Cartesian
    /// values carry no joint offset.
    pub async fn send_linear_move(&self, waypoint_id: i32, pose: &[f64]) -> Result<(), UrError> {
        let pose = joint_vector(pose)?;
        self.send(&Command::MoveL { waypoint_id, pose }).await
    }

    async fn send(&self, command: &Command) -> Result<(), UrError> {
        let bytes = encode_command(command)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    // ── Telemetry ───────────────────────────────────────────────────────────

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn last_joint_state(&self) -> Option<JointStateRecord> {
        self.telemetry().joint_state.clone()
    }

    pub fn last_tcp_pose(&self) -> Option<TcpPose> {
        self.telemetry().tcp_pose
    }

    /// Last pose in the controller's `[x, y, z, roll, pitch, yaw]` form.
    pub fn last_tcp_pose_euler(&self) -> Option<[f64; JOINT_COUNT]> {
        self.telemetry().tcp_pose.map(|pose| pose.euler)
    }

    /// Copy of both telemetry fields.
    pub fn snapshot(&self) -> Telemetry {
        self.telemetry().clone()
    }

    fn telemetry(&self) -> MutexGuard<'_, Telemetry> {
        self.telemetry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
