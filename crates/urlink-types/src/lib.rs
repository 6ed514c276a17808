//! `urlink-types` – shared data model for the urlink arm driver.
//!
//! Everything that crosses a crate boundary lives here: the decoded
//! primary-channel [`RobotStateSnapshot`], the outbound [`ConnectionState`],
//! the normalized telemetry records published on the bus, the calibration
//! [`JointOffsets`] table, and the global [`UrError`] type.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of joints on the arm. Every joint-space vector on the wire has
/// exactly this many entries.
pub const JOINT_COUNT: usize = 6;

/// Canonical joint names, in wire order, before any configured prefix.
pub const JOINT_NAMES: [&str; JOINT_COUNT] = [
    "shoulder_pan_joint",
    "shoulder_lift_joint",
    "elbow_joint",
    "wrist_1_joint",
    "wrist_2_joint",
    "wrist_3_joint",
];

/// Return [`JOINT_NAMES`] with `prefix` prepended to each entry.
pub fn prefixed_joint_names(prefix: &str) -> Vec<String> {
    JOINT_NAMES.iter().map(|name| format!("{prefix}{name}")).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Primary channel
// ────────────────────────────────────────────────────────────────────────────

/// Operating mode reported by the controller in every robot-state packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RobotMode {
    Running,
    Freedrive,
    Ready,
    Initializing,
    SecurityStopped,
    EmergencyStopped,
    FatalError,
    NoPower,
    NotConnected,
    Shutdown,
    SafeguardStop,
    /// A mode code this driver does not know about.
    Other(u8),
}

impl RobotMode {
    /// Map a wire code onto a mode.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Running,
            1 => Self::Freedrive,
            2 => Self::Ready,
            3 => Self::Initializing,
            4 => Self::SecurityStopped,
            5 => Self::EmergencyStopped,
            6 => Self::FatalError,
            7 => Self::NoPower,
            8 => Self::NotConnected,
            9 => Self::Shutdown,
            10 => Self::SafeguardStop,
            other => Self::Other(other),
        }
    }

    /// The wire code for this mode.
    pub fn code(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Freedrive => 1,
            Self::Ready => 2,
            Self::Initializing => 3,
            Self::SecurityStopped => 4,
            Self::EmergencyStopped => 5,
            Self::FatalError => 6,
            Self::NoPower => 7,
            Self::NotConnected => 8,
            Self::Shutdown => 9,
            Self::SafeguardStop => 10,
            Self::Other(code) => code,
        }
    }

    /// `true` when a program may be uploaded and executed in this mode.
    pub fn can_execute(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

/// Contents of the robot-mode sub-packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotModeData {
    pub timestamp: u64,
    pub robot_connected: bool,
    pub real_robot_enabled: bool,
    pub power_on: bool,
    pub emergency_stopped: bool,
    pub security_stopped: bool,
    pub program_running: bool,
    pub program_paused: bool,
    pub robot_mode: RobotMode,
    /// Only present on controller firmware that appends it.
    pub speed_fraction: Option<f64>,
}

/// Per-joint entry of the joint-data sub-packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointData {
    pub q_actual: f64,
    pub q_target: f64,
    pub qd_actual: f64,
    pub current: f32,
    pub voltage: f32,
    pub motor_temperature: f32,
    pub micro_temperature: f32,
    pub joint_mode: u8,
}

/// One decoded robot-state packet from the primary channel.
///
/// Immutable once decoded; each new packet replaces the previous snapshot
/// wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStateSnapshot {
    pub robot_mode_data: RobotModeData,
    /// Empty when the packet carried no joint-data sub-packet.
    pub joints: Vec<JointData>,
    /// Sub-packet type codes that were present but not interpreted.
    pub unknown_types: BTreeSet<u8>,
}

impl RobotStateSnapshot {
    pub fn robot_mode(&self) -> RobotMode {
        self.robot_mode_data.robot_mode
    }

    pub fn can_execute(&self) -> bool {
        self.robot_mode().can_execute()
    }

    pub fn real_robot_enabled(&self) -> bool {
        self.robot_mode_data.real_robot_enabled
    }
}

/// Lifecycle of the primary (outbound) connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    ReadyToProgram,
    Executing,
    FreeDrive,
}

impl ConnectionState {
    /// `true` in the states from which the control program may be sent.
    pub fn ready_to_program(self) -> bool {
        matches!(self, Self::ReadyToProgram | Self::Executing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connected => "CONNECTED",
            Self::ReadyToProgram => "READY_TO_PROGRAM",
            Self::Executing => "EXECUTING",
            Self::FreeDrive => "FREE_DRIVE",
        };
        f.write_str(label)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Calibration
// ────────────────────────────────────────────────────────────────────────────

/// Per-joint calibration offsets in radians, in wire order.
///
/// `reported = wire + offset` on the way in and `wire = commanded - offset`
/// on the way out, so the wire always carries raw controller angles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointOffsets {
    names: Vec<String>,
    offsets: [f64; JOINT_COUNT],
}

impl JointOffsets {
    /// Build the table for the prefixed joint names, looking each name up in
    /// `table`. Joints without an entry get a zero offset.
    pub fn new(prefix: &str, table: &HashMap<String, f64>) -> Self {
        let names = prefixed_joint_names(prefix);
        let mut offsets = [0.0; JOINT_COUNT];
        for (slot, name) in offsets.iter_mut().zip(&names) {
            *slot = table.get(name).copied().unwrap_or(0.0);
        }
        Self { names, offsets }
    }

    /// A table with every offset set to zero.
    pub fn zeroed(prefix: &str) -> Self {
        Self::new(prefix, &HashMap::new())
    }

    /// Prefixed joint names in wire order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn offsets(&self) -> &[f64; JOINT_COUNT] {
        &self.offsets
    }

    /// Convert wire angles into calibrated (reported) angles.
    pub fn from_wire(&self, wire: &[f64; JOINT_COUNT]) -> [f64; JOINT_COUNT] {
        std::array::from_fn(|i| wire[i] + self.offsets[i])
    }

    /// Convert calibrated (commanded) angles into wire angles.
    pub fn to_wire(&self, commanded: &[f64; JOINT_COUNT]) -> [f64; JOINT_COUNT] {
        std::array::from_fn(|i| commanded[i] - self.offsets[i])
    }
}

/// Check that `values` holds exactly one entry per joint.
///
/// # Errors
///
/// Returns [`UrError::InvalidJointCount`] on any other length.
pub fn joint_vector(values: &[f64]) -> Result<[f64; JOINT_COUNT], UrError> {
    values.try_into().map_err(|_| UrError::InvalidJointCount {
        expected: JOINT_COUNT,
        got: values.len(),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Normalized telemetry
// ────────────────────────────────────────────────────────────────────────────

/// Joint-state record handed to the telemetry sink.
///
/// Positions already have the calibration offset applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointStateRecord {
    pub timestamp: DateTime<Utc>,
    /// Which channel produced the record.
    pub frame_id: String,
    pub names: Vec<String>,
    pub position: Vec<f64>,
    pub velocity: Vec<f64>,
    pub effort: Vec<f64>,
}

/// Unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    /// Rotation built from fixed-axis roll, pitch, yaw (`Rz(yaw)·Ry(pitch)·Rx(roll)`).
    pub fn from_rpy(roll: f64, pitch: f64, yaw: f64) -> Self {
        let (sr, cr) = (roll * 0.5).sin_cos();
        let (sp, cp) = (pitch * 0.5).sin_cos();
        let (sy, cy) = (yaw * 0.5).sin_cos();
        Self {
            x: sr * cp * cy - cr * sp * sy,
            y: cr * sp * cy + sr * cp * sy,
            z: cr * cp * sy - sr * sp * cy,
            w: cr * cp * cy + sr * sp * sy,
        }
    }

    /// Inverse of [`Quaternion::from_rpy`]; returns `(roll, pitch, yaw)`.
    pub fn to_rpy(self) -> (f64, f64, f64) {
        let Self { x, y, z, w } = self;
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        (roll, pitch, yaw)
    }
}

/// Tool-centre-point pose, kept both as position + quaternion and in the raw
/// `[x, y, z, roll, pitch, yaw]` form the controller reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TcpPose {
    pub timestamp: DateTime<Utc>,
    pub position: [f64; 3],
    pub orientation: Quaternion,
    pub euler: [f64; JOINT_COUNT],
}

impl TcpPose {
    /// Build a pose from the controller's `[x, y, z, roll, pitch, yaw]` form.
    pub fn from_euler(euler: [f64; JOINT_COUNT]) -> Self {
        Self {
            timestamp: Utc::now(),
            position: [euler[0], euler[1], euler[2]],
            orientation: Quaternion::from_rpy(euler[3], euler[4], euler[5]),
            euler,
        }
    }

    /// Build a pose from a position and a quaternion, deriving the Euler form.
    pub fn from_position_orientation(position: [f64; 3], orientation: Quaternion) -> Self {
        let (roll, pitch, yaw) = orientation.to_rpy();
        Self {
            timestamp: Utc::now(),
            position,
            orientation,
            euler: [position[0], position[1], position[2], roll, pitch, yaw],
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the telemetry bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"urlink-driver::primary"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the telemetry bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    JointState(JointStateRecord),
    TcpPose(TcpPose),
    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Text the robot-side program printed, or a controller message packet.
    RobotMessage(String),
    WaypointFinished(i32),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type for decoding, connection and contract failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UrError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Frame too large: no terminator within {limit} bytes ({buffered} buffered)")]
    FrameTooLarge { limit: usize, buffered: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    #[error("Socket closed: {0}")]
    SocketClosed(String),

    #[error("Stopped hearing from robot (last heard {0:?} ago)")]
    LivenessTimeout(Duration),

    #[error("Real robot is no longer enabled")]
    RobotDisabled,

    #[error("Programming is currently prevented")]
    ProgrammingPrevented,

    #[error("Not ready to program (state {0})")]
    NotReadyToProgram(ConnectionState),

    #[error("Expected {expected} joint values, got {got}")]
    InvalidJointCount { expected: usize, got: usize },

    #[error("No robot connected")]
    NotConnected,

    #[error("Value {value} does not fit the wire at scale {scale}")]
    ValueOutOfRange { value: f64, scale: f64 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for UrError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => UrError::SocketClosed(err.to_string()),
            _ => UrError::Io(err.to_string()),
        }
    }
}
