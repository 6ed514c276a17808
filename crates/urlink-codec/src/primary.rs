//! Primary-channel packet format.
//!
//! ```text
//! +----------------+------+---------------------------------------+
//! | length (u32 BE)| type | sub-packet | sub-packet | ...         |
//! +----------------+------+---------------------------------------+
//! ```
//!
//! `length` counts the whole packet including its own five header bytes.
//! Every sub-packet repeats the same `(u32 length, u8 type)` framing. Only
//! the robot-mode and joint-data sub-packets are interpreted; every other
//! sub-packet type is skipped and its code recorded in
//! [`RobotStateSnapshot::unknown_types`].

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use urlink_types::{JointData, RobotMode, RobotModeData, RobotStateSnapshot, UrError};

/// `(u32 length, u8 type)`
pub const HEADER_LEN: usize = 5;

/// Upper bound on a declared packet length. Real state packets are a few
/// kilobytes; anything larger means the stream is out of sync.
pub const MAX_PACKET_LEN: usize = 64 * 1024;

pub const PACKET_TYPE_ROBOT_STATE: u8 = 16;
pub const PACKET_TYPE_ROBOT_MESSAGE: u8 = 20;

pub const SUBPACKET_ROBOT_MODE: u8 = 0;
pub const SUBPACKET_JOINT_DATA: u8 = 1;

/// Robot-mode payload without the optional trailing speed fraction.
const ROBOT_MODE_LEN: usize = 8 + 7 + 1;
const JOINT_ENTRY_LEN: usize = 3 * 8 + 4 * 4 + 1;
const JOINT_DATA_LEN: usize = urlink_types::JOINT_COUNT * JOINT_ENTRY_LEN;

/// One top-level packet from the primary port.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryPacket {
    RobotState(RobotStateSnapshot),
    /// Controller text message; a syntax error in an uploaded program shows
    /// up here.
    RobotMessage(Bytes),
    /// Any other packet type, ignored by the driver.
    Other { packet_type: u8 },
}

/// Decode one complete packet, header included.
///
/// # Errors
///
/// Returns [`UrError::MalformedPacket`] when the declared length does not
/// match `frame`, when a sub-packet overruns the packet, or when a state
/// packet lacks robot-mode data.
pub fn decode_packet(frame: &[u8]) -> Result<PrimaryPacket, UrError> {
    if frame.len() < HEADER_LEN {
        return Err(UrError::MalformedPacket(format!(
            "packet of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    let mut header = &frame[..HEADER_LEN];
    let declared = header.get_u32() as usize;
    let packet_type = header.get_u8();
    if declared != frame.len() {
        return Err(UrError::MalformedPacket(format!(
            "length field says {declared} bytes but {} are available",
            frame.len()
        )));
    }

    let body = &frame[HEADER_LEN..];
    match packet_type {
        PACKET_TYPE_ROBOT_STATE => decode_robot_state(body).map(PrimaryPacket::RobotState),
        PACKET_TYPE_ROBOT_MESSAGE => Ok(PrimaryPacket::RobotMessage(Bytes::copy_from_slice(body))),
        other => Ok(PrimaryPacket::Other { packet_type: other }),
    }
}

fn decode_robot_state(mut body: &[u8]) -> Result<RobotStateSnapshot, UrError> {
    let mut robot_mode_data = None;
    let mut joints = Vec::new();
    let mut unknown_types = BTreeSet::new();

    while !body.is_empty() {
        if body.len() < HEADER_LEN {
            return Err(UrError::MalformedPacket(format!(
                "{} trailing bytes cannot hold a sub-packet header",
                body.len()
            )));
        }
        let sub_len = (&body[..4]).get_u32() as usize;
        let sub_type = body[4];
        if sub_len < HEADER_LEN || sub_len > body.len() {
            return Err(UrError::MalformedPacket(format!(
                "sub-packet type {sub_type} claims {sub_len} bytes, {} remain",
                body.len()
            )));
        }
        let payload = &body[HEADER_LEN..sub_len];
        match sub_type {
            SUBPACKET_ROBOT_MODE => robot_mode_data = Some(decode_robot_mode(payload)?),
            SUBPACKET_JOINT_DATA => joints = decode_joint_data(payload)?,
            other => {
                unknown_types.insert(other);
            }
        }
        body = &body[sub_len..];
    }

    let robot_mode_data = robot_mode_data.ok_or_else(|| {
        UrError::MalformedPacket("robot-state packet without robot-mode data".to_string())
    })?;
    Ok(RobotStateSnapshot {
        robot_mode_data,
        joints,
        unknown_types,
    })
}

fn decode_robot_mode(mut payload: &[u8]) -> Result<RobotModeData, UrError> {
    if payload.len() < ROBOT_MODE_LEN {
        return Err(UrError::MalformedPacket(format!(
            "robot-mode data needs {ROBOT_MODE_LEN} bytes, got {}",
            payload.len()
        )));
    }
    let timestamp = payload.get_u64();
    let mut flag = || payload.get_u8() != 0;
    let robot_connected = flag();
    let real_robot_enabled = flag();
    let power_on = flag();
    let emergency_stopped = flag();
    let security_stopped = flag();
    let program_running = flag();
    let program_paused = flag();
    let robot_mode = RobotMode::from_code(payload.get_u8());
    let speed_fraction = (payload.remaining() >= 8).then(|| payload.get_f64());

    Ok(RobotModeData {
        timestamp,
        robot_connected,
        real_robot_enabled,
        power_on,
        emergency_stopped,
        security_stopped,
        program_running,
        program_paused,
        robot_mode,
        speed_fraction,
    })
}

fn decode_joint_data(mut payload: &[u8]) -> Result<Vec<JointData>, UrError> {
    if payload.len() < JOINT_DATA_LEN {
        return Err(UrError::MalformedPacket(format!(
            "joint data needs {JOINT_DATA_LEN} bytes, got {}",
            payload.len()
        )));
    }
    let joints = (0..urlink_types::JOINT_COUNT)
        .map(|_| JointData {
            q_actual: payload.get_f64(),
            q_target: payload.get_f64(),
            qd_actual: payload.get_f64(),
            current: payload.get_f32(),
            voltage: payload.get_f32(),
            motor_temperature: payload.get_f32(),
            micro_temperature: payload.get_f32(),
            joint_mode: payload.get_u8(),
        })
        .collect();
    Ok(joints)
}

/// Re-encode the interpretable parts of `snapshot` as a robot-state packet.
///
/// Unknown sub-packets are not reproduced.
pub fn encode_state_packet(snapshot: &RobotStateSnapshot) -> Bytes {
    let mut body = BytesMut::new();

    let mode = &snapshot.robot_mode_data;
    let mode_len = HEADER_LEN + ROBOT_MODE_LEN + if mode.speed_fraction.is_some() { 8 } else { 0 };
    body.put_u32(mode_len as u32);
    body.put_u8(SUBPACKET_ROBOT_MODE);
    body.put_u64(mode.timestamp);
    for flag in [
        mode.robot_connected,
        mode.real_robot_enabled,
        mode.power_on,
        mode.emergency_stopped,
        mode.security_stopped,
        mode.program_running,
        mode.program_paused,
    ] {
        body.put_u8(u8::from(flag));
    }
    body.put_u8(mode.robot_mode.code());
    if let Some(fraction) = mode.speed_fraction {
        body.put_f64(fraction);
    }

    if !snapshot.joints.is_empty() {
        body.put_u32((HEADER_LEN + snapshot.joints.len() * JOINT_ENTRY_LEN) as u32);
        body.put_u8(SUBPACKET_JOINT_DATA);
        for joint in &snapshot.joints {
            body.put_f64(joint.q_actual);
            body.put_f64(joint.q_target);
            body.put_f64(joint.qd_actual);
            body.put_f32(joint.current);
            body.put_f32(joint.voltage);
            body.put_f32(joint.motor_temperature);
            body.put_f32(joint.micro_temperature);
            body.put_u8(joint.joint_mode);
        }
    }

    let mut packet = BytesMut::with_capacity(HEADER_LEN + body.len());
    packet.put_u32((HEADER_LEN + body.len()) as u32);
    packet.put_u8(PACKET_TYPE_ROBOT_STATE);
    packet.extend_from_slice(&body);
    packet.freeze()
}

/// Frames primary packets out of an accumulating byte buffer.
///
/// Partial packets stay buffered until the rest arrives; each call to
/// [`Decoder::decode`] yields at most one packet.
#[derive(Debug, Default)]
pub struct PrimaryPacketCodec;

impl Decoder for PrimaryPacketCodec {
    type Item = PrimaryPacket;
    type Error = UrError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PrimaryPacket>, UrError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let declared = (&src[..4]).get_u32() as usize;
        if !(HEADER_LEN..=MAX_PACKET_LEN).contains(&declared) {
            return Err(UrError::MalformedPacket(format!(
                "declared packet length {declared} is out of range"
            )));
        }
        if src.len() < declared {
            src.reserve(declared - src.len());
            return Ok(None);
        }
        let frame = src.split_to(declared).freeze();
        decode_packet(&frame).map(Some)
    }
}
