//! Reverse-channel message format.
//!
//! Every message starts with a big-endian `i32` type code; the payload
//! layout depends on the code. Numeric payloads are big-endian `i32`s
//! carrying fixed-point values:
//!
//! | Quantity | Scale |
//! |---|---|
//! | joint angles, velocities, efforts, poses, accelerations | 10 000 |
//! | durations | 1 000 000 |
//! | blend radius | 1 000 |
//!
//! Encoding rounds to the nearest integer with ties toward +∞, i.e.
//! `floor(value * scale + 0.5)`, the same expression the controller
//! program uses. Values that are not finite or that land outside the `i32`
//! range are rejected with [`UrError::ValueOutOfRange`] instead of being
//! saturated.
//!
//! The scales and type codes are shared with the program running on the
//! controller and must not drift from it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use urlink_types::{JOINT_COUNT, UrError};

pub const MSG_OUT: i32 = 1;
pub const MSG_QUIT: i32 = 2;
pub const MSG_JOINT_STATES: i32 = 3;
pub const MSG_MOVEJ: i32 = 4;
pub const MSG_WAYPOINT_FINISHED: i32 = 5;
pub const MSG_STOPJ: i32 = 6;
pub const MSG_SERVOJ: i32 = 7;
pub const MSG_MOVEL: i32 = 8;
pub const MSG_TCP_STATE: i32 = 9;
pub const MSG_SERVOC: i32 = 10;
pub const MSG_FREEDRIVE: i32 = 11;

pub const MULT_JOINTSTATE: f64 = 10_000.0;
pub const MULT_TIME: f64 = 1_000_000.0;
pub const MULT_BLEND: f64 = 1_000.0;

/// Text-out messages end with this byte.
pub const TEXT_TERMINATOR: u8 = b'~';
/// A text-out message must terminate within this many bytes.
pub const MAX_TEXT_LEN: usize = 2000;

const CODE_LEN: usize = 4;
const INT_LEN: usize = 4;

/// Messages the robot-side program sends to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ReverseMessage {
    Out(String),
    JointStates {
        position: [f64; JOINT_COUNT],
        velocity: [f64; JOINT_COUNT],
        effort: [f64; JOINT_COUNT],
    },
    /// `[x, y, z, roll, pitch, yaw]`
    TcpState([f64; JOINT_COUNT]),
    WaypointFinished(i32),
    Quit,
}

/// Commands the driver sends to the robot-side program.
///
/// Joint values are raw wire angles; calibration offsets must already have
/// been removed.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Quit,
    StopJ,
    ServoJ {
        waypoint_id: i32,
        q: [f64; JOINT_COUNT],
        duration: f64,
    },
    MoveJ {
        waypoint_id: i32,
        q: [f64; JOINT_COUNT],
        acceleration: f64,
        velocity: f64,
        duration: f64,
        blend_radius: f64,
    },
    MoveL {
        waypoint_id: i32,
        pose: [f64; JOINT_COUNT],
    },
}

fn to_fixed(value: f64, scale: f64) -> Result<i32, UrError> {
    let scaled = (value * scale + 0.5).floor();
    if !scaled.is_finite() || scaled < f64::from(i32::MIN) || scaled > f64::from(i32::MAX) {
        return Err(UrError::ValueOutOfRange { value, scale });
    }
    Ok(scaled as i32)
}

fn from_fixed(raw: i32, scale: f64) -> f64 {
    f64::from(raw) / scale
}

fn get_scaled<const N: usize>(buf: &mut impl Buf, scale: f64) -> [f64; N] {
    std::array::from_fn(|_| from_fixed(buf.get_i32(), scale))
}

fn put_scaled(buf: &mut impl BufMut, values: &[f64], scale: f64) -> Result<(), UrError> {
    for value in values {
        buf.put_i32(to_fixed(*value, scale)?);
    }
    Ok(())
}

/// Bytes needed after the type code before a message of `code` can be
/// decoded, or `None` for codes without a fixed-size payload.
fn fixed_payload_len(code: i32) -> Option<usize> {
    match code {
        MSG_QUIT => Some(0),
        MSG_JOINT_STATES => Some(3 * JOINT_COUNT * INT_LEN),
        MSG_TCP_STATE => Some(JOINT_COUNT * INT_LEN),
        MSG_WAYPOINT_FINISHED => Some(INT_LEN),
        _ => None,
    }
}

/// Decode the next robot-to-driver message from `src`, consuming its bytes.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete message; the
/// buffer is left untouched in that case.
///
/// # Errors
///
/// * [`UrError::FrameTooLarge`] – a text-out message has no terminator
///   within [`MAX_TEXT_LEN`] bytes.
/// * [`UrError::UnknownMessageType`] – the type code is not a robot-to-driver
///   message.
pub fn decode_message(src: &mut BytesMut) -> Result<Option<ReverseMessage>, UrError> {
    if src.len() < CODE_LEN {
        return Ok(None);
    }
    let code = (&src[..CODE_LEN]).get_i32();

    if code == MSG_OUT {
        let text = &src[CODE_LEN..];
        let window = &text[..text.len().min(MAX_TEXT_LEN)];
        let Some(end) = window.iter().position(|b| *b == TEXT_TERMINATOR) else {
            if text.len() >= MAX_TEXT_LEN {
                return Err(UrError::FrameTooLarge {
                    limit: MAX_TEXT_LEN,
                    buffered: text.len(),
                });
            }
            return Ok(None);
        };
        src.advance(CODE_LEN);
        let body = src.split_to(end);
        src.advance(1);
        return Ok(Some(ReverseMessage::Out(
            String::from_utf8_lossy(&body).into_owned(),
        )));
    }

    let Some(payload_len) = fixed_payload_len(code) else {
        return Err(UrError::UnknownMessageType(code));
    };
    if src.len() < CODE_LEN + payload_len {
        src.reserve(CODE_LEN + payload_len - src.len());
        return Ok(None);
    }
    src.advance(CODE_LEN);
    let mut payload = src.split_to(payload_len);

    let message = match code {
        MSG_QUIT => ReverseMessage::Quit,
        MSG_JOINT_STATES => ReverseMessage::JointStates {
            position: get_scaled(&mut payload, MULT_JOINTSTATE),
            velocity: get_scaled(&mut payload, MULT_JOINTSTATE),
            effort: get_scaled(&mut payload, MULT_JOINTSTATE),
        },
        MSG_TCP_STATE => ReverseMessage::TcpState(get_scaled(&mut payload, MULT_JOINTSTATE)),
        _ => ReverseMessage::WaypointFinished(payload.get_i32()),
    };
    Ok(Some(message))
}

/// Encode a robot-to-driver message. Used by simulated controllers.
///
/// # Errors
///
/// [`UrError::ValueOutOfRange`] for a value the wire cannot carry.
pub fn encode_message(message: &ReverseMessage) -> Result<Bytes, UrError> {
    let mut buf = BytesMut::new();
    match message {
        ReverseMessage::Out(text) => {
            buf.put_i32(MSG_OUT);
            buf.extend_from_slice(text.as_bytes());
            buf.put_u8(TEXT_TERMINATOR);
        }
        ReverseMessage::JointStates {
            position,
            velocity,
            effort,
        } => {
            buf.put_i32(MSG_JOINT_STATES);
            put_scaled(&mut buf, position, MULT_JOINTSTATE)?;
            put_scaled(&mut buf, velocity, MULT_JOINTSTATE)?;
            put_scaled(&mut buf, effort, MULT_JOINTSTATE)?;
        }
        ReverseMessage::TcpState(pose) => {
            buf.put_i32(MSG_TCP_STATE);
            put_scaled(&mut buf, pose, MULT_JOINTSTATE)?;
        }
        ReverseMessage::WaypointFinished(id) => {
            buf.put_i32(MSG_WAYPOINT_FINISHED);
            buf.put_i32(*id);
        }
        ReverseMessage::Quit => buf.put_i32(MSG_QUIT),
    }
    Ok(buf.freeze())
}

/// Encode a driver-to-robot command as a run of big-endian `i32`s.
///
/// # Errors
///
/// [`UrError::ValueOutOfRange`] when any target, duration or limit is NaN,
/// infinite, or too large for the wire. Nothing is encoded in that case.
pub fn encode_command(command: &Command) -> Result<Bytes, UrError> {
    let mut buf = BytesMut::with_capacity(12 * INT_LEN);
    match command {
        Command::Quit => buf.put_i32(MSG_QUIT),
        Command::StopJ => buf.put_i32(MSG_STOPJ),
        Command::ServoJ {
            waypoint_id,
            q,
            duration,
        } => {
            buf.put_i32(MSG_SERVOJ);
            buf.put_i32(*waypoint_id);
            put_scaled(&mut buf, q, MULT_JOINTSTATE)?;
            buf.put_i32(to_fixed(*duration, MULT_TIME)?);
        }
        Command::MoveJ {
            waypoint_id,
            q,
            acceleration,
            velocity,
            duration,
            blend_radius,
        } => {
            buf.put_i32(MSG_MOVEJ);
            buf.put_i32(*waypoint_id);
            put_scaled(&mut buf, q, MULT_JOINTSTATE)?;
            buf.put_i32(to_fixed(*acceleration, MULT_JOINTSTATE)?);
            buf.put_i32(to_fixed(*velocity, MULT_JOINTSTATE)?);
            buf.put_i32(to_fixed(*duration, MULT_TIME)?);
            buf.put_i32(to_fixed(*blend_radius, MULT_BLEND)?);
        }
        Command::MoveL { waypoint_id, pose } => {
            buf.put_i32(MSG_MOVEL);
            buf.put_i32(*waypoint_id);
            put_scaled(&mut buf, pose, MULT_JOINTSTATE)?;
        }
    }
    Ok(buf.freeze())
}

/// Decode the next driver-to-robot command from `src`. This is the robot
/// side of [`encode_command`], used by simulated controllers.
///
/// # Errors
///
/// Returns [`UrError::UnknownMessageType`] for codes that are not commands.
pub fn decode_command(src: &mut BytesMut) -> Result<Option<Command>, UrError> {
    if src.len() < CODE_LEN {
        return Ok(None);
    }
    let code = (&src[..CODE_LEN]).get_i32();
    let ints = match code {
        MSG_QUIT | MSG_STOPJ => 0,
        MSG_SERVOJ => 1 + JOINT_COUNT + 1,
        MSG_MOVEJ => 1 + JOINT_COUNT + 4,
        MSG_MOVEL => 1 + JOINT_COUNT,
        other => return Err(UrError::UnknownMessageType(other)),
    };
    if src.len() < CODE_LEN + ints * INT_LEN {
        return Ok(None);
    }
    src.advance(CODE_LEN);
    let mut payload = src.split_to(ints * INT_LEN);

    let command = match code {
        MSG_QUIT => Command::Quit,
        MSG_STOPJ => Command::StopJ,
        MSG_SERVOJ => Command::ServoJ {
            waypoint_id: payload.get_i32(),
            q: get_scaled(&mut payload, MULT_JOINTSTATE),
            duration: from_fixed(payload.get_i32(), MULT_TIME),
        },
        MSG_MOVEJ => Command::MoveJ {
            waypoint_id: payload.get_i32(),
            q: get_scaled(&mut payload, MULT_JOINTSTATE),
            acceleration: from_fixed(payload.get_i32(), MULT_JOINTSTATE),
            velocity: from_fixed(payload.get_i32(), MULT_JOINTSTATE),
            duration: from_fixed(payload.get_i32(), MULT_TIME),
            blend_radius: from_fixed(payload.get_i32(), MULT_BLEND),
        },
        _ => Command::MoveL {
            waypoint_id: payload.get_i32(),
            pose: get_scaled(&mut payload, MULT_JOINTSTATE),
        },
    };
    Ok(Some(command))
}

/// [`Decoder`] over [`decode_message`], for use with `FramedRead`.
#[derive(Debug, Default)]
pub struct ReverseMessageCodec;

impl Decoder for ReverseMessageCodec {
    type Item = ReverseMessage;
    type Error = UrError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ReverseMessage>, UrError> {
        decode_message(src)
    }
}
