//! [`OutboundConnection`] – the primary channel to the controller.
//!
//! # State machine
//!
//! | From | Trigger | To |
//! |---|---|---|
//! | `DISCONNECTED` | [`connect`](OutboundConnection::connect) succeeds | `CONNECTED` |
//! | `CONNECTED` | snapshot can execute | `READY_TO_PROGRAM` |
//! | `READY_TO_PROGRAM` | snapshot cannot execute | `CONNECTED` |
//! | `READY_TO_PROGRAM`, `EXECUTING` | [`send_program`](OutboundConnection::send_program) | `EXECUTING` |
//! | `EXECUTING` | snapshot cannot execute | `CONNECTED` (halted) |
//! | any | timeout, EOF or decode error | `DISCONNECTED` |
//! | any | [`send_reset_program`](OutboundConnection::send_reset_program) | `READY_TO_PROGRAM` |
//! | any | [`send_free_drive_program`](OutboundConnection::send_free_drive_program) | `FREE_DRIVE` |
//!
//! Snapshot-driven moves are computed by the pure [`transition`] function.
//! The receive task is the only writer of snapshot-driven state; program
//! uploads are the only other writers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};
use urlink_codec::{PrimaryPacket, PrimaryPacketCodec};
use urlink_middleware::EventBus;
use urlink_types::{
    ConnectionState, EventPayload, JOINT_COUNT, JointOffsets, JointStateRecord,
    RobotStateSnapshot, UrError,
};

use crate::config::{ControlFlags, Timing};
use crate::program::{FREE_DRIVE_PROGRAM, RESET_PROGRAM, render_program};
use crate::throttle::Throttle;

const SOURCE: &str = "urlink-driver::primary";
const FRAME_ID: &str = "From binary state data";
const UNKNOWN_WARN_PERIOD: Duration = Duration::from_secs(1);

// ────────────────────────────────────────────────────────────────────────────
// Pure state machine
// ────────────────────────────────────────────────────────────────────────────

/// Side effect of a snapshot-driven transition, reported for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    ReadyToProgram,
    NotReady,
    Halted,
}

/// Next state after a snapshot whose robot mode does (`can_execute`) or does
/// not allow program execution.
pub fn transition(
    state: ConnectionState,
    can_execute: bool,
) -> (ConnectionState, Option<Transition>) {
    use ConnectionState::*;
    match (state, can_execute) {
        (Connected, true) => (ReadyToProgram, Some(Transition::ReadyToProgram)),
        (ReadyToProgram, false) => (Connected, Some(Transition::NotReady)),
        (Executing, false) => (Connected, Some(Transition::Halted)),
        (other, _) => (other, None),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Settings
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OutboundSettings {
    pub robot_host: String,
    pub primary_port: u16,
    /// Port the uploaded program connects back to.
    pub reverse_port: u16,
    /// Address templated into the program. Defaults to the local address of
    /// the primary socket.
    pub driver_host: Option<String>,
    pub program_template: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Shared session state
// ────────────────────────────────────────────────────────────────────────────

struct Session {
    /// Bumped on every connect and disconnect so a superseded receive task
    /// cannot touch the new session.
    id: u64,
    state: ConnectionState,
    last_state: Option<RobotStateSnapshot>,
    local_addr: Option<SocketAddr>,
}

struct Shared {
    session: Mutex<Session>,
    offsets: Arc<JointOffsets>,
    bus: EventBus,
    fatal: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, session: &mut Session, to: ConnectionState) {
        let from = session.state;
        if from != to {
            session.state = to;
            debug!(%from, %to, "connection state changed");
            self.bus.publish_state_change(SOURCE, from, to);
        }
    }

    fn on_packet(
        &self,
        session_id: u64,
        packet: PrimaryPacket,
        unknown: &mut Throttle,
    ) -> Result<(), UrError> {
        match packet {
            PrimaryPacket::RobotState(snapshot) => self.on_state(session_id, snapshot, unknown),
            PrimaryPacket::RobotMessage(raw) => {
                let text = String::from_utf8_lossy(&raw).into_owned();
                warn!(message = %text, "controller reported a message");
                self.bus.publish_alert(SOURCE, EventPayload::RobotMessage(text));
                Ok(())
            }
            PrimaryPacket::Other { packet_type } => {
                debug!(packet_type, "ignoring primary packet");
                Ok(())
            }
        }
    }

    fn on_state(
        &self,
        session_id: u64,
        snapshot: RobotStateSnapshot,
        unknown: &mut Throttle,
    ) -> Result<(), UrError> {
        if !snapshot.real_robot_enabled() {
            return Err(UrError::RobotDisabled);
        }

        let mut session = self.lock();
        if session.id != session_id {
            return Err(UrError::SocketClosed("session superseded".to_string()));
        }

        // Until the program runs, the primary channel is the only joint source.
        if session.state != ConnectionState::Executing && !snapshot.joints.is_empty() {
            self.bus.publish_joint_state(SOURCE, self.joint_record(&snapshot));
        }

        let (next, event) = transition(session.state, snapshot.can_execute());
        match event {
            Some(Transition::ReadyToProgram) => info!("Robot ready to program"),
            Some(Transition::NotReady) => {
                info!(mode = ?snapshot.robot_mode(), "Robot no longer ready to program")
            }
            Some(Transition::Halted) => warn!(mode = ?snapshot.robot_mode(), "Halted"),
            None => {}
        }
        self.set_state(&mut session, next);

        if !snapshot.unknown_types.is_empty() && unknown.allow() {
            warn!(
                types = ?snapshot.unknown_types,
                "Ignoring unknown sub-packet type(s)"
            );
        }
        session.last_state = Some(snapshot);
        Ok(())
    }

    fn joint_record(&self, snapshot: &RobotStateSnapshot) -> JointStateRecord {
        let joint = |i: usize| snapshot.joints.get(i);
        let wire: [f64; JOINT_COUNT] =
            std::array::from_fn(|i| joint(i).map_or(0.0, |j| j.q_actual));
        JointStateRecord {
            timestamp: chrono::Utc::now(),
            frame_id: FRAME_ID.to_string(),
            names: self.offsets.names().to_vec(),
            position: self.offsets.from_wire(&wire).to_vec(),
            velocity: (0..JOINT_COUNT)
                .map(|i| joint(i).map_or(0.0, |j| j.qd_actual))
                .collect(),
            effort: vec![0.0; JOINT_COUNT],
        }
    }

    fn end_session(&self, session_id: u64, reason: &UrError) {
        if *reason == UrError::RobotDisabled {
            error!("Real robot is no longer enabled; refusing to drive it");
            self.fatal.send_replace(true);
        }
        let mut session = self.lock();
        if session.id != session_id {
            return;
        }
        warn!(error = %reason, "Robot disconnected");
        self.set_state(&mut session, ConnectionState::Disconnected);
    }
}

async fn receive_loop(shared: Arc<Shared>, read: OwnedReadHalf, session_id: u64, limit: Duration) {
    let mut frames = FramedRead::new(read, PrimaryPacketCodec);
    let mut unknown = Throttle::new(UNKNOWN_WARN_PERIOD);
    let reason = loop {
        match tokio::time::timeout(limit, frames.next()).await {
            Err(_) => break UrError::LivenessTimeout(limit),
            Ok(None) => break UrError::SocketClosed("controller closed the connection".to_string()),
            Ok(Some(Err(e))) => break e,
            Ok(Some(Ok(packet))) => {
                if let Err(e) = shared.on_packet(session_id, packet, &mut unknown) {
                    break e;
                }
            }
        }
    };
    shared.end_session(session_id, &reason);
}

// ────────────────────────────────────────────────────────────────────────────
// OutboundConnection
// ────────────────────────────────────────────────────────────────────────────

pub struct OutboundConnection {
    settings: OutboundSettings,
    flags: Arc<ControlFlags>,
    timing: Timing,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundConnection {
    pub fn new(
        settings: OutboundSettings,
        flags: Arc<ControlFlags>,
        offsets: Arc<JointOffsets>,
        bus: EventBus,
        timing: Timing,
    ) -> Self {
        let (fatal, _) = watch::channel(false);
        Self {
            settings,
            flags,
            timing,
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    id: 0,
                    state: ConnectionState::Disconnected,
                    last_state: None,
                    local_addr: None,
                }),
                offsets,
                bus,
                fatal,
            }),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Open a fresh session, tearing down any previous one, and start its
    /// receive task.
    ///
    /// # Errors
    ///
    /// Returns [`UrError::Io`] (or `SocketClosed`) when the controller cannot
    /// be reached; the state stays `DISCONNECTED`.
    pub async fn connect(&self) -> Result<(), UrError> {
        self.disconnect().await;

        let host = self.settings.robot_host.as_str();
        let port = self.settings.primary_port;
        let stream = TcpStream::connect((host, port)).await?;
        let local_addr = stream.local_addr().ok();
        let (read, write) = stream.into_split();
        *self.writer.lock().await = Some(write);

        let session_id = {
            let mut session = self.shared.lock();
            session.id += 1;
            session.local_addr = local_addr;
            session.last_state = None;
            self.shared.set_state(&mut session, ConnectionState::Connected);
            session.id
        };
        let task = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            read,
            session_id,
            self.timing.primary_timeout,
        ));
        *self.reader_slot() = Some(task);
        info!(host, port, "Connected to controller");
        Ok(())
    }

    /// Stop the receive task and close the socket.
    pub async fn disconnect(&self) {
        let task = self.reader_slot().take();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let mut session = self.shared.lock();
        session.id += 1;
        session.last_state = None;
        self.shared.set_state(&mut session, ConnectionState::Disconnected);
    }

    /// Upload the servo program and move to `EXECUTING`.
    ///
    /// # Errors
    ///
    /// * [`UrError::ProgrammingPrevented`] – the prevent-programming flag is set.
    /// * [`UrError::NotReadyToProgram`] – not in `READY_TO_PROGRAM`/`EXECUTING`.
    pub async fn send_program(&self) -> Result<(), UrError> {
        if self.flags.prevent_programming() {
            info!("Programming is currently prevented");
            return Err(UrError::ProgrammingPrevented);
        }
        let (state, local_addr) = {
            let session = self.shared.lock();
            (session.state, session.local_addr)
        };
        if !state.ready_to_program() {
            return Err(UrError::NotReadyToProgram(state));
        }
        let driver_host = self
            .settings
            .driver_host
            .clone()
            .or_else(|| local_addr.map(|addr| addr.ip().to_string()))
            .ok_or(UrError::NotConnected)?;
        let program = render_program(
            &self.settings.program_template,
            &driver_host,
            self.settings.reverse_port,
        );

        info!(robot = %self.settings.robot_host, driver = %driver_host, "Programming the robot");
        self.write(program.as_bytes()).await?;
        self.set_state(ConnectionState::Executing);
        Ok(())
    }

    pub async fn send_reset_program(&self) -> Result<(), UrError> {
        self.write(RESET_PROGRAM.as_bytes()).await?;
        self.set_state(ConnectionState::ReadyToProgram);
        Ok(())
    }

    pub async fn send_free_drive_program(&self) -> Result<(), UrError> {
        self.write(FREE_DRIVE_PROGRAM.trim().as_bytes()).await?;
        self.set_state(ConnectionState::FreeDrive);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn ready_to_program(&self) -> bool {
        self.state().ready_to_program()
    }

    /// Most recent robot-state snapshot of the current session.
    pub fn last_state(&self) -> Option<RobotStateSnapshot> {
        self.shared.lock().last_state.clone()
    }

    /// Local address of the primary socket, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().local_addr
    }

    /// Becomes `true`, permanently, once the controller reports the real
    /// robot as disabled.
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.shared.fatal.subscribe()
    }

    fn set_state(&self, to: ConnectionState) {
        let mut session = self.shared.lock();
        self.shared.set_state(&mut session, to);
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), UrError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(UrError::NotConnected)?;
        stream.write_all(bytes).await?;
        Ok(())
    }

    fn reader_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for OutboundConnection {
    fn drop(&mut self) {
        let slot = self.reader.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}
