//! In-process controller simulator for integration tests.
//!
//! Listens on a loopback primary port, streams robot-state packets, and
//! "runs" uploaded programs: a servo program opens a reverse connection to
//! the address templated into it and streams joint states until killed,
//! silenced, or told to quit.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use urlink_codec::{Command, ReverseMessage, decode_command, encode_message, encode_state_packet};
use urlink_driver::program::SERVO_PROGRAM_TEMPLATE;
use urlink_driver::{
    ChannelContext, CommandEndpoints, ConnectionRegistry, ControlFlags, OutboundConnection,
    OutboundSettings, ReverseServer, Supervisor, Timing,
};
use urlink_middleware::EventBus;
use urlink_types::{JointData, JointOffsets, RobotMode, RobotModeData, RobotStateSnapshot, UrError};

const STATE_PERIOD: Duration = Duration::from_millis(20);
const JOINT_PERIOD: Duration = Duration::from_millis(10);

#[derive(Default)]
pub struct Counters {
    pub programs: AtomicUsize,
    pub resets: AtomicUsize,
    pub free_drives: AtomicUsize,
    pub quits: AtomicUsize,
    /// Bumped whenever running programs must stop.
    generation: AtomicUsize,
}

pub struct SimController {
    pub primary_addr: SocketAddr,
    pub counters: Arc<Counters>,
    robot: Arc<Mutex<(RobotMode, bool)>>,
    silent: Arc<AtomicBool>,
}

impl SimController {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let primary_addr = listener.local_addr().unwrap();
        let sim = Self {
            primary_addr,
            counters: Arc::new(Counters::default()),
            robot: Arc::new(Mutex::new((RobotMode::Ready, true))),
            silent: Arc::new(AtomicBool::new(false)),
        };
        let primary = PrimarySide {
            counters: Arc::clone(&sim.counters),
            robot: Arc::clone(&sim.robot),
            silent: Arc::clone(&sim.silent),
        };
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(primary.clone().serve(stream));
            }
        });
        sim
    }

    pub fn set_robot(&self, mode: RobotMode, enabled: bool) {
        *self.robot.lock().unwrap() = (mode, enabled);
    }

    /// Stop streaming joint states without closing the reverse socket.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Close every running program's reverse socket.
    pub fn kill_sessions(&self) {
        self.counters.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self, pick: impl Fn(&Counters) -> &AtomicUsize) -> usize {
        pick(&self.counters).load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct PrimarySide {
    counters: Arc<Counters>,
    robot: Arc<Mutex<(RobotMode, bool)>>,
    silent: Arc<AtomicBool>,
}

#[derive(Clone, Copy)]
enum Program {
    Reset,
    FreeDrive,
    Servo,
}

const PROGRAMS: [(Program, &str, &str); 3] = [
    (Program::Reset, "def resetProg():", "\nend"),
    (Program::FreeDrive, "def freedriveProg():", "\nend"),
    (Program::Servo, "def driverProg():", "socket_close()\nend\n"),
];

impl PrimarySide {
    async fn serve(self, stream: TcpStream) {
        let (mut read, mut write) = stream.into_split();

        let robot = Arc::clone(&self.robot);
        let streamer = tokio::spawn(async move {
            loop {
                let (mode, enabled) = *robot.lock().unwrap();
                if write.write_all(&encode_state_packet(&snapshot(mode, enabled))).await.is_err() {
                    return;
                }
                tokio::time::sleep(STATE_PERIOD).await;
            }
        });

        let mut text = String::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match read.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            text.push_str(&String::from_utf8_lossy(&chunk[..n]));
            while let Some((program, body)) = next_program(&mut text) {
                self.run(program, &body);
            }
        }
        streamer.abort();
    }

    fn run(&self, program: Program, body: &str) {
        match program {
            Program::Reset => {
                self.counters.resets.fetch_add(1, Ordering::SeqCst);
            }
            Program::FreeDrive => {
                self.counters.free_drives.fetch_add(1, Ordering::SeqCst);
                // The new program replaces whatever was running.
                self.counters.generation.fetch_add(1, Ordering::SeqCst);
            }
            Program::Servo => {
                self.counters.programs.fetch_add(1, Ordering::SeqCst);
                let generation = self.counters.generation.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(run_program(
                    reverse_address(body),
                    generation,
                    Arc::clone(&self.counters),
                    Arc::clone(&self.silent),
                ));
            }
        }
    }
}

/// Remove the earliest complete program from the front of `text`.
fn next_program(text: &mut String) -> Option<(Program, String)> {
    let (program, start, footer) = PROGRAMS
        .iter()
        .filter_map(|(program, header, footer)| {
            text.find(header).map(|start| (*program, start, *footer))
        })
        .min_by_key(|(_, start, _)| *start)?;
    let end = start + text[start..].find(footer)? + footer.len();
    let body = text[start..end].to_string();
    text.replace_range(..end, "");
    Some((program, body))
}

fn reverse_address(program: &str) -> SocketAddr {
    let open = program.find("socket_open(\"").unwrap() + "socket_open(\"".len();
    let rest = &program[open..];
    let host_end = rest.find('"').unwrap();
    let host = &rest[..host_end];
    let port_start = host_end + "\", ".len();
    let port_end = rest[port_start..].find(')').unwrap() + port_start;
    let port: u16 = rest[port_start..port_end].parse().unwrap();
    format!("{host}:{port}").parse().unwrap()
}

async fn run_program(
    addr: SocketAddr,
    generation: usize,
    counters: Arc<Counters>,
    silent: Arc<AtomicBool>,
) {
    let Ok(stream) = TcpStream::connect(addr).await else {
        return;
    };
    let (mut read, mut write) = stream.into_split();
    let hello = encode_message(&ReverseMessage::Out("hello".to_string())).unwrap();
    if write.write_all(&hello).await.is_err() {
        return;
    }

    let mut commands = BytesMut::new();
    let mut tick = tokio::time::interval(JOINT_PERIOD);
    loop {
        if counters.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        tokio::select! {
            _ = tick.tick() => {
                if silent.load(Ordering::SeqCst) {
                    continue;
                }
                let message = encode_message(&ReverseMessage::JointStates {
                    position: [0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
                    velocity: [0.0; 6],
                    effort: [0.0; 6],
                })
                .unwrap();
                if write.write_all(&message).await.is_err() {
                    return;
                }
            }
            n = read.read_buf(&mut commands) => {
                if matches!(n, Ok(0) | Err(_)) {
                    return;
                }
                while let Ok(Some(command)) = decode_command(&mut commands) {
                    if command == Command::Quit {
                        counters.quits.fetch_add(1, Ordering::SeqCst);
                        let _ = write.write_all(&encode_message(&ReverseMessage::Quit).unwrap()).await;
                        return;
                    }
                }
            }
        }
    }
}

pub fn snapshot(mode: RobotMode, enabled: bool) -> RobotStateSnapshot {
    RobotStateSnapshot {
        robot_mode_data: RobotModeData {
            timestamp: 0,
            robot_connected: true,
            real_robot_enabled: enabled,
            power_on: true,
            emergency_stopped: false,
            security_stopped: false,
            program_running: false,
            program_paused: false,
            robot_mode: mode,
            speed_fraction: Some(1.0),
        },
        joints: vec![
            JointData {
                q_actual: 0.0,
                q_target: 0.0,
                qd_actual: 0.0,
                current: 0.0,
                voltage: 48.0,
                motor_temperature: 25.0,
                micro_temperature: 30.0,
                joint_mode: 253,
            };
            6
        ],
        unknown_types: BTreeSet::from([42]),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver stack
// ────────────────────────────────────────────────────────────────────────────

pub fn fast_timing() -> Timing {
    Timing {
        primary_timeout: Duration::from_millis(500),
        reverse_poll: Duration::from_millis(50),
        liveness: Duration::from_millis(300),
        steady_poll: Duration::from_millis(50),
        ready_poll: Duration::from_millis(50),
        registry_wait: Duration::from_millis(500),
        fatal_grace: Duration::from_millis(10),
    }
}

pub struct Driver {
    pub connection: Arc<OutboundConnection>,
    pub registry: Arc<ConnectionRegistry<urlink_driver::CommandChannel>>,
    pub endpoints: Arc<CommandEndpoints>,
    pub flags: Arc<ControlFlags>,
    pub bus: EventBus,
    shutdown: watch::Sender<bool>,
    pub supervisor: tokio::task::JoinHandle<Result<(), UrError>>,
}

impl Driver {
    pub async fn start(sim: &SimController, timing: Timing) -> Self {
        let flags = Arc::new(ControlFlags::default());
        let offsets = Arc::new(JointOffsets::zeroed(""));
        let bus = EventBus::default();
        let registry = Arc::new(ConnectionRegistry::new());
        let ctx = ChannelContext {
            registry: Arc::clone(&registry),
            offsets: Arc::clone(&offsets),
            bus: bus.clone(),
            timing,
            max_velocity: 2.0,
        };
        let server = ReverseServer::bind("127.0.0.1:0".parse().unwrap(), ctx)
            .await
            .unwrap();
        let reverse_port = server.local_addr().unwrap().port();

        let connection = Arc::new(OutboundConnection::new(
            OutboundSettings {
                robot_host: sim.primary_addr.ip().to_string(),
                primary_port: sim.primary_addr.port(),
                reverse_port,
                driver_host: None,
                program_template: SERVO_PROGRAM_TEMPLATE.to_string(),
            },
            Arc::clone(&flags),
            offsets,
            bus.clone(),
            timing,
        ));
        connection.connect().await.unwrap();
        connection.send_reset_program().await.unwrap();

        let endpoints = Arc::new(CommandEndpoints::new(Arc::clone(&flags)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.run(shutdown_rx.clone()));
        let supervisor = Supervisor::new(
            Arc::clone(&connection),
            Arc::clone(&registry),
            Arc::clone(&endpoints),
            Arc::clone(&flags),
            timing,
        );
        let supervisor = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

        Self {
            connection,
            registry,
            endpoints,
            flags,
            bus,
            shutdown,
            supervisor,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
pub async fn eventually(limit: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
