mod config;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use urlink_driver::{
    ChannelContext, CommandEndpoints, ConnectionRegistry, ControlFlags, OutboundConnection,
    OutboundSettings, ReverseServer, Supervisor, Timing,
};
use urlink_middleware::{EventBus, Topic, TopicReceiver};
use urlink_types::UrError;

use crate::config::Config;

/// Servo driver for Universal Robots arms.
#[derive(Debug, Parser)]
#[command(name = "urlink", version, about)]
struct Args {
    /// Robot controller hostname or IP.
    robot_hostname: Option<String>,

    /// Config file (default `~/.urlink/config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _tracer_guard = telemetry::init_tracing("urlink");

    let mut cfg = match config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    if let Some(host) = args.robot_hostname {
        cfg.robot_host = host;
    }
    if cfg.robot_host.is_empty() {
        error!("No robot hostname given (argument, config file or URLINK_ROBOT_HOST)");
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start the Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg, Timing::default())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(UrError::RobotDisabled) => {
            error!("Robot is disabled; stopping the driver");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config, timing: Timing) -> Result<(), UrError> {
    for joint in cfg.uncalibrated_joints() {
        warn!(joint = %joint, "No calibration offset for joint");
    }
    let program_template = cfg.program_template()?;

    let flags = Arc::new(ControlFlags::new(cfg.prevent_programming));
    let offsets = Arc::new(cfg.offsets());
    let bus = EventBus::default();
    let registry = Arc::new(ConnectionRegistry::new());

    let server = ReverseServer::bind(
        SocketAddr::from(([0, 0, 0, 0], cfg.reverse_port)),
        ChannelContext {
            registry: Arc::clone(&registry),
            offsets: Arc::clone(&offsets),
            bus: bus.clone(),
            timing,
            max_velocity: cfg.max_velocity,
        },
    )
    .await?;

    let connection = Arc::new(OutboundConnection::new(
        OutboundSettings {
            robot_host: cfg.robot_host.clone(),
            primary_port: cfg.primary_port,
            reverse_port: cfg.reverse_port,
            driver_host: cfg.driver_host.clone(),
            program_template,
        },
        Arc::clone(&flags),
        offsets,
        bus.clone(),
        timing,
    ));
    connection.connect().await?;
    connection.send_reset_program().await?;

    // The handler keeps its own sender alive, so a failed install must not
    // close the channel.
    let shutdown = Arc::new(watch::channel(false).0);
    let handler_tx = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        handler_tx.send_replace(true);
    }) {
        warn!("Could not install Ctrl-C handler: {e}");
    }

    tokio::spawn(log_alerts(bus.subscribe_to(Topic::DriverAlerts)));
    let server_task = tokio::spawn(server.run(shutdown.subscribe()));

    let supervisor = Supervisor::new(
        Arc::clone(&connection),
        registry,
        Arc::new(CommandEndpoints::new(Arc::clone(&flags))),
        flags,
        timing,
    );
    info!("Servo driver running");
    let result = supervisor.run(shutdown.subscribe()).await;

    shutdown.send_replace(true);
    if let Err(e) = server_task.await {
        warn!("Reverse server task failed: {e}");
    }
    connection.disconnect().await;
    if result == Err(UrError::RobotDisabled) {
        tokio::time::sleep(timing.fatal_grace).await;
    }
    info!("Driver stopped");
    result
}

async fn log_alerts(mut alerts: TopicReceiver) {
    loop {
        match alerts.recv().await {
            Ok(event) => debug!(source = %event.source, payload = ?event.payload, "Driver alert"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Alert log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
