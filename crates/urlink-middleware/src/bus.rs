//! Topic-based publish/subscribe bus for driver telemetry.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message and a slow consumer never blocks the connection tasks.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::JointStates`] | Joint positions from either channel, offsets applied |
//! | [`Topic::TcpPose`] | Tool-centre-point poses from the command channel |
//! | [`Topic::DriverAlerts`] | Connection state changes, robot messages, finished waypoints |

use tokio::sync::broadcast;
use tracing::trace;
use urlink_types::{ConnectionState, Event, EventPayload, JointStateRecord, TcpPose};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    JointStates,
    TcpPose,
    DriverAlerts,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    joint_states: broadcast::Sender<Event>,
    tcp_pose: broadcast::Sender<Event>,
    driver_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (joint_states, _) = broadcast::channel(capacity);
        let (tcp_pose, _) = broadcast::channel(capacity);
        let (driver_alerts, _) = broadcast::channel(capacity);
        Self {
            joint_states,
            tcp_pose,
            driver_alerts,
        }
    }

    /// Publish `event` to `topic`.
    ///
    /// Returns the number of receivers handed the event. Publishing with no
    /// subscribers is normal for a headless driver and returns `0`.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(_)) => {
                trace!(?topic, "no subscribers; event dropped");
                0
            }
        }
    }

    /// Subscribe to a single topic.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    // ── Typed helpers ───────────────────────────────────────────────────────

    pub fn publish_joint_state(&self, source: &str, record: JointStateRecord) -> usize {
        self.publish_to(
            Topic::JointStates,
            Event::new(source, EventPayload::JointState(record)),
        )
    }

    pub fn publish_tcp_pose(&self, source: &str, pose: TcpPose) -> usize {
        self.publish_to(Topic::TcpPose, Event::new(source, EventPayload::TcpPose(pose)))
    }

    pub fn publish_state_change(
        &self,
        source: &str,
        from: ConnectionState,
        to: ConnectionState,
    ) -> usize {
        self.publish_to(
            Topic::DriverAlerts,
            Event::new(source, EventPayload::ConnectionChanged { from, to }),
        )
    }

    /// Publish any payload on [`Topic::DriverAlerts`].
    pub fn publish_alert(&self, source: &str, payload: EventPayload) -> usize {
        self.publish_to(Topic::DriverAlerts, Event::new(source, payload))
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::JointStates => &self.joint_states,
            Topic::TcpPose => &self.tcp_pose,
            Topic::DriverAlerts => &self.driver_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`].
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   events were dropped. The caller decides whether to continue.
    /// * `Err(RecvError::Closed)` – every bus handle has been dropped.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
