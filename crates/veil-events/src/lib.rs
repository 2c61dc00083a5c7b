#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Event bus shared across the Veil workspace.
//!
//! The bus carries core lifecycle transitions, synthesis results, and the
//! telemetry frames relayed from the core's streaming endpoints. Internally
//! it wraps `tokio::broadcast` with a bounded replay ring so UI consumers
//! that reconnect can catch up on recent events via `Last-Event-ID` style
//! cursors. When the channel overflows, the oldest events are dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Sequential identifier assigned to each published event.
pub type EventId = u64;

/// Default size of the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Lifecycle phase of the supervised core process.
///
/// Transitions are owned exclusively by the process supervisor; every
/// transition is mirrored onto the bus as [`Event::CorePhaseChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorePhase {
    /// No core process exists.
    Stopped,
    /// Config is being synthesized and validated ahead of a spawn.
    Preparing,
    /// The core binary has been launched but has not signalled readiness.
    Spawned,
    /// Stdout is being scanned for the readiness/error signal contract.
    AwaitingReady,
    /// The control-plane API is reachable and streams are attached.
    Running,
    /// An intentional stop is in progress.
    Stopping,
    /// The process exited unexpectedly and a restart is being attempted.
    Restarting,
}

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The supervisor moved to a new lifecycle phase.
    CorePhaseChanged {
        /// Phase the supervisor entered.
        phase: CorePhase,
    },
    /// The core process reported readiness and the API client was rebuilt.
    CoreReady {
        /// OS process id of the running core.
        pid: u32,
        /// Control-plane address the core is listening on.
        ipc_address: String,
    },
    /// The core process exited outside of an intentional stop.
    CoreCrashed {
        /// Exit code when the OS reported one.
        code: Option<i32>,
        /// Automatic restarts left before the supervisor gives up.
        remaining_budget: u8,
    },
    /// The automatic restart budget was exhausted; caller action required.
    CoreRetriesExhausted,
    /// A runtime config was synthesized and written to disk.
    ConfigSynthesized {
        /// Identifier of the profile the config was derived from.
        profile_id: String,
    },
    /// TUN was disabled after the core rejected it for lack of privileges.
    TunDisabled {
        /// Raw core output that triggered the recovery.
        reason: String,
    },
    /// Up/down byte rates from the traffic stream.
    Traffic {
        /// Upload rate in bytes per second.
        up: u64,
        /// Download rate in bytes per second.
        down: u64,
    },
    /// Memory usage frame from the memory stream.
    Memory {
        /// Bytes currently in use by the core.
        in_use: u64,
        /// OS memory limit reported by the core, zero when unknown.
        os_limit: u64,
    },
    /// A log line relayed from the core's log stream.
    CoreLog {
        /// Severity reported by the core.
        level: String,
        /// Raw log payload.
        payload: String,
    },
    /// A connections snapshot from the connections stream.
    Connections {
        /// Raw JSON frame as produced by the core.
        payload: serde_json::Value,
    },
}

impl Event {
    /// Machine-friendly discriminator for push consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CorePhaseChanged { .. } => "core_phase_changed",
            Self::CoreReady { .. } => "core_ready",
            Self::CoreCrashed { .. } => "core_crashed",
            Self::CoreRetriesExhausted => "core_retries_exhausted",
            Self::ConfigSynthesized { .. } => "config_synthesized",
            Self::TunDisabled { .. } => "tun_disabled",
            Self::Traffic { .. } => "traffic",
            Self::Memory { .. } => "memory",
            Self::CoreLog { .. } => "core_log",
            Self::Connections { .. } => "connections",
        }
    }
}

/// Metadata wrapper tracking the identifier and emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier of the event.
    pub id: EventId,
    /// Time the event was published.
    pub timestamp: DateTime<Utc>,
    /// The event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a bus whose broadcast channel and replay ring share the
    /// provided capacity, so dropped events affect both consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish an event, assigning it the next sequential identifier.
    ///
    /// # Panics
    ///
    /// Panics if the replay ring mutex has been poisoned.
    #[allow(clippy::must_use_candidate)]
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut replay = self.replay.lock().expect("event replay mutex poisoned");
            if replay.len() == self.replay_capacity {
                replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }

        // A send error only means no subscriber is currently attached.
        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying buffered events newer than `since_id`.
    ///
    /// # Panics
    ///
    /// Panics if the replay ring mutex has been poisoned.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let replay = self.replay.lock().expect("event replay mutex poisoned");
            for item in &*replay {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }

        EventStream {
            backlog,
            receiver: self.sender.subscribe(),
        }
    }

    /// Identifier of the most recently published event, if any.
    ///
    /// # Panics
    ///
    /// Panics if the replay ring mutex has been poisoned.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let replay = self.replay.lock().expect("event replay mutex poisoned");
        replay.back().map(|envelope| envelope.id)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream that yields replayed events first, then live broadcast events.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, draining the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn ids_are_sequential_and_replay_respects_cursor() {
        let bus = EventBus::with_capacity(16);

        let mut last = 0;
        for up in 0..5u64 {
            last = bus.publish(Event::Traffic { up, down: up * 2 });
        }
        assert_eq!(last, 5);
        assert_eq!(bus.last_event_id(), Some(5));

        let mut stream = bus.subscribe(Some(3));
        let first = stream.next().await.expect("replayed event");
        assert_eq!(first.id, 4);
        let second = stream.next().await.expect("replayed event");
        assert_eq!(second.id, 5);
    }

    #[tokio::test]
    async fn live_subscribers_observe_phase_changes() {
        let bus = EventBus::with_capacity(8);
        let mut stream = bus.subscribe(None);

        bus.publish(Event::CorePhaseChanged {
            phase: CorePhase::Preparing,
        });

        let envelope = timeout(RECV_TIMEOUT, stream.next())
            .await
            .expect("timely delivery")
            .expect("open stream");
        assert_eq!(
            envelope.event,
            Event::CorePhaseChanged {
                phase: CorePhase::Preparing
            }
        );
        assert_eq!(envelope.event.kind(), "core_phase_changed");
    }

    #[tokio::test]
    async fn replay_ring_drops_oldest_when_full() {
        let bus = EventBus::with_capacity(2);
        for up in 0..3u64 {
            bus.publish(Event::Traffic { up, down: 0 });
        }

        // Event 1 was evicted; ids 2 and 3 remain replayable.
        let mut stream = bus.subscribe(Some(0));
        let envelope = stream.next().await.expect("replayed event");
        assert_eq!(envelope.id, 2);
    }
}
