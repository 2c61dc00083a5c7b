//! Long-lived telemetry subscriptions over the core's WebSocket endpoints.
//!
//! Each stream (traffic, memory, logs, connections) runs as its own task
//! with an independent retry budget. Any received frame proves the core is
//! healthy and refills the budget; an unexpected close or failed dial
//! consumes one unit. A drained budget ends the task quietly, leaving the
//! caller to restart streams explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use veil_events::{Event, EventBus};

use crate::client::EndpointSource;
use crate::error::{ApiError, ApiResult};
use crate::ipc::IpcEndpoint;
use crate::transport::{self, IpcStream};

/// Reconnect attempts granted to a stream, refilled on every frame.
pub const RETRY_BUDGET: u32 = 10;

/// Pause between reconnect attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Which core endpoint a supervisor subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// Up/down byte rates.
    Traffic,
    /// Core memory usage.
    Memory,
    /// Core log lines at the given level.
    Logs {
        /// Minimum level the core should emit.
        level: String,
    },
    /// Connection table snapshots.
    Connections,
}

impl StreamKind {
    /// Request path for the subscription.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::Traffic => "/traffic".to_string(),
            Self::Memory => "/memory".to_string(),
            Self::Logs { level } => format!("/logs?level={level}"),
            Self::Connections => "/connections".to_string(),
        }
    }

    const fn label(&self) -> &'static str {
        match self {
            Self::Traffic => "traffic",
            Self::Memory => "memory",
            Self::Logs { .. } => "logs",
            Self::Connections => "connections",
        }
    }
}

/// One open subscription; `None` means the peer closed or failed.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame from the subscription.
    async fn next_frame(&mut self) -> Option<String>;
}

/// Opens subscriptions; the seam test doubles replace.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Open one subscription against the endpoint.
    async fn open(&self, endpoint: &IpcEndpoint, kind: &StreamKind)
    -> ApiResult<Box<dyn FrameStream>>;
}

/// Production frame source: WebSocket over the IPC stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsFrameSource;

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn open(
        &self,
        endpoint: &IpcEndpoint,
        kind: &StreamKind,
    ) -> ApiResult<Box<dyn FrameStream>> {
        let stream = transport::connect(endpoint)
            .await
            .map_err(|source| ApiError::Transport {
                operation: "stream_connect",
                source,
            })?;
        let url = format!("ws://veil{}", kind.path());
        let (socket, _) = tokio_tungstenite::client_async(url, stream)
            .await
            .map_err(|source| ApiError::StreamHandshake {
                path: kind.path(),
                source,
            })?;
        Ok(Box::new(WsFrameStream { inner: socket }))
    }
}

struct WsFrameStream {
    inner: WebSocketStream<IpcStream>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(text.to_string()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }
}

/// Task handle for one telemetry subscription.
pub struct StreamSupervisor {
    kind: StreamKind,
    budget: Arc<AtomicU32>,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl StreamSupervisor {
    /// Spawn the subscription task with a full retry budget.
    #[must_use]
    pub fn spawn(
        kind: StreamKind,
        endpoints: Arc<dyn EndpointSource>,
        source: Arc<dyn FrameSource>,
        bus: EventBus,
    ) -> Self {
        Self::spawn_with_delay(kind, endpoints, source, bus, RETRY_DELAY)
    }

    pub(crate) fn spawn_with_delay(
        kind: StreamKind,
        endpoints: Arc<dyn EndpointSource>,
        source: Arc<dyn FrameSource>,
        bus: EventBus,
        delay: Duration,
    ) -> Self {
        let budget = Arc::new(AtomicU32::new(RETRY_BUDGET));
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(run_stream(
            kind.clone(),
            endpoints,
            source,
            bus,
            Arc::clone(&budget),
            Arc::clone(&stop),
            delay,
        ));
        Self {
            kind,
            budget,
            stop,
            handle,
        }
    }

    /// Which subscription this supervisor drives.
    #[must_use]
    pub const fn kind(&self) -> &StreamKind {
        &self.kind
    }

    /// Reconnect attempts left.
    #[must_use]
    pub fn remaining_budget(&self) -> u32 {
        self.budget.load(Ordering::SeqCst)
    }

    /// Stop the subscription: zero the budget and wake the task.
    pub fn stop(&self) {
        self.budget.store(0, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// Whether the task has exited (stopped or budget drained).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_stream(
    kind: StreamKind,
    endpoints: Arc<dyn EndpointSource>,
    source: Arc<dyn FrameSource>,
    bus: EventBus,
    budget: Arc<AtomicU32>,
    stop: Arc<Notify>,
    delay: Duration,
) {
    loop {
        if budget.load(Ordering::SeqCst) == 0 {
            break;
        }

        let Some(endpoint) = endpoints.current().await else {
            // No core running: not a failure, just wait for one.
            if wait_or_stop(&stop, delay).await {
                return;
            }
            continue;
        };

        let opened = tokio::select! {
            _ = stop.notified() => return,
            opened = source.open(&endpoint, &kind) => opened,
        };
        let mut frames = match opened {
            Ok(frames) => frames,
            Err(error) => {
                let left = consume(&budget);
                debug!(stream = kind.label(), %error, remaining = left, "stream dial failed");
                if wait_or_stop(&stop, delay).await {
                    return;
                }
                continue;
            }
        };

        loop {
            if budget.load(Ordering::SeqCst) == 0 {
                return;
            }
            let frame = tokio::select! {
                _ = stop.notified() => return,
                frame = frames.next_frame() => frame,
            };
            match frame {
                Some(text) => {
                    budget.store(RETRY_BUDGET, Ordering::SeqCst);
                    publish_frame(&kind, &text, &bus);
                }
                None => {
                    let left = consume(&budget);
                    warn!(stream = kind.label(), remaining = left, "stream closed unexpectedly");
                    break;
                }
            }
        }

        if wait_or_stop(&stop, delay).await {
            return;
        }
    }
    debug!(stream = kind.label(), "stream supervisor exiting");
}

/// Returns true when the stop signal arrived during the pause.
async fn wait_or_stop(stop: &Notify, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.notified() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

fn consume(budget: &AtomicU32) -> u32 {
    let _ = budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
        Some(left.saturating_sub(1))
    });
    budget.load(Ordering::SeqCst)
}

#[derive(Deserialize)]
struct TrafficFrame {
    up: u64,
    down: u64,
}

#[derive(Deserialize)]
struct MemoryFrame {
    inuse: u64,
    #[serde(default)]
    oslimit: u64,
}

#[derive(Deserialize)]
struct LogFrame {
    #[serde(rename = "type")]
    level: String,
    payload: String,
}

fn publish_frame(kind: &StreamKind, text: &str, bus: &EventBus) {
    let event = match kind {
        StreamKind::Traffic => serde_json::from_str::<TrafficFrame>(text)
            .ok()
            .map(|frame| Event::Traffic {
                up: frame.up,
                down: frame.down,
            }),
        StreamKind::Memory => serde_json::from_str::<MemoryFrame>(text)
            .ok()
            .map(|frame| Event::Memory {
                in_use: frame.inuse,
                os_limit: frame.oslimit,
            }),
        StreamKind::Logs { .. } => serde_json::from_str::<LogFrame>(text)
            .ok()
            .map(|frame| Event::CoreLog {
                level: frame.level,
                payload: frame.payload,
            }),
        StreamKind::Connections => serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .map(|payload| Event::Connections { payload }),
    };
    event.map_or_else(
        || debug!(stream = kind.label(), "discarding malformed frame"),
        |event| {
            bus.publish(event);
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::timeout;

    const TEST_DELAY: Duration = Duration::from_millis(5);
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct FixedEndpoint;

    #[async_trait]
    impl EndpointSource for FixedEndpoint {
        async fn current(&self) -> Option<IpcEndpoint> {
            Some(IpcEndpoint::Unix(std::path::PathBuf::from("/tmp/test.sock")))
        }
    }

    enum Session {
        Fail,
        /// Yield these frames, then keep the subscription open forever.
        FramesThenHold(Vec<String>),
    }

    /// Frame source driven by a script of sessions. Once the script runs
    /// out, dials either fail or hang depending on `fail_when_drained`.
    struct ScriptedSource {
        sessions: Mutex<VecDeque<Session>>,
        fail_when_drained: bool,
    }

    impl ScriptedSource {
        fn new(sessions: Vec<Session>, fail_when_drained: bool) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                fail_when_drained,
            })
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn open(
            &self,
            _endpoint: &IpcEndpoint,
            _kind: &StreamKind,
        ) -> ApiResult<Box<dyn FrameStream>> {
            let session = self.sessions.lock().expect("script mutex").pop_front();
            match session {
                Some(Session::Fail) => Err(ApiError::NotReady),
                Some(Session::FramesThenHold(frames)) => Ok(Box::new(ScriptedStream {
                    frames: frames.into(),
                })),
                None if self.fail_when_drained => Err(ApiError::NotReady),
                None => {
                    std::future::pending::<()>().await;
                    unreachable!("pending future resolved")
                }
            }
        }
    }

    struct ScriptedStream {
        frames: VecDeque<String>,
    }

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Option<String> {
            if let Some(frame) = self.frames.pop_front() {
                return Some(frame);
            }
            std::future::pending::<()>().await;
            unreachable!("pending future resolved")
        }
    }

    #[tokio::test]
    async fn a_received_frame_refills_the_budget() {
        let bus = EventBus::with_capacity(16);
        let mut events = bus.subscribe(None);
        let source = ScriptedSource::new(
            vec![
                Session::Fail,
                Session::Fail,
                Session::FramesThenHold(vec![r#"{"up":10,"down":20}"#.to_string()]),
            ],
            false,
        );

        let supervisor = StreamSupervisor::spawn_with_delay(
            StreamKind::Traffic,
            Arc::new(FixedEndpoint),
            source,
            bus,
            TEST_DELAY,
        );

        let envelope = timeout(TEST_TIMEOUT, events.next())
            .await
            .expect("frame delivered")
            .expect("bus open");
        assert_eq!(envelope.event, Event::Traffic { up: 10, down: 20 });
        assert_eq!(supervisor.remaining_budget(), RETRY_BUDGET);
        supervisor.stop();
    }

    #[tokio::test]
    async fn a_drained_budget_stops_reconnecting_without_panicking() {
        let bus = EventBus::with_capacity(8);
        let source = ScriptedSource::new(Vec::new(), true);

        let supervisor = StreamSupervisor::spawn_with_delay(
            StreamKind::Memory,
            Arc::new(FixedEndpoint),
            source,
            bus,
            TEST_DELAY,
        );

        timeout(TEST_TIMEOUT, async {
            while !supervisor.is_finished() {
                tokio::time::sleep(TEST_DELAY).await;
            }
        })
        .await
        .expect("supervisor gives up in time");
        assert_eq!(supervisor.remaining_budget(), 0);
    }

    #[tokio::test]
    async fn stop_zeroes_the_budget_and_ends_the_task() {
        let bus = EventBus::with_capacity(8);
        let source = ScriptedSource::new(Vec::new(), false);

        let supervisor = StreamSupervisor::spawn_with_delay(
            StreamKind::Connections,
            Arc::new(FixedEndpoint),
            source,
            bus,
            TEST_DELAY,
        );
        tokio::time::sleep(TEST_DELAY).await;
        supervisor.stop();

        timeout(TEST_TIMEOUT, async {
            while !supervisor.is_finished() {
                tokio::time::sleep(TEST_DELAY).await;
            }
        })
        .await
        .expect("supervisor stops in time");
        assert_eq!(supervisor.remaining_budget(), 0);
    }

    #[tokio::test]
    async fn frames_decode_per_stream_kind() {
        let bus = EventBus::with_capacity(16);
        let mut events = bus.subscribe(None);

        publish_frame(&StreamKind::Memory, r#"{"inuse":512,"oslimit":0}"#, &bus);
        publish_frame(
            &StreamKind::Logs {
                level: "info".to_string(),
            },
            r#"{"type":"warning","payload":"listener stalled"}"#,
            &bus,
        );
        publish_frame(&StreamKind::Traffic, "not json", &bus);
        publish_frame(&StreamKind::Connections, r#"{"connections":[]}"#, &bus);

        let first = events.next().await.expect("memory event");
        assert_eq!(
            first.event,
            Event::Memory {
                in_use: 512,
                os_limit: 0
            }
        );
        let second = events.next().await.expect("log event");
        assert_eq!(
            second.event,
            Event::CoreLog {
                level: "warning".to_string(),
                payload: "listener stalled".to_string()
            }
        );
        // The malformed traffic frame was dropped; connections come next.
        let third = events.next().await.expect("connections event");
        assert_eq!(third.event.kind(), "connections");
    }
}
