//! Feeding events and operator notifications.
//!
//! [`EventBus`] fans events out to live subscribers over a broadcast channel
//! and hands each one to a writer task that appends it to a durable
//! [`EventSink`] on the blocking pool, in emission order. Notifications
//! (chat messages to the operator) go through the separate [`Notifier`] seam.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use hydro_core::NodeAddress;
use hydro_protocol::{FeedbackStatus, FeedingEvent};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Broadcast buffer; slow subscribers lag rather than block the run.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

// ============================================================================
// Durable sink
// ============================================================================

pub trait EventSink: Send + Sync {
    fn append(&self, event: &FeedingEvent) -> Result<(), EventLogError>;
}

/// Appends events as JSON lines to `<dir>/<category>_log.jsonl`.
#[derive(Debug)]
pub struct JsonlEventLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, category: &str) -> PathBuf {
        self.dir.join(format!("{category}_log.jsonl"))
    }

    fn io_error(path: &Path, source: std::io::Error) -> EventLogError {
        EventLogError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl EventSink for JsonlEventLog {
    fn append(&self, event: &FeedingEvent) -> Result<(), EventLogError> {
        let mut value = serde_json::to_value(event)?;
        if let Value::Object(map) = &mut value {
            map.entry("timestamp")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        }
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');

        let path = self.path_for(event.category());
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::fs::create_dir_all(&self.dir).map_err(|e| Self::io_error(&self.dir, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Self::io_error(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| Self::io_error(&path, e))
    }
}

// ============================================================================
// Bus
// ============================================================================

enum LogRequest {
    Append(FeedingEvent),
    Flush(oneshot::Sender<()>),
}

/// Event fan-out plus durable append.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FeedingEvent>,
    log: Option<mpsc::UnboundedSender<LogRequest>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EventBus {
    /// Creates a bus. With a sink, the writer task is spawned on the current
    /// tokio runtime; outside a runtime the event log is disabled.
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        let log = sink.and_then(|sink| match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (log_tx, log_rx) = mpsc::unbounded_channel();
                runtime.spawn(write_events(sink, log_rx));
                Some(log_tx)
            }
            Err(_) => {
                warn!("No async runtime, event log disabled");
                None
            }
        });
        Self { tx, log }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedingEvent> {
        self.tx.subscribe()
    }

    /// Publishes `event`. Having no subscribers is not an error; a failed
    /// log append is logged and otherwise ignored.
    pub fn emit(&self, event: FeedingEvent) {
        if let Some(log) = &self.log {
            if log.send(LogRequest::Append(event.clone())).is_err() {
                warn!(event = event.name(), "Event log writer gone, event not persisted");
            }
        }
        let _ = self.tx.send(event);
    }

    /// Waits until every event emitted so far has been handed to the sink.
    pub async fn flush(&self) {
        let Some(log) = &self.log else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if log.send(LogRequest::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Logs a feedback message at the level its status implies and emits it.
    pub fn feedback(
        &self,
        message: impl Into<String>,
        status: FeedbackStatus,
        plant: Option<&NodeAddress>,
    ) {
        let message = message.into();
        let node = plant.map(NodeAddress::as_str).unwrap_or("-");
        match status {
            FeedbackStatus::Error => error!(node, "{message}"),
            FeedbackStatus::Warning => warn!(node, "{message}"),
            FeedbackStatus::Info | FeedbackStatus::Success => info!(node, "{message}"),
        }
        self.emit(FeedingEvent::feedback(message, status, plant.cloned()));
    }
}

async fn write_events(sink: Arc<dyn EventSink>, mut requests: mpsc::UnboundedReceiver<LogRequest>) {
    while let Some(request) = requests.recv().await {
        match request {
            LogRequest::Append(event) => {
                let name = event.name();
                let sink = Arc::clone(&sink);
                let write: JoinHandle<Result<(), EventLogError>> =
                    tokio::task::spawn_blocking(move || sink.append(&event));
                match write.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(event = name, error = %e, "Failed to append event log"),
                    Err(e) => error!(event = name, error = %e, "Event log write task failed"),
                }
            }
            LogRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Event log writer stopped");
}

// ============================================================================
// Notifications
// ============================================================================

/// Out-of-band operator notifications (chat, push, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, message: &str) {
        warn!(notification = message, "Operator notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path().join("logs"));

        log.append(&FeedingEvent::FeedingSequenceState { active: true })
            .unwrap();
        log.append(&FeedingEvent::FillComplete {
            plant_ip: NodeAddress::new("10.0.0.3"),
        })
        .unwrap();

        let raw = std::fs::read_to_string(log.path_for("feeding")).unwrap();
        let lines: Vec<Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "feeding_sequence_state");
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[1]["plant_ip"], "10.0.0.3");
    }

    #[tokio::test]
    async fn test_bus_delivers_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(JsonlEventLog::new(dir.path()));
        let sink: Arc<dyn EventSink> = log.clone();
        let bus = EventBus::new(Some(sink));
        let mut rx = bus.subscribe();

        bus.feedback(
            "Drain complete",
            FeedbackStatus::Success,
            Some(&NodeAddress::new("10.0.0.2")),
        );

        match rx.recv().await.unwrap() {
            FeedingEvent::FeedingFeedback {
                message, plant_ip, ..
            } => {
                assert_eq!(message, "Drain complete");
                assert_eq!(plant_ip, Some(NodeAddress::new("10.0.0.2")));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        bus.flush().await;
        assert!(log.path_for("feeding").exists());
    }

    /// Sink whose appends block until the test opens the gate.
    struct GatedSink {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        written: Mutex<Vec<&'static str>>,
    }

    impl EventSink for GatedSink {
        fn append(&self, event: &FeedingEvent) -> Result<(), EventLogError> {
            let _ = self.gate.lock().unwrap().recv();
            self.written.lock().unwrap().push(event.name());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_emit_does_not_wait_for_the_sink() {
        let (open, gate) = std::sync::mpsc::channel();
        let sink = Arc::new(GatedSink {
            gate: Mutex::new(gate),
            written: Mutex::new(Vec::new()),
        });
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let bus = EventBus::new(Some(dyn_sink));

        // Both return while the first append is still blocked.
        bus.emit(FeedingEvent::FeedingSequenceState { active: true });
        bus.emit(FeedingEvent::FillComplete {
            plant_ip: NodeAddress::new("10.0.0.4"),
        });
        assert!(sink.written.lock().unwrap().is_empty());

        open.send(()).unwrap();
        open.send(()).unwrap();
        bus.flush().await;
        assert_eq!(
            *sink.written.lock().unwrap(),
            vec!["feeding_sequence_state", "fill_complete"]
        );
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(FeedingEvent::FeedingSequenceState { active: false });
    }
}
