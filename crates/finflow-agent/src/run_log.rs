use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use finflow_core::text::truncate;
use finflow_core::types::EngineEvent;

/// JSONL request logger.
///
/// Consumes engine events and writes one JSON object per line to
/// `{log_dir}/{request_id}/{timestamp}.jsonl`. Lines are flushed as they are
/// written, so a crash loses at most the entry in flight.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    request_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = request summary, 2 = adds state
    /// changes and node failures, 3 = adds every node start and completion.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events until cancelled, until the bus closes, or until
    /// `max_requests` requests have finished.
    ///
    /// Take the receiver with [`EventBus::subscribe`](finflow_core::event::EventBus::subscribe)
    /// before submitting requests so that no early event is missed.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<EngineEvent>,
        cancel: CancellationToken,
        max_requests: Option<usize>,
    ) {
        let mut files: HashMap<String, (PathBuf, BufWriter<File>)> = HashMap::new();
        let mut finished = 0usize;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                }
            };

            let request_id = event.request_id().to_string();
            if let Some(entry) = self.event_to_entry(&event) {
                if !files.contains_key(&request_id) {
                    match self.open(&request_id).await {
                        Some(opened) => {
                            files.insert(request_id.clone(), opened);
                        }
                        None => continue,
                    }
                }
                if let Some((path, writer)) = files.get_mut(&request_id) {
                    if let Err(e) = write_entry(writer, &entry).await {
                        error!(error = %e, path = %path.display(), "Failed to write log entry");
                    }
                }
            }

            if let EngineEvent::RequestFinished { .. } = event {
                if let Some((path, mut writer)) = files.remove(&request_id) {
                    writer.flush().await.ok();
                    debug!(path = %path.display(), "Request log closed");
                }
                finished += 1;
                if max_requests.is_some_and(|max| finished >= max) {
                    break;
                }
            }
        }

        for (_, (_, mut writer)) in files {
            writer.flush().await.ok();
        }
    }

    async fn open(&self, request_id: &str) -> Option<(PathBuf, BufWriter<File>)> {
        let dir = self.log_dir.join(request_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, dir = %dir.display(), "Failed to create log directory");
            return None;
        }
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let path = dir.join(format!("{}.jsonl", timestamp));
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => {
                info!(path = %path.display(), "Request log opened");
                Some((path, BufWriter::new(f)))
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open log file");
                None
            }
        }
    }

    /// Convert an event to a log entry; `None` when filtered out by level.
    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node_id: Option<String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            request_id: event.request_id().to_string(),
            event_type: event_type.to_string(),
            node_id,
            detail,
        };

        match event {
            EngineEvent::RequestStarted { query, .. } => Some(entry(
                "request_started",
                None,
                Some(serde_json::json!({ "query": truncate(query, 500) })),
            )),
            EngineEvent::Routed {
                intent,
                entry: entry_node,
                broad,
                fallback,
                ..
            } => Some(entry(
                "routed",
                Some(entry_node.to_string()),
                Some(serde_json::json!({
                    "intent": intent,
                    "broad": broad,
                    "fallback": fallback,
                })),
            )),
            EngineEvent::RequestFinished {
                state,
                contributors,
                failures,
                elapsed_ms,
                ..
            } => Some(entry(
                "request_finished",
                None,
                Some(serde_json::json!({
                    "state": state.to_string(),
                    "contributors": contributors,
                    "failures": failures,
                    "elapsed_ms": elapsed_ms,
                })),
            )),

            EngineEvent::StateChanged { state, .. } if self.level >= 2 => Some(entry(
                "state_changed",
                None,
                Some(serde_json::json!({ "state": state.to_string() })),
            )),
            EngineEvent::NodeFailed {
                node_id,
                kind,
                message,
                ..
            } if self.level >= 2 => Some(entry(
                "node_failed",
                Some(node_id.to_string()),
                Some(serde_json::json!({
                    "kind": kind.to_string(),
                    "message": truncate(message, 200),
                })),
            )),

            EngineEvent::NodeStarted { node_id, .. } if self.level >= 3 => {
                Some(entry("node_started", Some(node_id.to_string()), None))
            }
            EngineEvent::NodeCompleted {
                node_id,
                elapsed_ms,
                ..
            } if self.level >= 3 => Some(entry(
                "node_completed",
                Some(node_id.to_string()),
                Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            )),

            _ => None,
        }
    }
}

async fn write_entry(writer: &mut BufWriter<File>, entry: &LogEntry) -> std::io::Result<()> {
    let json = serde_json::to_string(entry).map_err(std::io::Error::other)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Truncate a string for logging on a char boundary.
#[cfg(test)]
mod tests {
    use super::*;
    use finflow_core::event::EventBus;
    use finflow_core::types::{EngineState, FailureKind, NodeId, RequestId};

    fn started(id: &RequestId) -> EngineEvent {
        EngineEvent::RequestStarted {
            request_id: id.clone(),
            query: "rebalance".into(),
        }
    }

    fn finished(id: &RequestId) -> EngineEvent {
        EngineEvent::RequestFinished {
            request_id: id.clone(),
            state: EngineState::Completed,
            contributors: 2,
            failures: 0,
            elapsed_ms: 12,
        }
    }

    #[test]
    fn test_log_entry_skips_empty_fields() {
        let entry = LogEntry {
            timestamp: "2026-02-24T12:00:00Z".to_string(),
            request_id: "req-1".to_string(),
            event_type: "request_started".to_string(),
            node_id: None,
            detail: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("request_started"));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let id = RequestId::new();
        let state = EngineEvent::StateChanged {
            request_id: id.clone(),
            state: EngineState::Executing,
        };
        let node = EngineEvent::NodeStarted {
            request_id: id.clone(),
            node_id: NodeId::from("educator"),
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&started(&id)).is_some());
        assert!(l1.event_to_entry(&state).is_none());
        assert!(l1.event_to_entry(&node).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&state).is_some());
        assert!(l2.event_to_entry(&node).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        let e = l3.event_to_entry(&node).unwrap();
        assert_eq!(e.node_id.as_deref(), Some("educator"));
    }

    #[tokio::test]
    async fn test_writes_one_file_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let rx = bus.subscribe();
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let handle = tokio::spawn(logger.run(rx, CancellationToken::new(), Some(1)));

        let id = RequestId::new();
        bus.publish(started(&id));
        bus.publish(EngineEvent::NodeFailed {
            request_id: id.clone(),
            node_id: NodeId::from("risk_assessor"),
            kind: FailureKind::Timeout,
            message: "Branch timeout after 50ms: risk_assessor".into(),
        });
        bus.publish(finished(&id));
        handle.await.unwrap();

        let request_dir = dir.path().join(id.to_string());
        let files: Vec<_> = std::fs::read_dir(&request_dir).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files.into_iter().next().unwrap().unwrap().path();
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event_type"], "request_started");
        assert_eq!(lines[1]["node_id"], "risk_assessor");
        assert_eq!(lines[1]["detail"]["kind"], "timeout");
        assert_eq!(lines[2]["detail"]["state"], "completed");
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            RunLogger::new(dir.path().to_path_buf(), 1).run(bus.subscribe(), cancel.clone(), None),
        );
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
