//! Audit logging for device writes and poller health changes.
//!
//! Every write attempt, every transition into or out of a degraded or failed
//! cycle, and process start/stop are appended to a JSONL file.

use regpoll_core::{CycleOutcome, WriteEvent};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Poller started
    SystemStart,
    /// Poller stopped
    SystemShutdown,
    /// Device accepted a register write
    WriteApplied,
    /// Register write failed or was refused
    WriteRejected,
    /// A cycle produced no usable data
    CycleFailed,
    /// Values are being served stale
    CycleDegraded,
    /// Fresh reads resumed after degradation or failure
    CycleRecovered,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic microseconds since process start
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    /// Additional event-specific details
    pub details: serde_json::Value,
}

/// Timestamps for audit entries.
#[derive(Debug, Clone, Copy)]
pub struct AuditClock {
    start: Instant,
}

impl AuditClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn unix_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

impl Default for AuditClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
    clock: AuditClock,
}

impl AuditLogger {
    /// Opens `path` in append mode, creating parent directories.
    pub fn new(path: &Path, clock: AuditClock) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
            clock,
        })
    }

    pub fn log(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Stamps and logs an event.
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&AuditEntry {
            timestamp_us: self.clock.now_us(),
            unix_us: self.clock.unix_us(),
            event_type,
            details,
        })
    }

    fn record(&self, event_type: AuditEventType, details: serde_json::Value) {
        if let Err(e) = self.log_event(event_type, details) {
            warn!(error = %e, ?event_type, "Failed to write audit entry");
        }
    }
}

/// Coarse health of the published data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Pending,
    Healthy,
    Degraded,
    Failed,
}

impl Health {
    pub fn of(outcome: Option<&CycleOutcome>) -> Self {
        match outcome {
            None => Health::Pending,
            Some(CycleOutcome::Success { .. }) => Health::Healthy,
            Some(CycleOutcome::Partial { .. }) => Health::Degraded,
            Some(CycleOutcome::Failed(_)) => Health::Failed,
        }
    }

    /// Audit event for moving from `self` to `next`, if any.
    pub fn transition(self, next: Health) -> Option<AuditEventType> {
        match (self, next) {
            (prev, next) if prev == next => None,
            (_, Health::Failed) => Some(AuditEventType::CycleFailed),
            (_, Health::Degraded) => Some(AuditEventType::CycleDegraded),
            (Health::Degraded | Health::Failed, Health::Healthy) => {
                Some(AuditEventType::CycleRecovered)
            }
            _ => None,
        }
    }
}

fn outcome_details(outcome: Option<&CycleOutcome>) -> serde_json::Value {
    match outcome {
        Some(CycleOutcome::Partial { stale, .. }) => serde_json::json!({
            "status": "partial",
            "stale": stale.iter().collect::<Vec<_>>(),
        }),
        Some(CycleOutcome::Failed(err)) => serde_json::json!({
            "status": "failed",
            "error": err.to_string(),
        }),
        Some(other) => serde_json::json!({ "status": other.status() }),
        None => serde_json::json!({ "status": "pending" }),
    }
}

fn write_details(event: &WriteEvent) -> (AuditEventType, serde_json::Value) {
    match &event.result {
        Ok(()) => (
            AuditEventType::WriteApplied,
            serde_json::json!({ "register": event.key, "value": event.value }),
        ),
        Err(err) => (
            AuditEventType::WriteRejected,
            serde_json::json!({
                "register": event.key,
                "value": event.value,
                "error": err.to_string(),
            }),
        ),
    }
}

/// Records write attempts and health transitions until `shutdown` fires.
pub async fn record_events(
    logger: Arc<AuditLogger>,
    mut outcomes: watch::Receiver<Option<CycleOutcome>>,
    mut writes: broadcast::Receiver<WriteEvent>,
    shutdown: CancellationToken,
) {
    let mut health = Health::of(outcomes.borrow_and_update().as_ref());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = outcomes.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = outcomes.borrow_and_update().clone();
                let next = Health::of(current.as_ref());
                if let Some(event_type) = health.transition(next) {
                    logger.record(event_type, outcome_details(current.as_ref()));
                }
                health = next;
            }
            event = writes.recv() => match event {
                Ok(event) => {
                    let (event_type, details) = write_details(&event);
                    logger.record(event_type, details);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Audit recorder missed write events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("Audit recorder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use regpoll_core::{ConnectionError, CycleFailed, Fault, Snapshot, WriteError};
    use std::collections::BTreeSet;
    use std::io::Read;
    use tempfile::tempdir;

    fn read_entries(path: &Path) -> Vec<AuditEntry> {
        let mut content = String::new();
        File::open(path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn success() -> CycleOutcome {
        CycleOutcome::Success {
            snapshot: [(3044, 10), (3066, 55)].into_iter().collect::<Snapshot>(),
        }
    }

    fn partial() -> CycleOutcome {
        CycleOutcome::Partial {
            snapshot: [(3044, 10), (3066, 55)].into_iter().collect::<Snapshot>(),
            stale: BTreeSet::from([3066]),
        }
    }

    fn failed() -> CycleOutcome {
        CycleOutcome::Failed(CycleFailed::Unreachable(ConnectionError {
            endpoint: "sim://device".to_string(),
            cause: Fault::Unreachable("connection refused".to_string()),
        }))
    }

    #[test]
    fn test_audit_logger_writes_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");

        let logger = AuditLogger::new(&path, AuditClock::new()).unwrap();
        logger
            .log_event(
                AuditEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();
        logger
            .log_event(
                AuditEventType::WriteApplied,
                serde_json::json!({"register": 3078, "value": 1}),
            )
            .unwrap();

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, AuditEventType::SystemStart);
        assert_eq!(entries[1].details["register"], 3078);
        assert!(entries[1].timestamp_us >= entries[0].timestamp_us);
        assert!(entries[0].unix_us > 0);
    }

    #[test]
    fn health_transitions() {
        use Health::*;
        assert_eq!(Pending.transition(Healthy), None);
        assert_eq!(Pending.transition(Failed), Some(AuditEventType::CycleFailed));
        assert_eq!(Healthy.transition(Degraded), Some(AuditEventType::CycleDegraded));
        assert_eq!(Degraded.transition(Degraded), None);
        assert_eq!(Degraded.transition(Healthy), Some(AuditEventType::CycleRecovered));
        assert_eq!(Failed.transition(Healthy), Some(AuditEventType::CycleRecovered));
        assert_eq!(Health::of(Some(&partial())), Degraded);
    }

    #[tokio::test]
    async fn recorder_logs_writes_and_transitions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = Arc::new(AuditLogger::new(&path, AuditClock::new()).unwrap());

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (write_tx, write_rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(record_events(
            Arc::clone(&logger),
            outcome_rx,
            write_rx,
            shutdown.clone(),
        ));

        outcome_tx.send_replace(Some(success()));
        tokio::task::yield_now().await;
        outcome_tx.send_replace(Some(failed()));
        tokio::task::yield_now().await;
        write_tx
            .send(WriteEvent {
                key: 3078,
                value: Some(1),
                result: Err(WriteError {
                    key: 3078,
                    cause: Fault::Unreachable("connection refused".to_string()),
                }),
            })
            .unwrap();
        tokio::task::yield_now().await;
        outcome_tx.send_replace(Some(success()));

        // Wait until the recovery entry lands, then stop.
        for _ in 0..100 {
            if read_entries(&path).len() >= 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        let kinds: Vec<_> = read_entries(&path).iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                AuditEventType::CycleFailed,
                AuditEventType::WriteRejected,
                AuditEventType::CycleRecovered,
            ]
        );
    }
}
