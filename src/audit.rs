//! C2: AuditLog — append-only, structured event sink (`spec.md` §4.2).
//!
//! `emit` never fails the caller: transport (Store write) errors are
//! retried in-process against a bounded queue and dropped with a counter
//! increment if the queue saturates. Ordering is per-process FIFO only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::models::{Actor, AuditEvent};
use crate::domain::ports::Store;

const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const MAX_WRITE_RETRIES: u32 = 3;

/// Append-only audit sink. Holds a bounded channel to a background writer
/// task so `emit` is synchronous-looking but never blocks the caller on a
/// Store write.
pub struct AuditLog {
    sender: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
}

impl AuditLog {
    /// Spawns the background writer and returns the handle plus its
    /// `JoinHandle` (owned by the caller's lifecycle object).
    #[must_use]
    pub fn spawn(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(DEFAULT_QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_counter = dropped.clone();

        let handle = tokio::spawn(async move {
            let _ = &clock;
            while let Some(event) = rx.recv().await {
                let mut attempt = 0;
                loop {
                    match store.append_audit_event(&event).await {
                        Ok(()) => break,
                        Err(err) if attempt < MAX_WRITE_RETRIES => {
                            attempt += 1;
                            tracing::warn!(error = %err, attempt, "audit write failed, retrying");
                        }
                        Err(err) => {
                            dropped_counter.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(error = %err, "audit event dropped after exhausting retries");
                            break;
                        }
                    }
                }
            }
        });

        (Self { sender: tx, dropped }, handle)
    }

    /// Records a decision. Never returns an error to the caller; queue
    /// saturation increments the dropped counter instead of blocking.
    pub fn emit(&self, actor: Actor, event_kind: impl Into<String>, subject_id: Option<Uuid>, payload: Value, now: chrono::DateTime<chrono::Utc>) {
        let event = AuditEvent::new(actor, event_kind, subject_id, payload, now);
        if self.sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("audit queue saturated, event dropped");
        }
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::sqlite::create_migrated_test_pool;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn emit_is_non_blocking_and_eventually_persists() {
        let pool = create_migrated_test_pool().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let (log, handle) = AuditLog::spawn(store.clone(), Arc::new(SystemClock));

        log.emit(Actor::System, "goal_identified", None, serde_json::json!({"a": 1}), chrono::Utc::now());
        drop(log);
        handle.await.unwrap();
    }
}
