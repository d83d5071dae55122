/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Batched, ordered, append-only writer for audit records.
//!
//! All lifecycle bookkeeping funnels through one writer task per process:
//! records buffer until 100 are pending or 1 s has passed, then flush as a
//! single transaction in arrival order. A failed flush retries with bounded
//! exponential backoff and never reorders; once the retry budget is spent
//! the writer degrades by dropping buffered non-terminal records, but
//! `completed`/`dead_letter` records are held until they reach the store;
//! workers gate their broker acks on [`AuditHandle::flush`].

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relayq_config::AuditConfig;
use relayq_runtime::Backoff;

use crate::{apply_dlq, apply_event, apply_message, AuditRecord, RedactionLevel, Redactor, Store, StoreError};

enum Command {
    Record(AuditRecord),
    Flush(oneshot::Sender<Result<(), StoreError>>),
}

/// Cloneable handle for emitting audit records into the writer task.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<Command>,
    redactor: std::sync::Arc<Redactor>,
}

impl AuditHandle {
    /// Emit one record. Redaction is applied here, at emission time, so
    /// raw payloads never sit in the writer's buffer. Best-effort: if the
    /// writer is gone the record is dropped with a warning.
    pub async fn record(&self, mut record: AuditRecord) {
        self.redactor.apply(&mut record);
        if self.tx.send(Command::Record(record)).await.is_err() {
            warn!("audit writer unavailable, dropping record");
        }
    }

    /// Force a flush and wait for the buffered records to be durably
    /// stored. Terminal transitions call this before acking the broker.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the flush could not complete within the
    /// writer's retry budget; callers should withhold their ack so the
    /// delivery redelivers.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(reply_tx)).await.is_err() {
            return Err(StoreError::Unavailable("audit writer stopped".to_string()));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(StoreError::Unavailable("audit writer stopped".to_string())))
    }
}

/// Spawn the writer task. The handle is cheap to clone across components;
/// dropping every handle drains the buffer and stops the task.
#[must_use]
pub fn spawn_writer(store: Store, config: &AuditConfig) -> (AuditHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let redactor = Redactor::new(
        RedactionLevel::parse(&config.redaction_level),
        &config.redaction_patterns,
    );
    let writer = Writer {
        store,
        batch_size: config.batch_size,
        flush_interval: Duration::from_millis(config.flush_interval_ms),
        flush_attempts: config.flush_attempts,
        flush_base_delay: Duration::from_millis(config.flush_base_delay_ms),
    };
    let handle = tokio::spawn(writer.run(rx));
    (
        AuditHandle {
            tx,
            redactor: std::sync::Arc::new(redactor),
        },
        handle,
    )
}

struct Writer {
    store: Store,
    batch_size: usize,
    flush_interval: Duration,
    flush_attempts: u32,
    flush_base_delay: Duration,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let mut buffer: Vec<AuditRecord> = Vec::with_capacity(self.batch_size);
        let mut tick = tokio::time::interval(self.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Record(record)) => {
                        buffer.push(record);
                        if buffer.len() >= self.batch_size {
                            let _ = self.flush_buffer(&mut buffer).await;
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        let result = self.flush_buffer(&mut buffer).await;
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = self.flush_buffer(&mut buffer).await {
                            warn!(error = %e, pending = buffer.len(), "final audit flush failed");
                        }
                        break;
                    }
                },
                _ = tick.tick() => {
                    if !buffer.is_empty() {
                        let _ = self.flush_buffer(&mut buffer).await;
                    }
                }
            }
        }
        debug!("audit writer stopped");
    }

    /// Flush the buffer as one transaction, retrying with backoff. After
    /// the retry budget, non-terminal records are shed and the remaining
    /// terminal records get one more round; if that also fails the buffer
    /// is left intact (order preserved) and the error surfaces.
    async fn flush_buffer(&self, buffer: &mut Vec<AuditRecord>) -> Result<(), StoreError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let mut backoff = Backoff::new(self.flush_base_delay, Duration::from_secs(10));
        let mut degraded = false;
        let started = Instant::now();

        loop {
            match self.write_batch(buffer).await {
                Ok(()) => {
                    metrics::histogram!("audit_flush_size").record(buffer.len() as f64);
                    metrics::histogram!("audit_flush_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    buffer.clear();
                    return Ok(());
                }
                Err(e) => {
                    let attempt = backoff.attempt();
                    if attempt + 1 >= self.flush_attempts {
                        if degraded {
                            warn!(error = %e, pending = buffer.len(),
                                  "audit flush failed after degrading; keeping terminal records buffered");
                            return Err(e);
                        }
                        let dropped = shed_non_terminal(buffer);
                        if dropped > 0 {
                            metrics::counter!("audit_dropped_total").increment(dropped as u64);
                            warn!(dropped, "audit store degraded, shed non-terminal records");
                        }
                        if buffer.is_empty() {
                            return Err(e);
                        }
                        degraded = true;
                        backoff.reset();
                    }
                    let delay = backoff.next_delay_jittered();
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64,
                          "audit flush failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn write_batch(&self, records: &[AuditRecord]) -> Result<(), StoreError> {
        let mut tx = self.store.pool().begin().await?;
        for record in records {
            match record {
                AuditRecord::Message(m) => apply_message(&mut *tx, m).await?,
                AuditRecord::Event(e) => apply_event(&mut *tx, e).await?,
                AuditRecord::Dlq(d) => apply_dlq(&mut *tx, d).await?,
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Drop every non-terminal record from the buffer, preserving the relative
/// order of what remains. Returns how many records were shed.
fn shed_non_terminal(buffer: &mut Vec<AuditRecord>) -> usize {
    let before = buffer.len();
    buffer.retain(AuditRecord::is_terminal);
    before - buffer.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{DlqRecord, MessageEventRecord};
    use relayq_protocol::event;
    use serde_json::Value;

    fn event_record(event_type: &str) -> AuditRecord {
        AuditRecord::Event(MessageEventRecord {
            message_id: Some("m-1".to_string()),
            org_id: "acme".to_string(),
            event_type: event_type.to_string(),
            details: None,
        })
    }

    #[test]
    fn test_shed_keeps_terminal_records_in_order() {
        let mut buffer = vec![
            event_record(event::DEQUEUED),
            event_record(event::COMPLETED),
            event_record(event::PROCESSING),
            AuditRecord::Dlq(DlqRecord {
                org_id: "acme".to_string(),
                original_message: Value::Null,
                error_history: Value::Null,
                can_replay: true,
            }),
            event_record(event::FAILED),
        ];
        let dropped = shed_non_terminal(&mut buffer);
        assert_eq!(dropped, 3);
        assert_eq!(buffer.len(), 2);
        assert!(matches!(&buffer[0], AuditRecord::Event(e) if e.event_type == event::COMPLETED));
        assert!(matches!(&buffer[1], AuditRecord::Dlq(_)));
    }

    #[test]
    fn test_shed_empty_buffer() {
        let mut buffer: Vec<AuditRecord> = Vec::new();
        assert_eq!(shed_non_terminal(&mut buffer), 0);
        assert!(buffer.is_empty());
    }
}
