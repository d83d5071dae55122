/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Promotion scheduler.
//!
//! A broker cannot re-prioritize a message already sitting in a queue, so
//! aged messages are promoted by re-publishing them one class higher and
//! updating their snapshot row. The worker's terminal-status replay gate
//! collapses whichever broker copy loses the race, which keeps promotion
//! inside the bus's at-least-once contract. Scans run oldest-first per
//! priority class, so promotion never reorders messages that started in
//! the same class.

#![allow(clippy::module_name_repetitions)]

use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use relayq_broker::{ensure_org_topology, publish_request, Broker, BrokerError};
use relayq_config::Config;
use relayq_protocol::{Priority, RequestMessage};
use relayq_store::{audit_promoted, spawn_writer, AuditHandle, QueuedMessage, Store, StoreError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SERVICE_NAME: &str = "promoter";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const TOPOLOGY_ATTEMPTS: u32 = 5;

const EXIT_CONFIG: i32 = 2;
const EXIT_BROKER: i32 = 3;
const EXIT_STORE: i32 = 4;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    fn exit_code(&self) -> i32 {
        match self {
            RelayError::Config(_) => EXIT_CONFIG,
            RelayError::Broker(_) => EXIT_BROKER,
            RelayError::Store(_) => EXIT_STORE,
        }
    }
}

// ---------------------------------------------------------------------------
// Promotion pass
// ---------------------------------------------------------------------------

struct AppState {
    config: Config,
    /// Holds the broker connection open for the channel below.
    _broker: Broker,
    store: Store,
    audit: AuditHandle,
    channel: lapin::Channel,
}

/// Promote one aged message: re-publish at the higher class, update the
/// snapshot row, and record the `promoted` event with the observed age.
async fn promote_message(
    state: &AppState,
    org_id: &str,
    queued: &QueuedMessage,
    from: Priority,
) -> Result<(), RelayError> {
    let mut msg: RequestMessage = match serde_json::from_value(queued.payload.clone()) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(message_id = %queued.message_id, error = %e,
                  "unparseable snapshot payload, skipping promotion");
            return Ok(());
        }
    };
    let to = from.promoted();
    msg.priority = to;

    publish_request(&state.channel, &msg, true).await?;
    state
        .store
        .set_message_priority(&queued.message_id, i32::from(to.as_u8()))
        .await?;

    let age_ms = (Utc::now() - queued.created_at).num_milliseconds();
    audit_promoted(&state.audit, &queued.message_id, org_id, from, to, age_ms).await;
    metrics::counter!(
        "promotion_total",
        "org_id" => org_id.to_string(),
        "from" => from.label(),
        "to" => to.label(),
    )
    .increment(1);
    info!(message_id = %queued.message_id, org_id,
          from = %from.label(), to = %to.label(), age_ms, "message promoted");
    Ok(())
}

/// One scan over every org and promotable class (P3, P2, P1; P0 has
/// nowhere to go). Oldest messages first within each class.
async fn promotion_pass(state: &AppState) -> Result<u32, RelayError> {
    let mut promoted = 0u32;
    let now = Utc::now();
    for org_id in state.config.effective_org_ids() {
        for from_value in [3u8, 2, 1] {
            let from = match Priority::new(from_value) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let threshold = state
                .config
                .promotion
                .age_threshold_secs(&org_id, from_value);
            let cutoff = now - chrono::Duration::seconds(threshold as i64);
            let batch = state
                .store
                .queued_older_than(
                    &org_id,
                    i32::from(from_value),
                    cutoff,
                    state.config.promotion.batch_limit,
                )
                .await?;
            for queued in &batch {
                if let Err(e) = promote_message(state, &org_id, queued, from).await {
                    warn!(message_id = %queued.message_id, error = %e, "promotion failed");
                    continue;
                }
                promoted += 1;
            }
        }
    }
    Ok(promoted)
}

async fn promotion_loop(state: Arc<AppState>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = Duration::from_millis(state.config.promotion.interval_ms);
    let mut tick = tokio::time::interval(interval);
    info!(interval_ms = state.config.promotion.interval_ms, "promotion loop started");
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match promotion_pass(&state).await {
                    Ok(count) if count > 0 => info!(count, "promotion pass complete"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "promotion pass failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
    info!("promotion loop stopped");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

async fn init_state(config: Config) -> Result<(AppState, tokio::task::JoinHandle<()>), RelayError> {
    let broker = Broker::connect(&config.broker).await?;
    let store = Store::connect(&config.event_store).await?;
    let (audit, audit_task) = spawn_writer(store.clone(), &config.audit);
    for org_id in config.effective_org_ids() {
        ensure_org_topology(&broker, &org_id, TOPOLOGY_ATTEMPTS).await?;
    }
    let channel = broker.create_confirmed_channel().await?;
    Ok((
        AppState {
            config,
            channel,
            _broker: broker,
            store,
            audit,
        },
        audit_task,
    ))
}

#[tokio::main]
async fn main() {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(EXIT_CONFIG);
    });

    let _telemetry_guard = relayq_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });
    if let Err(e) = relayq_telemetry::init_metrics(&config.metrics) {
        error!(error = %e, "metrics exporter init failed, continuing without /metrics");
    }

    info!(service = SERVICE_NAME, version = SERVICE_VERSION, "starting promoter");

    let (state, audit_task) = match init_state(config).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise promoter");
            process::exit(e.exit_code());
        }
    };
    let state = Arc::new(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_state = Arc::clone(&state);
    let loop_handle = tokio::spawn(async move {
        promotion_loop(loop_state, shutdown_rx).await;
    });

    relayq_runtime::shutdown_signal().await;
    info!("initiating graceful shutdown");
    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "promotion loop panicked");
    }
    if let Err(e) = state.audit.flush().await {
        warn!(error = %e, "final audit flush failed");
    }
    drop(state);
    let _ = audit_task.await;
    info!("promoter shutdown complete");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relayq_config::PromotionConfig;

    #[test]
    fn test_default_thresholds_by_class() {
        let promotion = PromotionConfig::default();
        assert_eq!(promotion.age_threshold_secs("acme", 3), 30, "P3 -> P2 after 30s");
        assert_eq!(promotion.age_threshold_secs("acme", 2), 15, "P2 -> P1 after 15s");
        assert_eq!(promotion.age_threshold_secs("acme", 1), 5, "P1 -> P0 after 5s");
    }

    #[test]
    fn test_promotion_targets_one_class_up() {
        assert_eq!(Priority::P3.promoted(), Priority::P2);
        assert_eq!(Priority::P2.promoted(), Priority::P1);
        assert_eq!(Priority::P1.promoted(), Priority::P0);
        // P0 never appears in the scan set, but the helper is saturating.
        assert_eq!(Priority::P0.promoted(), Priority::P0);
    }

    #[test]
    fn test_scan_covers_only_promotable_classes() {
        // The pass iterates 3, 2, 1 and never 0.
        let classes = [3u8, 2, 1];
        assert!(!classes.contains(&0));
        for value in classes {
            assert!(Priority::new(value).is_ok());
        }
    }
}
