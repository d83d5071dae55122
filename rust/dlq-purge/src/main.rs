/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Retention cleanup, intended to run as a cron job: deletes DLQ rows past
//! the retention window and, with `--idempotency`, expired idempotency
//! keys so those tables stay small.

#![allow(clippy::module_name_repetitions)]

use std::process;

use clap::Parser;
use tracing::{error, info};

use relayq_config::Config;
use relayq_store::Store;

const SERVICE_NAME: &str = "dlq-purge";

const EXIT_CONFIG: i32 = 2;
const EXIT_STORE: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "relayq-dlq-purge", about = "Purge old DLQ rows by retention policy")]
struct Args {
    /// Purge only this organization's rows.
    #[arg(long)]
    org_id: Option<String>,

    /// Retention window in days; defaults to the configured policy.
    #[arg(long = "older-than")]
    older_than_days: Option<u32>,

    /// Also purge idempotency keys past their TTL.
    #[arg(long)]
    idempotency: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(EXIT_CONFIG);
    });

    let _telemetry_guard = relayq_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });

    let store = match Store::connect(&config.event_store).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "event store connect failed");
            process::exit(EXIT_STORE);
        }
    };

    let retention_days = args.older_than_days.unwrap_or(config.dlq.retention_days);
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));

    match store.purge_dlq_older_than(args.org_id.as_deref(), cutoff).await {
        Ok(deleted) => {
            if let Some(ref org_id) = args.org_id {
                metrics::counter!("dlq_purge_total", "org_id" => org_id.clone())
                    .increment(deleted);
            }
            info!(deleted, cutoff = %cutoff, org_id = args.org_id.as_deref().unwrap_or("*"),
                  "DLQ rows purged");
        }
        Err(e) => {
            error!(error = %e, "DLQ purge failed");
            process::exit(EXIT_STORE);
        }
    }

    if args.idempotency {
        let ttl_days = config.event_store.idempotency_ttl_days;
        let key_cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(ttl_days));
        match store.purge_idempotency_older_than(key_cutoff).await {
            Ok(deleted) => info!(deleted, cutoff = %key_cutoff, "idempotency keys purged"),
            Err(e) => {
                error!(error = %e, "idempotency purge failed");
                process::exit(EXIT_STORE);
            }
        }
    }
}
