/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Topology initializer.
//!
//! Declares per-org request/DLQ/retry queues and per-agent response
//! topology up front so consumers never race their own declarations.
//! `--best-effort` tolerates an unreachable broker (store-only CI runs).

#![allow(clippy::module_name_repetitions)]

use std::process;

use clap::Parser;
use tracing::{error, info, warn};

use relayq_broker::{ensure_org_topology, ensure_response_topology, Broker};
use relayq_config::Config;

const SERVICE_NAME: &str = "init-topology";

const EXIT_CONFIG: i32 = 2;
const EXIT_BROKER: i32 = 3;

const TOPOLOGY_ATTEMPTS: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "relayq-init-topology", about = "Declare broker topology for orgs and agents")]
struct Args {
    /// Comma-separated org ids; defaults to the configured org list.
    #[arg(long, env = "ORG_IDS", value_delimiter = ',')]
    org_ids: Vec<String>,

    /// Comma-separated agent ids to pre-create response queues for.
    #[arg(long, env = "AGENT_IDS", value_delimiter = ',')]
    agent_ids: Vec<String>,

    /// Do not fail when the broker is unreachable.
    #[arg(long, env = "INIT_TOPOLOGY_BEST_EFFORT")]
    best_effort: bool,
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

    let org_ids = if args.org_ids.is_empty() {
        config.effective_org_ids()
    } else {
        args.org_ids.clone()
    };
    let agent_ids = if args.agent_ids.is_empty() {
        config.effective_agent_ids()
    } else {
        args.agent_ids.clone()
    };

    let broker = match Broker::connect(&config.broker).await {
        Ok(broker) => broker,
        Err(e) => {
            if args.best_effort {
                warn!(error = %e, "broker not reachable, skipping (best-effort)");
                return;
            }
            error!(error = %e, "broker connect failed");
            process::exit(EXIT_BROKER);
        }
    };

    for org_id in &org_ids {
        if let Err(e) = ensure_org_topology(&broker, org_id, TOPOLOGY_ATTEMPTS).await {
            if args.best_effort {
                warn!(org_id = %org_id, error = %e, "org declaration skipped (best-effort)");
                continue;
            }
            error!(org_id = %org_id, error = %e, "org declaration failed");
            process::exit(EXIT_BROKER);
        }
        for agent_id in &agent_ids {
            if let Err(e) =
                ensure_response_topology(&broker, org_id, agent_id, TOPOLOGY_ATTEMPTS).await
            {
                if args.best_effort {
                    warn!(agent_id = %agent_id, error = %e,
                          "agent declaration skipped (best-effort)");
                    continue;
                }
                error!(agent_id = %agent_id, error = %e, "agent declaration failed");
                process::exit(EXIT_BROKER);
            }
        }
    }

    info!(orgs = org_ids.len(), agents = agent_ids.len(), "topology declared");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_comma_lists() {
        let args = Args::try_parse_from([
            "relayq-init-topology",
            "--org-ids",
            "acme,globex",
            "--agent-ids",
            "a1,a2,a3",
            "--best-effort",
        ])
        .unwrap();
        assert_eq!(args.org_ids, vec!["acme", "globex"]);
        assert_eq!(args.agent_ids, vec!["a1", "a2", "a3"]);
        assert!(args.best_effort);
    }

    #[test]
    fn test_args_default_to_empty_lists() {
        let args = Args::try_parse_from(["relayq-init-topology"]).unwrap();
        assert!(args.org_ids.is_empty());
        assert!(args.agent_ids.is_empty());
        assert!(!args.best_effort);
    }
}
