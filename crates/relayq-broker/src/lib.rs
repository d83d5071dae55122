/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! AMQP plumbing: robust connections, idempotent topology declaration, and
//! publish helpers for requests, responses, retries, and dead letters.
//!
//! The broker contract relayq relies on: durable queues with native
//! priorities (`x-max-priority`), persistent delivery, publisher confirms,
//! per-queue TTL with dead-letter re-routing (the retry ladder), and
//! passive declares for depth probes. TLS is selected purely by the URL
//! scheme (`amqp` vs `amqps`); client-auth material is optional config.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod publish;
mod topology;

pub use publish::{
    headers_table, publish_dlq, publish_request, publish_response, queue_depth,
    response_queue_depth, schedule_retry,
};
pub use topology::{
    agent_response_queue, declare_org_topology, declare_response_topology, dlq_queue,
    ensure_org_topology, ensure_response_topology, request_queue, response_exchange, retry_bucket,
    retry_queue, TopologyError, RETRY_LADDER_MS,
};

use std::time::Duration;

use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::{Channel, Connection, ConnectionProperties};
use relayq_config::BrokerConfig;
use relayq_runtime::Backoff;
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("broker unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: lapin::Error,
    },
    #[error("broker did not confirm publish")]
    NotConfirmed,
    #[error("broker tls material unreadable: {0}")]
    Tls(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One broker connection per process. Channels are cheap; connections are
/// not, so every component in a service shares this handle.
pub struct Broker {
    connection: Connection,
}

impl Broker {
    /// Connect with bounded exponential backoff. The broker may not be up
    /// yet when a service boots in CI or during a rolling deploy; a retry
    /// loop here keeps topology init and consumers from flapping.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unreachable`] once the attempt budget is
    /// spent, or [`BrokerError::Tls`] for unreadable client-auth material.
    pub async fn connect(config: &BrokerConfig) -> Result<Broker, BrokerError> {
        let mut backoff = Backoff::new(
            Duration::from_millis(config.connect_base_delay_ms),
            Duration::from_millis(config.connect_max_delay_ms),
        );

        let mut last_err: Option<lapin::Error> = None;
        for attempt in 1..=config.connect_attempts {
            let result = match load_tls_config(config)? {
                Some(tls_config) => {
                    Connection::connect_with_config(
                        &config.url,
                        ConnectionProperties::default(),
                        tls_config,
                    )
                    .await
                }
                None => Connection::connect(&config.url, ConnectionProperties::default()).await,
            };
            match result {
                Ok(connection) => {
                    info!(attempt, "broker connected");
                    return Ok(Broker { connection });
                }
                Err(e) => {
                    let delay = backoff.next_delay_jittered();
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64,
                          "broker connect failed, backing off");
                    last_err = Some(e);
                    if attempt < config.connect_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(BrokerError::Unreachable {
            attempts: config.connect_attempts,
            source: last_err.unwrap_or(lapin::Error::InvalidConnectionState(
                lapin::ConnectionState::Error,
            )),
        })
    }

    /// Open a plain channel (fire-and-forget publishes, consumers).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Amqp`] if the channel cannot be opened.
    pub async fn create_channel(&self) -> Result<Channel, BrokerError> {
        Ok(self.connection.create_channel().await?)
    }

    /// Open a channel with publisher confirms enabled (P1–P3 publishes).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Amqp`] if the channel cannot be opened or
    /// confirm mode cannot be selected.
    pub async fn create_confirmed_channel(&self) -> Result<Channel, BrokerError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(lapin::options::ConfirmSelectOptions::default())
            .await?;
        Ok(channel)
    }

    /// Whether the underlying connection is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

fn load_tls_config(config: &BrokerConfig) -> Result<Option<OwnedTLSConfig>, BrokerError> {
    let wants_custom_tls =
        config.ca_cert_path.is_some() || config.client_identity_path.is_some();
    if !wants_custom_tls {
        return Ok(None);
    }

    let cert_chain = match &config.ca_cert_path {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .map_err(|e| BrokerError::Tls(format!("ca bundle {path}: {e}")))?,
        ),
        None => None,
    };

    let identity = match &config.client_identity_path {
        Some(path) => {
            let der = std::fs::read(path)
                .map_err(|e| BrokerError::Tls(format!("client identity {path}: {e}")))?;
            Some(OwnedIdentity {
                der,
                password: config.client_identity_password.clone().unwrap_or_default(),
            })
        }
        None => None,
    };

    Ok(Some(OwnedTLSConfig {
        identity,
        cert_chain,
    }))
}
