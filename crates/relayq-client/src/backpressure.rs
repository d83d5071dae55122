/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Backpressure controller: samples per-org queue depth and derives the
//! tiered throttle stage producers consult before publishing.
//!
//! Worker scaling itself happens outside the process (the autoscaler
//! watches the `backpressure_desired_workers` gauge); this controller
//! owns the decision, the cooldown between scale signals, and the
//! emergency alerting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lapin::Channel;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use relayq_broker::queue_depth;
use relayq_config::BackpressureConfig;
use relayq_protocol::{decide_stage, BackpressureThresholds, ThrottleStage};

struct OrgState {
    stage: ThrottleStage,
    desired_workers: u32,
    last_scale_signal: Option<Instant>,
}

pub struct BackpressureController {
    thresholds: BackpressureThresholds,
    scale_increment: u32,
    max_workers: u32,
    scale_cooldown: Duration,
    orgs: Mutex<HashMap<String, OrgState>>,
}

impl BackpressureController {
    #[must_use]
    pub fn new(config: &BackpressureConfig) -> BackpressureController {
        BackpressureController {
            thresholds: BackpressureThresholds {
                scale: config.scale_threshold,
                limit_p3: config.light_throttle_threshold,
                limit_p2: config.heavy_throttle_threshold,
                emergency: config.emergency_threshold,
            },
            scale_increment: config.scale_increment,
            max_workers: config.max_workers,
            scale_cooldown: Duration::from_secs(config.scale_cooldown_secs),
            orgs: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one depth observation for an org; returns the derived stage.
    pub fn observe(&self, org_id: &str, depth: u64) -> ThrottleStage {
        let stage = decide_stage(depth, &self.thresholds);
        metrics::gauge!("queue_depth", "org_id" => org_id.to_string()).set(depth as f64);
        metrics::gauge!("backpressure_stage", "org_id" => org_id.to_string())
            .set(f64::from(stage.as_u8()));

        let Ok(mut orgs) = self.orgs.lock() else {
            return stage;
        };
        let state = orgs.entry(org_id.to_string()).or_insert(OrgState {
            stage: ThrottleStage::Normal,
            desired_workers: 1,
            last_scale_signal: None,
        });

        if stage >= ThrottleStage::Scale && state.desired_workers < self.max_workers {
            let cooled_down = state
                .last_scale_signal
                .is_none_or(|at| at.elapsed() >= self.scale_cooldown);
            if cooled_down {
                state.desired_workers =
                    (state.desired_workers + self.scale_increment).min(self.max_workers);
                state.last_scale_signal = Some(Instant::now());
                info!(
                    org_id,
                    depth,
                    desired_workers = state.desired_workers,
                    "scale signal emitted"
                );
            }
        } else if stage == ThrottleStage::Normal {
            state.desired_workers = 1;
        }
        metrics::gauge!("backpressure_desired_workers", "org_id" => org_id.to_string())
            .set(f64::from(state.desired_workers));

        if stage == ThrottleStage::Emergency && state.stage != ThrottleStage::Emergency {
            metrics::counter!("backpressure_emergency_total", "org_id" => org_id.to_string())
                .increment(1);
            warn!(org_id, depth, "queue depth crossed emergency threshold, rejecting non-P0");
        }
        state.stage = stage;
        stage
    }

    /// Current stage for an org; `Normal` until the first observation.
    #[must_use]
    pub fn stage(&self, org_id: &str) -> ThrottleStage {
        self.orgs
            .lock()
            .ok()
            .and_then(|orgs| orgs.get(org_id).map(|s| s.stage))
            .unwrap_or(ThrottleStage::Normal)
    }

    /// The worker count currently signalled to the autoscaler for an org.
    #[must_use]
    pub fn desired_workers(&self, org_id: &str) -> u32 {
        self.orgs
            .lock()
            .ok()
            .and_then(|orgs| orgs.get(org_id).map(|s| s.desired_workers))
            .unwrap_or(1)
    }
}

/// Sample queue depth for each org on an interval and feed the controller.
/// Probe failures leave the previous stage in place rather than flapping
/// to Normal.
pub fn spawn_depth_sampler(
    channel: Channel,
    org_ids: Vec<String>,
    controller: std::sync::Arc<BackpressureController>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for org_id in &org_ids {
                        match queue_depth(&channel, org_id).await {
                            Ok(depth) => {
                                controller.observe(org_id, depth);
                            }
                            Err(e) => {
                                warn!(org_id = %org_id, error = %e, "queue depth probe failed");
                            }
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("depth sampler stopped");
    })
}
