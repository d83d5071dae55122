/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Tiered backpressure decision based on per-org queue depth.
//!
//! The controller samples depth and derives a stage; the producer consults
//! the stage before publishing. P0 traffic is never rejected by
//! backpressure, only ever slowed by the broker itself.

use serde::{Deserialize, Serialize};

use crate::message::Priority;

/// Depth thresholds for the tiered response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackpressureThresholds {
    pub scale: u64,
    pub limit_p3: u64,
    pub limit_p2: u64,
    pub emergency: u64,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        BackpressureThresholds {
            scale: 100,
            limit_p3: 500,
            limit_p2: 1_000,
            emergency: 5_000,
        }
    }
}

/// Backpressure stage, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThrottleStage {
    /// Depth below every threshold.
    Normal,
    /// Signal the autoscaler to add workers.
    Scale,
    /// Also rate-limit P3 publishes.
    LimitP3,
    /// Also rate-limit P2 publishes.
    LimitP2P3,
    /// Reject all non-P0 publishes.
    Emergency,
}

impl ThrottleStage {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            ThrottleStage::Normal => 0,
            ThrottleStage::Scale => 1,
            ThrottleStage::LimitP3 => 2,
            ThrottleStage::LimitP2P3 => 3,
            ThrottleStage::Emergency => 4,
        }
    }

    /// Whether publishes at `priority` must pass the rate limiter first.
    #[must_use]
    pub fn rate_limits(self, priority: Priority) -> bool {
        match self {
            ThrottleStage::Normal | ThrottleStage::Scale => false,
            ThrottleStage::LimitP3 => priority == Priority::P3,
            ThrottleStage::LimitP2P3 | ThrottleStage::Emergency => priority >= Priority::P2,
        }
    }

    /// Whether publishes at `priority` are rejected outright.
    #[must_use]
    pub fn rejects(self, priority: Priority) -> bool {
        self == ThrottleStage::Emergency && priority != Priority::P0
    }
}

/// Derive the stage for an observed queue depth.
#[must_use]
pub fn decide_stage(depth: u64, thresholds: &BackpressureThresholds) -> ThrottleStage {
    if depth >= thresholds.emergency {
        ThrottleStage::Emergency
    } else if depth >= thresholds.limit_p2 {
        ThrottleStage::LimitP2P3
    } else if depth >= thresholds.limit_p3 {
        ThrottleStage::LimitP3
    } else if depth >= thresholds.scale {
        ThrottleStage::Scale
    } else {
        ThrottleStage::Normal
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_boundaries_are_inclusive() {
        let t = BackpressureThresholds::default();
        assert_eq!(decide_stage(0, &t), ThrottleStage::Normal);
        assert_eq!(decide_stage(99, &t), ThrottleStage::Normal);
        assert_eq!(decide_stage(100, &t), ThrottleStage::Scale);
        assert_eq!(decide_stage(499, &t), ThrottleStage::Scale);
        assert_eq!(decide_stage(500, &t), ThrottleStage::LimitP3);
        assert_eq!(decide_stage(999, &t), ThrottleStage::LimitP3);
        assert_eq!(decide_stage(1_000, &t), ThrottleStage::LimitP2P3);
        assert_eq!(decide_stage(4_999, &t), ThrottleStage::LimitP2P3);
        assert_eq!(decide_stage(5_000, &t), ThrottleStage::Emergency);
        assert_eq!(decide_stage(50_000, &t), ThrottleStage::Emergency);
    }

    #[test]
    fn test_emergency_rejects_everything_but_p0() {
        let stage = ThrottleStage::Emergency;
        assert!(!stage.rejects(Priority::P0));
        assert!(stage.rejects(Priority::P1));
        assert!(stage.rejects(Priority::P2));
        assert!(stage.rejects(Priority::P3));
    }

    #[test]
    fn test_lower_stages_never_reject() {
        for stage in [
            ThrottleStage::Normal,
            ThrottleStage::Scale,
            ThrottleStage::LimitP3,
            ThrottleStage::LimitP2P3,
        ] {
            for p in [Priority::P0, Priority::P1, Priority::P2, Priority::P3] {
                assert!(!stage.rejects(p));
            }
        }
    }

    #[test]
    fn test_rate_limit_tiers() {
        assert!(!ThrottleStage::Scale.rate_limits(Priority::P3));
        assert!(ThrottleStage::LimitP3.rate_limits(Priority::P3));
        assert!(!ThrottleStage::LimitP3.rate_limits(Priority::P2));
        assert!(ThrottleStage::LimitP2P3.rate_limits(Priority::P2));
        assert!(ThrottleStage::LimitP2P3.rate_limits(Priority::P3));
        assert!(!ThrottleStage::LimitP2P3.rate_limits(Priority::P1));
        assert!(!ThrottleStage::Emergency.rate_limits(Priority::P0));
    }

    #[test]
    fn test_stage_ordering() {
        assert!(ThrottleStage::Normal < ThrottleStage::Scale);
        assert!(ThrottleStage::LimitP2P3 < ThrottleStage::Emergency);
        assert_eq!(ThrottleStage::Emergency.as_u8(), 4);
    }
}
