//! UDP reliability check: decides whether datagrams currently get through.
//!
//! # How the check works (for beginners)
//!
//! UDP gives no delivery guarantee, and firewalls or NATs may silently eat
//! datagrams in one direction.  Rather than trusting UDP blindly, each
//! connection runs a small probe cycle:
//!
//! ```text
//!  begin_check ──► send UdpPing(counter) ──► arm ping timer (0.5 s)
//!       ▲                                        │
//!       │            UdpReceived(counter) ◄──────┤ on_ack   → Verified, recheck in 30 s
//!       │                                        │
//!       └──────────── retry after backoff ◄──────┘ on_timeout → Failed, backoff × 1.5
//! ```
//!
//! While healthy the link is re-verified every 30 seconds.  While failing,
//! retries start at 1 s and grow by 1.5× per failure up to a 30 s ceiling.
//!
//! This type only tracks state and computes delays.  Sending probes and
//! arming timers is the connection manager's job; it hands back the
//! [`PingPlan::token`] when a timer fires so stale timers can be ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tunables for the reliability check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// How long to wait for a `UdpReceived` before declaring a probe lost.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Interval between checks while the link is verified.
    #[serde(default = "default_healthy_interval_secs")]
    pub healthy_interval_secs: u64,
    /// First retry delay after a failure, and the value success resets to.
    #[serde(default = "default_min_backoff_secs")]
    pub min_backoff_secs: f64,
    /// Ceiling for the retry delay.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: f64,
    /// Growth factor applied to the retry delay after each failure.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_ping_timeout_ms() -> u64 {
    500
}
fn default_healthy_interval_secs() -> u64 {
    30
}
fn default_min_backoff_secs() -> f64 {
    1.0
}
fn default_max_backoff_secs() -> f64 {
    30.0
}
fn default_backoff_factor() -> f64 {
    1.5
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: default_ping_timeout_ms(),
            healthy_interval_secs: default_healthy_interval_secs(),
            min_backoff_secs: default_min_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl ReliabilityConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn healthy_interval(&self) -> Duration {
        Duration::from_secs(self.healthy_interval_secs)
    }

    /// Checks that every delay the state machine can derive from these
    /// values is a representable, non-shrinking [`Duration`].
    ///
    /// # Errors
    ///
    /// Returns the first offending field as an [`InvalidReliabilityConfig`].
    pub fn validate(&self) -> Result<(), InvalidReliabilityConfig> {
        if self.ping_timeout_ms == 0 {
            return Err(InvalidReliabilityConfig::ZeroPingTimeout);
        }
        if self.healthy_interval_secs == 0 {
            return Err(InvalidReliabilityConfig::ZeroHealthyInterval);
        }
        for (field, value) in [
            ("min_backoff_secs", self.min_backoff_secs),
            ("max_backoff_secs", self.max_backoff_secs),
        ] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(InvalidReliabilityConfig::NotADuration { field, value });
            }
        }
        if self.min_backoff_secs <= 0.0 {
            return Err(InvalidReliabilityConfig::NonPositiveMinBackoff(self.min_backoff_secs));
        }
        if self.max_backoff_secs < self.min_backoff_secs {
            return Err(InvalidReliabilityConfig::MaxBelowMin {
                min: self.min_backoff_secs,
                max: self.max_backoff_secs,
            });
        }
        // NaN fails this comparison as well.
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(InvalidReliabilityConfig::ShrinkingBackoff(self.backoff_factor));
        }
        Ok(())
    }
}

/// A [`ReliabilityConfig`] that would stall the check or panic its timers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvalidReliabilityConfig {
    #[error("ping_timeout_ms must be greater than zero")]
    ZeroPingTimeout,

    #[error("healthy_interval_secs must be greater than zero")]
    ZeroHealthyInterval,

    /// Negative, NaN, infinite, or too large for a `Duration`.
    #[error("{field} = {value} is not a valid number of seconds")]
    NotADuration { field: &'static str, value: f64 },

    #[error("min_backoff_secs must be greater than zero, got {0}")]
    NonPositiveMinBackoff(f64),

    #[error("max_backoff_secs ({max}) is below min_backoff_secs ({min})")]
    MaxBelowMin { min: f64, max: f64 },

    #[error("backoff_factor must be a finite number of at least 1, got {0}")]
    ShrinkingBackoff(f64),
}

/// What the manager must do to start a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPlan {
    /// Value to send in `UdpPing`.
    pub counter: u32,
    /// Identifies this probe's timer; pass it back to
    /// [`UdpReliability::on_timeout`].
    pub token: u64,
    /// How long to wait for the matching `UdpReceived`.
    pub timeout: Duration,
}

/// Result of a finished check and when the next one should start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckOutcome {
    /// The probe was acknowledged; the link is verified.
    Verified { next_check: Duration },
    /// The probe timed out; the link is unverified.
    Failed { retry_after: Duration },
}

/// Per-connection reliability-check state.
#[derive(Debug, Clone)]
pub struct UdpReliability {
    config: ReliabilityConfig,
    ping_counter: u32,
    backoff_secs: f64,
    verified: bool,
    in_flight: Option<u64>,
    next_token: u64,
}

impl UdpReliability {
    pub fn new(config: ReliabilityConfig) -> Self {
        let backoff_secs = config.min_backoff_secs;
        Self {
            config,
            ping_counter: 0,
            backoff_secs,
            verified: false,
            in_flight: None,
            next_token: 0,
        }
    }

    /// `true` only after a ping round-trip has succeeded since the last
    /// invalidation or failure.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn ping_counter(&self) -> u32 {
        self.ping_counter
    }

    /// Current retry delay used after the next failure.
    pub fn backoff(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_secs)
    }

    /// `true` while a probe is awaiting its acknowledgement.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Marks the link unverified, e.g. after the peer re-announced its UDP info.
    pub fn invalidate(&mut self) {
        self.verified = false;
    }

    /// Starts a new check, superseding any outstanding one.
    pub fn begin_check(&mut self) -> PingPlan {
        self.ping_counter = self.ping_counter.wrapping_add(1);
        self.next_token = self.next_token.wrapping_add(1);
        self.in_flight = Some(self.next_token);
        PingPlan {
            counter: self.ping_counter,
            token: self.next_token,
            timeout: self.config.ping_timeout(),
        }
    }

    /// Handles a `UdpReceived(counter)`.
    ///
    /// Returns `None` for stale or unsolicited acknowledgements.
    pub fn on_ack(&mut self, counter: u32) -> Option<CheckOutcome> {
        if self.in_flight.is_none() || counter != self.ping_counter {
            return None;
        }
        self.in_flight = None;
        self.verified = true;
        self.backoff_secs = self.config.min_backoff_secs;
        Some(CheckOutcome::Verified {
            next_check: self.config.healthy_interval(),
        })
    }

    /// Handles the expiry of the timer armed for probe `token`.
    ///
    /// Returns `None` if that probe is no longer the outstanding one.
    pub fn on_timeout(&mut self, token: u64) -> Option<CheckOutcome> {
        if self.in_flight != Some(token) {
            return None;
        }
        self.in_flight = None;
        self.verified = false;
        // A late ack for the lost probe must not count as a success.
        self.ping_counter = self.ping_counter.wrapping_add(1);
        let retry_after = Duration::from_secs_f64(self.backoff_secs);
        self.backoff_secs =
            (self.backoff_secs * self.config.backoff_factor).min(self.config.max_backoff_secs);
        Some(CheckOutcome::Failed { retry_after })
    }
}

impl Default for UdpReliability {
    fn default() -> Self {
        Self::new(ReliabilityConfig::default())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_link_is_unverified_with_one_second_backoff() {
        let rel = UdpReliability::default();
        assert!(!rel.is_verified());
        assert_eq!(rel.backoff(), Duration::from_secs(1));
        assert!(!rel.is_in_flight());
    }

    #[test]
    fn test_begin_check_increments_counter_and_uses_half_second_timeout() {
        // Arrange
        let mut rel = UdpReliability::default();

        // Act
        let first = rel.begin_check();
        let second = rel.begin_check();

        // Assert
        assert_eq!(first.counter, 1);
        assert_eq!(second.counter, 2);
        assert_ne!(first.token, second.token);
        assert_eq!(first.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_matching_ack_verifies_and_schedules_thirty_second_recheck() {
        // Arrange
        let mut rel = UdpReliability::default();
        let plan = rel.begin_check();

        // Act
        let outcome = rel.on_ack(plan.counter);

        // Assert
        assert_eq!(
            outcome,
            Some(CheckOutcome::Verified {
                next_check: Duration::from_secs(30)
            })
        );
        assert!(rel.is_verified());
        assert!(!rel.is_in_flight());
    }

    #[test]
    fn test_mismatched_ack_is_ignored() {
        let mut rel = UdpReliability::default();
        let plan = rel.begin_check();
        assert_eq!(rel.on_ack(plan.counter.wrapping_add(5)), None);
        assert!(!rel.is_verified());
        assert!(rel.is_in_flight());
    }

    #[test]
    fn test_ack_without_outstanding_probe_is_ignored() {
        let mut rel = UdpReliability::default();
        assert_eq!(rel.on_ack(0), None);
    }

    #[test]
    fn test_timeout_fails_and_bumps_counter_so_late_ack_is_stale() {
        // Arrange
        let mut rel = UdpReliability::default();
        let plan = rel.begin_check();

        // Act
        let outcome = rel.on_timeout(plan.token);
        let late = rel.on_ack(plan.counter);

        // Assert
        assert_eq!(
            outcome,
            Some(CheckOutcome::Failed {
                retry_after: Duration::from_secs(1)
            })
        );
        assert_ne!(rel.ping_counter(), plan.counter);
        assert_eq!(late, None);
        assert!(!rel.is_verified());
    }

    #[test]
    fn test_superseded_timer_is_ignored() {
        // Arrange – a second check replaces the first before its timer fires
        let mut rel = UdpReliability::default();
        let old = rel.begin_check();
        let current = rel.begin_check();

        // Act / Assert
        assert_eq!(rel.on_timeout(old.token), None);
        assert!(rel.on_timeout(current.token).is_some());
    }

    #[test]
    fn test_backoff_sequence_is_monotonic_and_capped_at_thirty_seconds() {
        // Arrange
        let mut rel = UdpReliability::default();
        let mut delays = Vec::new();

        // Act – fail 15 checks in a row
        for _ in 0..15 {
            let plan = rel.begin_check();
            match rel.on_timeout(plan.token) {
                Some(CheckOutcome::Failed { retry_after }) => delays.push(retry_after),
                other => panic!("expected failure, got {other:?}"),
            }
        }

        // Assert
        assert_eq!(delays[0], Duration::from_secs_f64(1.0));
        assert_eq!(delays[1], Duration::from_secs_f64(1.5));
        assert_eq!(delays[2], Duration::from_secs_f64(2.25));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "backoff must never decrease");
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_success_resets_backoff() {
        // Arrange – accumulate some backoff
        let mut rel = UdpReliability::default();
        for _ in 0..4 {
            let plan = rel.begin_check();
            rel.on_timeout(plan.token);
        }
        assert!(rel.backoff() > Duration::from_secs(1));

        // Act
        let plan = rel.begin_check();
        rel.on_ack(plan.counter);

        // Assert
        assert_eq!(rel.backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalidate_clears_verified() {
        let mut rel = UdpReliability::default();
        let plan = rel.begin_check();
        rel.on_ack(plan.counter);
        rel.invalidate();
        assert!(!rel.is_verified());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(ReliabilityConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_negative_and_nan_min_backoff() {
        for value in [-1.0, f64::NAN] {
            // Arrange
            let config = ReliabilityConfig {
                min_backoff_secs: value,
                ..ReliabilityConfig::default()
            };

            // Act
            let result = config.validate();

            // Assert
            assert!(
                matches!(
                    result,
                    Err(InvalidReliabilityConfig::NotADuration { field: "min_backoff_secs", .. })
                ),
                "min_backoff_secs = {value} gave {result:?}"
            );
        }
    }

    #[test]
    fn test_validate_rejects_zero_min_backoff() {
        let config = ReliabilityConfig {
            min_backoff_secs: 0.0,
            ..ReliabilityConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InvalidReliabilityConfig::NonPositiveMinBackoff(0.0))
        );
    }

    #[test]
    fn test_validate_rejects_infinite_and_oversized_max_backoff() {
        for value in [f64::INFINITY, 1e30] {
            let config = ReliabilityConfig {
                max_backoff_secs: value,
                ..ReliabilityConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(InvalidReliabilityConfig::NotADuration { field: "max_backoff_secs", .. })
            ));
        }
    }

    #[test]
    fn test_validate_rejects_max_below_min() {
        let config = ReliabilityConfig {
            min_backoff_secs: 5.0,
            max_backoff_secs: 2.0,
            ..ReliabilityConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InvalidReliabilityConfig::MaxBelowMin { min: 5.0, max: 2.0 })
        );
    }

    #[test]
    fn test_validate_rejects_shrinking_or_nan_factor() {
        for value in [0.5, f64::NAN, f64::INFINITY] {
            let config = ReliabilityConfig {
                backoff_factor: value,
                ..ReliabilityConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(InvalidReliabilityConfig::ShrinkingBackoff(_))),
                "backoff_factor = {value} must be rejected"
            );
        }
    }

    #[test]
    fn test_validate_rejects_zero_timers() {
        let no_timeout = ReliabilityConfig {
            ping_timeout_ms: 0,
            ..ReliabilityConfig::default()
        };
        let no_interval = ReliabilityConfig {
            healthy_interval_secs: 0,
            ..ReliabilityConfig::default()
        };
        assert_eq!(no_timeout.validate(), Err(InvalidReliabilityConfig::ZeroPingTimeout));
        assert_eq!(no_interval.validate(), Err(InvalidReliabilityConfig::ZeroHealthyInterval));
    }

    #[test]
    fn test_valid_config_backoff_never_decreases_and_stays_in_bounds() {
        // Arrange – factor exactly 1 is the smallest accepted growth
        let config = ReliabilityConfig {
            min_backoff_secs: 2.0,
            max_backoff_secs: 4.0,
            backoff_factor: 1.0,
            ..ReliabilityConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));
        let mut rel = UdpReliability::new(config);
        let mut delays = Vec::new();

        // Act
        for _ in 0..5 {
            let plan = rel.begin_check();
            if let Some(CheckOutcome::Failed { retry_after }) = rel.on_timeout(plan.token) {
                delays.push(retry_after);
            }
        }

        // Assert
        assert_eq!(delays.len(), 5);
        assert!(delays.iter().all(|d| *d == Duration::from_secs(2)));
    }

    #[test]
    fn test_counter_wraps_without_panicking() {
        let mut rel = UdpReliability::default();
        rel.ping_counter = u32::MAX;
        let plan = rel.begin_check();
        assert_eq!(plan.counter, 0);
    }
}
