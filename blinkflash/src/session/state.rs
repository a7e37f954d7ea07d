//! Connection states and session tuning.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::link::DiscoveryFilter;
use crate::mtu::{MIN_MTU, MtuPolicy};

/// How long a single connect may take before it is abandoned.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the session is in its connection lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link and nothing pending.
    #[default]
    Disconnected,
    /// A user-requested connect is in progress.
    Connecting,
    /// A link is up and the console is subscribed.
    Connected,
    /// The link dropped; automatic recovery is on the given attempt
    /// (1-indexed).
    Reconnecting {
        /// Current attempt.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Whether a link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether a connect or recovery is in progress.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// Automatic recovery after an unexpected drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconnectPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-indexed): `initial * multiplier^(attempt - 1)`.
    ///
    /// Saturates instead of overflowing for absurd attempt counts.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self
            .multiplier
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether a drop is recovered at all. `max_attempts == 0` turns
    /// recovery off.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

/// Everything a session needs to know up front.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Recovery after drops.
    pub reconnect: ReconnectPolicy,
    /// MTU negotiation.
    pub mtu: MtuPolicy,
    /// Which devices `connect()` considers.
    pub discovery: DiscoveryFilter,
    /// Upper bound on a single transport connect.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            mtu: MtuPolicy::default(),
            discovery: DiscoveryFilter::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.reconnect.multiplier == 0 {
            return Err(Error::Config(
                "reconnect multiplier must be at least 1".to_string(),
            ));
        }
        if self.mtu.fallback < MIN_MTU {
            return Err(Error::Config(format!(
                "fallback MTU {} is below the minimum of {MIN_MTU}",
                self.mtu.fallback
            )));
        }
        if self.mtu.preferred < MIN_MTU {
            return Err(Error::Config(format!(
                "preferred MTU {} is below the minimum of {MIN_MTU}",
                self.mtu.preferred
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the MTU policy.
    #[must_use]
    pub fn with_mtu(mut self, mtu: MtuPolicy) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the discovery filter.
    #[must_use]
    pub fn with_discovery(mut self, discovery: DiscoveryFilter) -> Self {
        self.discovery = discovery;
        self
    }

    /// Set the per-connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| u64::try_from(policy.delay_for(n).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(200) >= policy.delay_for(30));
    }

    #[test]
    fn test_attempt_limit() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows_after(4));
        assert!(!policy.allows_after(5));
    }

    #[test]
    fn test_zero_attempts_disables_recovery() {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(!policy.is_enabled());
        assert!(!policy.allows_after(0));
        assert!(ReconnectPolicy::default().is_enabled());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let zero_multiplier = SessionConfig::default().with_reconnect(ReconnectPolicy {
            multiplier: 0,
            ..ReconnectPolicy::default()
        });
        assert!(matches!(zero_multiplier.validate(), Err(Error::Config(_))));

        let tiny_fallback = SessionConfig::default().with_mtu(MtuPolicy {
            fallback: MIN_MTU - 1,
            ..MtuPolicy::default()
        });
        assert!(matches!(tiny_fallback.validate(), Err(Error::Config(_))));

        let tiny_preferred = SessionConfig::default().with_mtu(MtuPolicy {
            preferred: 1,
            ..MtuPolicy::default()
        });
        assert!(matches!(tiny_preferred.validate(), Err(Error::Config(_))));

        let no_timeout = SessionConfig::default().with_connect_timeout(Duration::ZERO);
        assert!(matches!(no_timeout.validate(), Err(Error::Config(_))));

        let smallest = SessionConfig::default().with_mtu(MtuPolicy {
            fallback: MIN_MTU,
            preferred: MIN_MTU,
            ..MtuPolicy::default()
        });
        assert!(smallest.validate().is_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::default().to_string(), "disconnected");
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting (attempt 2)"
        );
        assert!(ConnectionState::Connecting.is_pending());
        assert!(!ConnectionState::Connected.is_pending());
    }
}
