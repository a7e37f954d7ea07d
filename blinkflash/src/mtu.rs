//! MTU negotiation.
//!
//! The usable payload per write is determined once per link, trying in
//! order:
//!
//! 1. an MTU request through the transport, when it has that capability;
//! 2. the device's MTU-report endpoint (u16 LE, minus the ATT envelope);
//! 3. the conservative default.
//!
//! Failing every path is not an error. The link stays usable at the default
//! MTU.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, warn};
use std::fmt;

use crate::event::EventSink;
use crate::link::Link;
use crate::protocol::DATA_HEADER_SIZE;

/// MTU assumed when negotiation fails.
pub const DEFAULT_MTU: u16 = 20;

/// MTU requested from transports that support negotiation.
pub const PREFERRED_MTU: u16 = 512;

/// ATT envelope subtracted from the device-reported MTU.
pub const REPORT_OVERHEAD: u16 = 3;

/// Smallest MTU that still carries one payload byte in a Data frame.
#[allow(clippy::cast_possible_truncation)]
pub const MIN_MTU: u16 = DATA_HEADER_SIZE as u16 + 1;

/// Negotiation parameters.
///
/// The two overheads are kept separate: a granted MTU and a reported MTU
/// are not necessarily measured the same way by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MtuPolicy {
    /// Size to request from the transport.
    pub preferred: u16,
    /// Size used when every negotiation path fails.
    pub fallback: u16,
    /// Subtracted from a value granted by the transport.
    pub granted_overhead: u16,
    /// Subtracted from the value read from the MTU-report endpoint.
    pub report_overhead: u16,
}

impl Default for MtuPolicy {
    fn default() -> Self {
        Self {
            preferred: PREFERRED_MTU,
            fallback: DEFAULT_MTU,
            granted_overhead: 0,
            report_overhead: REPORT_OVERHEAD,
        }
    }
}

/// Where a negotiated MTU came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MtuSource {
    /// Granted by the transport's MTU request.
    Granted,
    /// Read from the device's MTU-report endpoint.
    Reported,
    /// Default after every path failed.
    Fallback,
}

impl fmt::Display for MtuSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted => write!(f, "granted"),
            Self::Reported => write!(f, "reported by device"),
            Self::Fallback => write!(f, "default"),
        }
    }
}

/// Result of negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NegotiatedMtu {
    /// Usable bytes per write.
    pub value: u16,
    /// Negotiation path that produced `value`.
    pub source: MtuSource,
}

impl NegotiatedMtu {
    /// Fallback value with the default policy.
    pub fn fallback(policy: &MtuPolicy) -> Self {
        Self {
            value: policy.fallback,
            source: MtuSource::Fallback,
        }
    }

    /// Payload bytes per Data frame, or `None` when the MTU is too small to
    /// carry any.
    pub fn payload_size(&self) -> Option<usize> {
        usize::from(self.value)
            .checked_sub(DATA_HEADER_SIZE)
            .filter(|&n| n > 0)
    }

    /// Whether a Data frame fits at all.
    pub fn is_usable(&self) -> bool {
        self.value >= MIN_MTU
    }
}

/// Parse the MTU-report endpoint value.
pub fn parse_mtu_report(raw: &[u8], overhead: u16) -> Option<u16> {
    if raw.len() < 2 {
        return None;
    }
    LittleEndian::read_u16(&raw[..2]).checked_sub(overhead)
}

/// Negotiate the MTU for `link`.
///
/// Never fails; every failure path ends in the policy fallback, reported as
/// a warning and a status line.
pub async fn negotiate(link: &dyn Link, policy: &MtuPolicy, events: &EventSink) -> NegotiatedMtu {
    let negotiated = negotiate_inner(link, policy, events).await;

    if !negotiated.is_usable() {
        error!(
            "Negotiated MTU {} ({}) is below the minimum of {MIN_MTU}; transfers will be refused",
            negotiated.value, negotiated.source
        );
        events.status(format!(
            "Warning: MTU {} is too small to send bytecode",
            negotiated.value
        ));
    }

    negotiated
}

async fn negotiate_inner(link: &dyn Link, policy: &MtuPolicy, events: &EventSink) -> NegotiatedMtu {
    if link.can_request_mtu() {
        match link.request_mtu(policy.preferred).await {
            Ok(granted) => {
                let value = granted.saturating_sub(policy.granted_overhead);
                debug!("Negotiated MTU: {value} (granted {granted})");
                return NegotiatedMtu {
                    value,
                    source: MtuSource::Granted,
                };
            },
            Err(e) => {
                warn!("MTU request failed: {e}; reading device MTU instead");
            },
        }
    } else {
        debug!("MTU request not supported by transport; reading device MTU");
    }

    match link.read_mtu_report().await {
        Ok(raw) => {
            if let Some(value) = parse_mtu_report(&raw, policy.report_overhead) {
                debug!("Device negotiated MTU: {value} (raw {raw:02X?})");
                return NegotiatedMtu {
                    value,
                    source: MtuSource::Reported,
                };
            }
            warn!("Invalid MTU report {raw:02X?}");
        },
        Err(e) => {
            warn!("Failed to read device MTU: {e}");
        },
    }

    warn!("MTU negotiation failed. Using default MTU: {}", policy.fallback);
    events.status(format!(
        "MTU negotiation failed. Using default MTU: {}",
        policy.fallback
    ));
    NegotiatedMtu::fallback(policy)
}
