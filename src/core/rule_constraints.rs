//! Rule constraint functions
//!
//! This module centralizes the business rules about valid field combinations
//! for a [`RuleSpec`](super::rule::RuleSpec). [`RuleSpec::validate`](super::rule::RuleSpec::validate)
//! calls these before any backend command is built.
//!
//! # Examples
//!
//! ```
//! use fwsync::core::rule::{Chain, Protocol, RejectReason};
//! use fwsync::core::rule_constraints::*;
//!
//! assert!(protocol_supports_ports(Protocol::Tcp));
//! assert!(!protocol_supports_ports(Protocol::Icmp));
//!
//! assert!(reject_reason_valid_for_protocol(RejectReason::TcpReset, Some(Protocol::Tcp)));
//! assert!(!reject_reason_valid_for_protocol(RejectReason::TcpReset, Some(Protocol::Udp)));
//!
//! assert!(!chain_allows_out_interface(Chain::Input));
//! ```

use super::rule::{Chain, Protocol, RejectReason, Scope, Table};

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol supports port filtering.
///
/// Only TCP and UDP carry ports. ICMP and "all" cannot be combined with
/// `--sport`/`--dport` or `th dport`.
#[inline]
pub fn protocol_supports_ports(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::Tcp | Protocol::Udp)
}

/// Returns `true` if the reject reason can be sent for packets of this protocol.
///
/// A TCP reset only makes sense for TCP; every ICMP reason works for any protocol.
#[inline]
pub fn reject_reason_valid_for_protocol(reason: RejectReason, protocol: Option<Protocol>) -> bool {
    match reason {
        RejectReason::TcpReset => protocol == Some(Protocol::Tcp),
        _ => true,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Chain Direction Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Input interface is known for packets that have been received.
#[inline]
pub fn chain_allows_in_interface(chain: Chain) -> bool {
    matches!(chain, Chain::Prerouting | Chain::Input | Chain::Forward)
}

/// Output interface is known once routing has picked one.
#[inline]
pub fn chain_allows_out_interface(chain: Chain) -> bool {
    matches!(chain, Chain::Forward | Chain::Output | Chain::Postrouting)
}

// ═══════════════════════════════════════════════════════════════════════════
// Target Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// REJECT is restricted to the filter table's INPUT, FORWARD and OUTPUT chains.
#[inline]
pub fn scope_allows_reject(scope: Scope) -> bool {
    scope.table() == Table::Filter
        && matches!(scope.chain(), Chain::Input | Chain::Forward | Chain::Output)
}
