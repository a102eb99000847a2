//! Packet-filter rule model
//!
//! A [`RuleSpec`] describes one rule: which [`Table`] and [`Chain`] it lives
//! in, an ordered list of [`MatchExpr`] predicates and an [`Action`]. Rules are
//! identified by their caller-chosen [`RuleId`]; the backend [`RuleSpec::handle`]
//! is only populated for rules read back from a backend that exposes one.
//!
//! Table, Chain, Protocol, Action and reject reason are closed vocabularies.
//! Validation rejects anything outside them, and an invalid (table, chain)
//! pair is always a caller error.
//!
//! # Example
//!
//! ```
//! use fwsync::core::rule::{Action, Chain, MatchExpr, PortRange, Protocol, RuleSpec, Table};
//! use fwsync::core::rule::Family;
//!
//! let rule = RuleSpec::new("web-allow", Table::Filter, Chain::Input, Action::Accept)
//!     .with_match(MatchExpr::Protocol(Protocol::Tcp))
//!     .with_match(MatchExpr::DestinationPort(PortRange::single(443)));
//! assert!(rule.validate(Family::Ipv4).is_ok());
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::error::{Error, Result};
use super::rule_constraints;
use super::rule_id::RuleId;
use crate::validators;

/// IP family a backend instance operates on
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Family {
    #[default]
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn matches(self, addr: &IpAddr) -> bool {
        match self {
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Packet-filter processing stage
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }

    /// Built-in chains that exist in this table.
    pub const fn chains(self) -> &'static [Chain] {
        match self {
            Table::Filter => &[Chain::Input, Chain::Forward, Chain::Output],
            Table::Nat => &[
                Chain::Prerouting,
                Chain::Input,
                Chain::Output,
                Chain::Postrouting,
            ],
            Table::Mangle => &[
                Chain::Prerouting,
                Chain::Input,
                Chain::Forward,
                Chain::Output,
                Chain::Postrouting,
            ],
            Table::Raw => &[Chain::Prerouting, Chain::Output],
        }
    }

    pub fn admits(self, chain: Chain) -> bool {
        self.chains().contains(&chain)
    }
}

/// Hook point within a table
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Chain {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

impl Chain {
    /// iptables spelling
    pub const fn as_str(self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
            Chain::Postrouting => "POSTROUTING",
        }
    }

    /// nftables chain and hook name
    pub const fn hook_name(self) -> &'static str {
        match self {
            Chain::Prerouting => "prerouting",
            Chain::Input => "input",
            Chain::Forward => "forward",
            Chain::Output => "output",
            Chain::Postrouting => "postrouting",
        }
    }
}

/// A validated (table, chain) pair. The only way to address a backend chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Scope {
    table: Table,
    chain: Chain,
}

impl Scope {
    pub fn new(table: Table, chain: Chain) -> Result<Self> {
        if !table.admits(chain) {
            let valid: Vec<&str> = table.chains().iter().map(|c| c.as_str()).collect();
            return Err(Error::validation(
                "chain",
                format!(
                    "{chain} is not valid in table {table} (valid: {})",
                    valid.join(", ")
                ),
            ));
        }
        Ok(Self { table, chain })
    }

    /// Parses user-supplied table and chain names.
    pub fn parse(table: &str, chain: &str) -> Result<Self> {
        let table = Table::from_str(table)
            .map_err(|_| Error::validation("table", format!("Unknown table '{table}'")))?;
        let chain = Chain::from_str(chain)
            .map_err(|_| Error::validation("chain", format!("Unknown chain '{chain}'")))?;
        Self::new(table, chain)
    }

    pub const fn table(&self) -> Table {
        self.table
    }

    pub const fn chain(&self) -> Chain {
        self.chain
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.chain)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ConnState {
    New,
    Established,
    Related,
    Invalid,
    Untracked,
}

/// ICMP (or TCP reset) response sent by a REJECT action
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RejectReason {
    #[default]
    PortUnreachable,
    NetUnreachable,
    HostUnreachable,
    ProtoUnreachable,
    NetProhibited,
    HostProhibited,
    AdminProhibited,
    TcpReset,
}

impl RejectReason {
    /// `--reject-with` argument, `None` if the family has no equivalent.
    pub const fn iptables_arg(self, family: Family) -> Option<&'static str> {
        match (family, self) {
            (_, RejectReason::TcpReset) => Some("tcp-reset"),
            (Family::Ipv4, RejectReason::PortUnreachable) => Some("icmp-port-unreachable"),
            (Family::Ipv4, RejectReason::NetUnreachable) => Some("icmp-net-unreachable"),
            (Family::Ipv4, RejectReason::HostUnreachable) => Some("icmp-host-unreachable"),
            (Family::Ipv4, RejectReason::ProtoUnreachable) => Some("icmp-proto-unreachable"),
            (Family::Ipv4, RejectReason::NetProhibited) => Some("icmp-net-prohibited"),
            (Family::Ipv4, RejectReason::HostProhibited) => Some("icmp-host-prohibited"),
            (Family::Ipv4, RejectReason::AdminProhibited) => Some("icmp-admin-prohibited"),
            (Family::Ipv6, RejectReason::PortUnreachable) => Some("icmp6-port-unreachable"),
            (Family::Ipv6, RejectReason::NetUnreachable) => Some("icmp6-no-route"),
            (Family::Ipv6, RejectReason::HostUnreachable) => Some("icmp6-addr-unreachable"),
            (Family::Ipv6, RejectReason::AdminProhibited) => Some("icmp6-adm-prohibited"),
            (Family::Ipv6, _) => None,
        }
    }

    /// Reverse of [`Self::iptables_arg`], used when decoding listings.
    pub fn from_iptables_arg(arg: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|r| {
            r.iptables_arg(Family::Ipv4) == Some(arg) || r.iptables_arg(Family::Ipv6) == Some(arg)
        })
    }

    /// nft `reject with ...` tokens.
    pub const fn nft_args(self, family: Family) -> Option<&'static [&'static str]> {
        match (family, self) {
            (_, RejectReason::TcpReset) => Some(&["with", "tcp", "reset"]),
            (Family::Ipv4, RejectReason::PortUnreachable) => {
                Some(&["with", "icmp", "type", "port-unreachable"])
            }
            (Family::Ipv4, RejectReason::NetUnreachable) => {
                Some(&["with", "icmp", "type", "net-unreachable"])
            }
            (Family::Ipv4, RejectReason::HostUnreachable) => {
                Some(&["with", "icmp", "type", "host-unreachable"])
            }
            (Family::Ipv4, RejectReason::ProtoUnreachable) => {
                Some(&["with", "icmp", "type", "prot-unreachable"])
            }
            (Family::Ipv4, RejectReason::NetProhibited) => {
                Some(&["with", "icmp", "type", "net-prohibited"])
            }
            (Family::Ipv4, RejectReason::HostProhibited) => {
                Some(&["with", "icmp", "type", "host-prohibited"])
            }
            (Family::Ipv4, RejectReason::AdminProhibited) => {
                Some(&["with", "icmp", "type", "admin-prohibited"])
            }
            (Family::Ipv6, RejectReason::PortUnreachable) => {
                Some(&["with", "icmpv6", "type", "port-unreachable"])
            }
            (Family::Ipv6, RejectReason::NetUnreachable) => {
                Some(&["with", "icmpv6", "type", "no-route"])
            }
            (Family::Ipv6, RejectReason::HostUnreachable) => {
                Some(&["with", "icmpv6", "type", "addr-unreachable"])
            }
            (Family::Ipv6, RejectReason::AdminProhibited) => {
                Some(&["with", "icmpv6", "type", "admin-prohibited"])
            }
            (Family::Ipv6, _) => None,
        }
    }
}

/// Rule verdict or logging statement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Accept,
    Drop,
    Reject(RejectReason),
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

impl Action {
    /// iptables target name
    pub const fn verb(&self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject(_) => "REJECT",
            Action::Log { .. } => "LOG",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Reject(reason) => write!(f, "REJECT ({reason})"),
            Action::Log {
                prefix: Some(prefix),
            } => write!(f, "LOG \"{prefix}\""),
            other => f.write_str(other.verb()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PortRepr", into = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn new(start: u16, end: u16) -> Result<Self> {
        validators::validate_port_range(start, end)
            .map(|(start, end)| Self { start, end })
            .map_err(|msg| Error::validation("port", msg))
    }

    pub const fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// `443` or `1000:2000`
    pub fn iptables_arg(&self) -> String {
        if self.is_single() {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| Error::validation("port", format!("Invalid port '{p}'")))
        };
        match s.split_once(['-', ':']) {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => {
                let port = parse(s)?;
                Self::new(port, port)
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Number(u16),
    Text(String),
}

impl TryFrom<PortRepr> for PortRange {
    type Error = Error;

    fn try_from(value: PortRepr) -> Result<Self> {
        match value {
            PortRepr::Number(port) => Self::new(port, port),
            PortRepr::Text(text) => text.parse(),
        }
    }
}

impl From<PortRange> for String {
    fn from(value: PortRange) -> Self {
        value.to_string()
    }
}

/// Address predicate: a CIDR network or an inclusive address range
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddrMatch {
    Network(IpNetwork),
    Range { start: IpAddr, end: IpAddr },
}

impl AddrMatch {
    fn validate(&self, field: &str, family: Family) -> Result<()> {
        match self {
            AddrMatch::Network(net) => {
                if !family.matches(&net.ip()) {
                    return Err(Error::validation(
                        field,
                        format!("{net} is not an {family} network"),
                    ));
                }
            }
            AddrMatch::Range { start, end } => {
                if !family.matches(start) || !family.matches(end) {
                    return Err(Error::validation(
                        field,
                        format!("{start}-{end} is not an {family} range"),
                    ));
                }
                if start > end {
                    return Err(Error::validation(
                        field,
                        format!("Range start {start} is greater than end {end}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrMatch::Network(net) => write!(f, "{net}"),
            AddrMatch::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

/// One match predicate. Only the backend adapters interpret these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchExpr {
    Protocol(Protocol),
    Source(AddrMatch),
    Destination(AddrMatch),
    SourcePort(PortRange),
    DestinationPort(PortRange),
    ConnState(Vec<ConnState>),
    InInterface(String),
    OutInterface(String),
}

impl MatchExpr {
    const fn kind(&self) -> &'static str {
        match self {
            MatchExpr::Protocol(_) => "protocol",
            MatchExpr::Source(_) => "source",
            MatchExpr::Destination(_) => "destination",
            MatchExpr::SourcePort(_) => "source_port",
            MatchExpr::DestinationPort(_) => "destination_port",
            MatchExpr::ConnState(_) => "conn_state",
            MatchExpr::InInterface(_) => "in_interface",
            MatchExpr::OutInterface(_) => "out_interface",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: RuleId,
    pub table: Table,
    pub chain: Chain,
    #[serde(default)]
    pub matches: Vec<MatchExpr>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<u64>,
}

/// Hashed content of a rule, excluding identity and handle.
#[derive(Serialize)]
struct RuleContent<'a> {
    table: Table,
    chain: Chain,
    matches: &'a [MatchExpr],
    action: &'a Action,
}

impl RuleSpec {
    pub fn new(id: impl Into<RuleId>, table: Table, chain: Chain, action: Action) -> Self {
        Self {
            id: id.into(),
            table,
            chain,
            matches: Vec::new(),
            action,
            handle: None,
        }
    }

    /// Builds a rule whose identity is derived from its content.
    pub fn with_derived_id(
        table: Table,
        chain: Chain,
        matches: Vec<MatchExpr>,
        action: Action,
    ) -> Result<Self> {
        let id = RuleId::derive(&RuleContent {
            table,
            chain,
            matches: &matches,
            action: &action,
        })?;
        Ok(Self {
            id,
            table,
            chain,
            matches,
            action,
            handle: None,
        })
    }

    pub fn with_match(mut self, expr: MatchExpr) -> Self {
        self.matches.push(expr);
        self
    }

    pub fn with_handle(mut self, handle: u64) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn scope(&self) -> Result<Scope> {
        Scope::new(self.table, self.chain)
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.matches.iter().find_map(|m| match m {
            MatchExpr::Protocol(p) => Some(*p),
            _ => None,
        })
    }

    /// Checks every field against the closed vocabularies and field-combination rules.
    ///
    /// Called before any backend command is built, so a failure here means
    /// nothing was sent to the backend.
    pub fn validate(&self, family: Family) -> Result<()> {
        self.id.validate()?;
        let scope = self.scope()?;
        let protocol = self.protocol();

        let mut seen: Vec<&'static str> = Vec::with_capacity(self.matches.len());
        for expr in &self.matches {
            let kind = expr.kind();
            if seen.contains(&kind) {
                return Err(Error::validation(
                    kind,
                    "Predicate appears more than once in the same rule",
                ));
            }
            seen.push(kind);

            match expr {
                MatchExpr::Protocol(_) => {}
                MatchExpr::Source(addr) => addr.validate("source", family)?,
                MatchExpr::Destination(addr) => addr.validate("destination", family)?,
                MatchExpr::SourcePort(range) | MatchExpr::DestinationPort(range) => {
                    validators::validate_port_range(range.start, range.end)
                        .map_err(|msg| Error::validation(kind, msg))?;
                    if !protocol.is_some_and(rule_constraints::protocol_supports_ports) {
                        return Err(Error::validation(
                            kind,
                            "Port matching requires a tcp or udp protocol predicate",
                        ));
                    }
                }
                MatchExpr::ConnState(states) => {
                    if states.is_empty() {
                        return Err(Error::validation(kind, "At least one state is required"));
                    }
                }
                MatchExpr::InInterface(name) => {
                    validators::validate_interface(name).map_err(|msg| Error::validation(kind, msg))?;
                    if !rule_constraints::chain_allows_in_interface(scope.chain()) {
                        return Err(Error::validation(
                            kind,
                            format!("Input interface cannot be matched in {}", scope.chain()),
                        ));
                    }
                }
                MatchExpr::OutInterface(name) => {
                    validators::validate_interface(name).map_err(|msg| Error::validation(kind, msg))?;
                    if !rule_constraints::chain_allows_out_interface(scope.chain()) {
                        return Err(Error::validation(
                            kind,
                            format!("Output interface cannot be matched in {}", scope.chain()),
                        ));
                    }
                }
            }
        }

        match &self.action {
            Action::Reject(reason) => {
                if !rule_constraints::scope_allows_reject(scope) {
                    return Err(Error::validation(
                        "action",
                        format!("REJECT is only valid in the filter table INPUT, FORWARD and OUTPUT chains, not {scope}"),
                    ));
                }
                if reason.iptables_arg(family).is_none() {
                    return Err(Error::validation(
                        "action",
                        format!("Reject reason {reason} has no {family} equivalent"),
                    ));
                }
                if !rule_constraints::reject_reason_valid_for_protocol(*reason, protocol) {
                    return Err(Error::validation(
                        "action",
                        "tcp-reset requires a tcp protocol predicate",
                    ));
                }
            }
            Action::Log {
                prefix: Some(prefix),
            } => {
                validators::validate_log_prefix(prefix)
                    .map_err(|msg| Error::validation("action", msg))?;
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_allow() -> RuleSpec {
        RuleSpec::new("web-allow", Table::Filter, Chain::Input, Action::Accept)
            .with_match(MatchExpr::Protocol(Protocol::Tcp))
            .with_match(MatchExpr::DestinationPort(PortRange::single(443)))
    }

    #[test]
    fn test_table_chain_map() {
        assert!(Table::Raw.admits(Chain::Prerouting));
        assert!(Table::Raw.admits(Chain::Output));
        assert!(!Table::Raw.admits(Chain::Postrouting));
        assert!(!Table::Raw.admits(Chain::Input));
        assert!(!Table::Filter.admits(Chain::Prerouting));
        assert_eq!(Table::Mangle.chains().len(), 5);
    }

    #[test]
    fn test_scope_rejects_raw_postrouting() {
        let err = Scope::new(Table::Raw, Chain::Postrouting).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("PREROUTING, OUTPUT"));
    }

    #[test]
    fn test_scope_parse_is_case_insensitive() {
        let scope = Scope::parse("FILTER", "input").unwrap();
        assert_eq!(scope.table(), Table::Filter);
        assert_eq!(scope.chain(), Chain::Input);
        assert!(Scope::parse("security", "INPUT").is_err());
        assert!(Scope::parse("filter", "PREROUTE").is_err());
    }

    #[test]
    fn test_valid_rule() {
        assert!(web_allow().validate(Family::Ipv4).is_ok());
        assert!(web_allow().validate(Family::Ipv6).is_ok());
    }

    #[test]
    fn test_port_without_protocol_rejected() {
        let rule = RuleSpec::new("p", Table::Filter, Chain::Input, Action::Accept)
            .with_match(MatchExpr::DestinationPort(PortRange::single(22)));
        assert!(rule.validate(Family::Ipv4).is_err());

        let icmp = rule.with_match(MatchExpr::Protocol(Protocol::Icmp));
        assert!(icmp.validate(Family::Ipv4).is_err());
    }

    #[test]
    fn test_port_range_validation() {
        assert!("0".parse::<PortRange>().is_err());
        assert!("2000-1000".parse::<PortRange>().is_err());
        assert!("70000".parse::<PortRange>().is_err());
        assert_eq!("1000:2000".parse::<PortRange>().unwrap(), PortRange { start: 1000, end: 2000 });
        assert_eq!(PortRange { start: 1000, end: 2000 }.iptables_arg(), "1000:2000");
    }

    #[test]
    fn test_address_family_mismatch() {
        let rule = web_allow().with_match(MatchExpr::Source(AddrMatch::Network(
            "10.0.0.0/8".parse().unwrap(),
        )));
        assert!(rule.validate(Family::Ipv4).is_ok());
        assert!(rule.validate(Family::Ipv6).is_err());
    }

    #[test]
    fn test_reversed_address_range() {
        let rule = web_allow().with_match(MatchExpr::Source(AddrMatch::Range {
            start: "10.0.0.9".parse().unwrap(),
            end: "10.0.0.1".parse().unwrap(),
        }));
        let err = rule.validate(Family::Ipv4).unwrap_err();
        assert!(err.to_string().contains("greater than"));
    }

    #[test]
    fn test_duplicate_predicate() {
        let rule = web_allow().with_match(MatchExpr::Protocol(Protocol::Udp));
        assert!(rule.validate(Family::Ipv4).is_err());
    }

    #[test]
    fn test_interface_direction() {
        let out_on_input = web_allow().with_match(MatchExpr::OutInterface("eth0".into()));
        assert!(out_on_input.validate(Family::Ipv4).is_err());

        let in_on_input = web_allow().with_match(MatchExpr::InInterface("eth+".into()));
        assert!(in_on_input.validate(Family::Ipv4).is_ok());
    }

    #[test]
    fn test_reject_constraints() {
        let mut rule = web_allow();
        rule.action = Action::Reject(RejectReason::HostProhibited);
        assert!(rule.validate(Family::Ipv4).is_ok());
        assert!(rule.validate(Family::Ipv6).is_err());

        rule.action = Action::Reject(RejectReason::TcpReset);
        assert!(rule.validate(Family::Ipv6).is_ok());

        let mut udp = RuleSpec::new("u", Table::Filter, Chain::Input, Action::Reject(RejectReason::TcpReset))
            .with_match(MatchExpr::Protocol(Protocol::Udp));
        assert!(udp.validate(Family::Ipv4).is_err());

        udp.table = Table::Nat;
        udp.chain = Chain::Prerouting;
        udp.action = Action::Reject(RejectReason::PortUnreachable);
        assert!(udp.validate(Family::Ipv4).is_err());
    }

    #[test]
    fn test_reject_reason_round_trip_names() {
        assert_eq!(
            RejectReason::from_iptables_arg("icmp6-adm-prohibited"),
            Some(RejectReason::AdminProhibited)
        );
        assert_eq!(
            RejectReason::from_iptables_arg("icmp-port-unreachable"),
            Some(RejectReason::PortUnreachable)
        );
        assert_eq!(RejectReason::from_iptables_arg("bogus"), None);
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{
            "id": "web-allow",
            "table": "filter",
            "chain": "INPUT",
            "matches": [{"protocol": "tcp"}, {"destination_port": 443}, {"source": "10.0.0.0/8"}],
            "action": "accept"
        }"#;
        let rule: RuleSpec = serde_json::from_str(json).unwrap();
        assert_eq!(rule.id, RuleId::from("web-allow"));
        assert_eq!(rule.matches.len(), 3);
        assert_eq!(rule.handle, None);
        assert!(rule.validate(Family::Ipv4).is_ok());

        let reject: Action = serde_json::from_str(r#"{"reject": "tcp-reset"}"#).unwrap();
        assert_eq!(reject, Action::Reject(RejectReason::TcpReset));

        let range: MatchExpr =
            serde_json::from_str(r#"{"source": {"start": "10.0.0.1", "end": "10.0.0.9"}}"#).unwrap();
        assert!(matches!(range, MatchExpr::Source(AddrMatch::Range { .. })));
    }

    #[test]
    fn test_unknown_vocabulary_rejected() {
        assert!(serde_json::from_str::<Table>("\"security\"").is_err());
        assert!(serde_json::from_str::<Action>("\"masquerade\"").is_err());
        assert!(serde_json::from_str::<RejectReason>("\"icmp-bogus\"").is_err());
    }

    #[test]
    fn test_derived_id_ignores_handle() {
        let a = RuleSpec::with_derived_id(Table::Filter, Chain::Input, vec![], Action::Drop).unwrap();
        let b = RuleSpec::with_derived_id(Table::Filter, Chain::Input, vec![], Action::Drop)
            .unwrap()
            .with_handle(7);
        let c = RuleSpec::with_derived_id(Table::Filter, Chain::Output, vec![], Action::Drop).unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }
}
