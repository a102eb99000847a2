//! `iptables` / `ip6tables` command-line adapter
//!
//! Rules are listed with `-L <chain> -n -v -x --line-numbers` through the
//! streaming reader and decoded with the [`ColumnMap`] for the family. Managed
//! rules carry an xt_comment tag; iptables exposes no handles, so rules are
//! addressed by line number, re-read before every mutation.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ChainOps, Located, Locator};
use crate::core::columns::{ColumnMap, IptRow};
use crate::core::error::{Error, Result};
use crate::core::exec;
use crate::core::rule::{
    Action, AddrMatch, ConnState, Family, MatchExpr, PortRange, Protocol, RejectReason, RuleSpec,
    Scope,
};
use crate::core::rule_id::RuleId;
use crate::core::stream::{self, Page, PageWindow, RowInfo};
use crate::elevation;

pub struct IptablesTarget {
    program: PathBuf,
    family: Family,
    scope: Scope,
    columns: ColumnMap,
}

impl IptablesTarget {
    pub fn new(program: impl Into<PathBuf>, family: Family, scope: Scope) -> Result<Self> {
        Ok(Self {
            program: program.into(),
            family,
            scope,
            columns: ColumnMap::iptables(family)?,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, args: &[&str]) -> Result<Command> {
        Ok(elevation::create_elevated_iptables_command(
            &self.program,
            args,
        )?)
    }

    fn listing_command(&self) -> Result<Command> {
        self.command(&[
            "-w",
            "-t",
            self.scope.table().as_str(),
            "-L",
            self.scope.chain().as_str(),
            "-n",
            "-v",
            "-x",
            "--line-numbers",
        ])
    }

    /// Runs `iptables -w -t <table> <op> <chain> [position] <rule args>`.
    async fn mutate(&self, op: &str, position: Option<u64>, rule: Option<&RuleSpec>) -> Result<()> {
        let position = position.map(|p| p.to_string());
        let spec = rule.map(|r| rule_args(r, self.family)).unwrap_or_default();

        let mut args = vec![
            "-w",
            "-t",
            self.scope.table().as_str(),
            op,
            self.scope.chain().as_str(),
        ];
        if let Some(position) = &position {
            args.push(position.as_str());
        }
        args.extend(spec.iter().map(String::as_str));

        exec::run(self.command(&args)?).await?;
        Ok(())
    }
}

#[async_trait]
impl ChainOps for IptablesTarget {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn family(&self) -> Family {
        self.family
    }

    async fn fetch(&self) -> Result<Vec<Located>> {
        let columns = self.columns.clone();
        let scope = self.scope;
        let parser = move |_: u64, line: &str| -> Result<Option<Located>> {
            let Some(row) = columns.decode(line)? else {
                return Ok(None);
            };
            let Some(rule) = decode_rule(&row, scope)? else {
                debug!(line = row.num, "Skipping unmanaged rule");
                return Ok(None);
            };
            Ok(Some(Located {
                rule,
                at: Locator::Line(row.num),
            }))
        };

        stream::stream_command(
            self.listing_command()?,
            PageWindow::all(),
            parser,
            CancellationToken::new(),
        )
        .await
        .into_page()
        .map(|page| page.rows)
    }

    async fn append(&self, rule: &RuleSpec) -> Result<()> {
        self.mutate("-A", None, Some(rule)).await?;
        info!(scope = %self.scope, id = %rule.id, "Appended rule");
        Ok(())
    }

    async fn prepend(&self, rule: &RuleSpec) -> Result<()> {
        self.mutate("-I", Some(1), Some(rule)).await?;
        info!(scope = %self.scope, id = %rule.id, "Inserted rule");
        Ok(())
    }

    async fn remove(&self, at: Locator) -> Result<()> {
        let line = line_number(at)?;
        self.mutate("-D", Some(line), None).await?;
        info!(scope = %self.scope, line, "Deleted rule");
        Ok(())
    }

    async fn replace(&self, at: Locator, rule: &RuleSpec) -> Result<()> {
        let line = line_number(at)?;
        self.mutate("-R", Some(line), Some(rule)).await?;
        info!(scope = %self.scope, line, id = %rule.id, "Replaced rule");
        Ok(())
    }

    async fn page(&self, page: u64, limit: u64) -> Result<Page> {
        let window = PageWindow::page(page, limit)?;
        let columns = self.columns.clone();
        let parser = move |index: u64, line: &str| -> Result<Option<RowInfo>> {
            Ok(columns.decode(line)?.map(|row| RowInfo {
                row_no: index,
                handle: Some(row.num),
                row: line.trim_end().to_string(),
            }))
        };
        stream::stream_command(self.listing_command()?, window, parser, CancellationToken::new())
            .await
            .into_page()
    }
}

fn line_number(at: Locator) -> Result<u64> {
    match at {
        Locator::Line(line) => Ok(line),
        Locator::Handle(handle) => Err(Error::Internal(format!(
            "iptables rules have no handles (got handle {handle})"
        ))),
    }
}

fn protocol_arg(protocol: Protocol, family: Family) -> &'static str {
    match (protocol, family) {
        (Protocol::Tcp, _) => "tcp",
        (Protocol::Udp, _) => "udp",
        (Protocol::Icmp, Family::Ipv4) => "icmp",
        (Protocol::Icmp, Family::Ipv6) => "ipv6-icmp",
        (Protocol::All, _) => "all",
    }
}

fn push_addr(args: &mut Vec<String>, addr: &AddrMatch, plain: &str, range: &str) {
    match addr {
        AddrMatch::Network(net) => {
            args.push(plain.to_string());
            args.push(net.to_string());
        }
        AddrMatch::Range { start, end } => {
            args.extend(["-m".to_string(), "iprange".to_string(), range.to_string()]);
            args.push(format!("{start}-{end}"));
        }
    }
}

/// Rule arguments after `-A/-I/-R <chain> [n]`.
///
/// The protocol is always emitted first since `--sport`/`--dport` depend on it.
pub fn rule_args(rule: &RuleSpec, family: Family) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(protocol) = rule.protocol() {
        args.push("-p".to_string());
        args.push(protocol_arg(protocol, family).to_string());
    }

    for expr in &rule.matches {
        match expr {
            MatchExpr::Protocol(_) => {}
            MatchExpr::Source(addr) => push_addr(&mut args, addr, "-s", "--src-range"),
            MatchExpr::Destination(addr) => push_addr(&mut args, addr, "-d", "--dst-range"),
            MatchExpr::SourcePort(range) => {
                args.push("--sport".to_string());
                args.push(range.iptables_arg());
            }
            MatchExpr::DestinationPort(range) => {
                args.push("--dport".to_string());
                args.push(range.iptables_arg());
            }
            MatchExpr::ConnState(states) => {
                let states: Vec<String> = states.iter().map(ToString::to_string).collect();
                args.extend(["-m".to_string(), "conntrack".to_string(), "--ctstate".to_string()]);
                args.push(states.join(","));
            }
            MatchExpr::InInterface(name) => {
                args.push("-i".to_string());
                args.push(name.clone());
            }
            MatchExpr::OutInterface(name) => {
                args.push("-o".to_string());
                args.push(name.clone());
            }
        }
    }

    args.extend(["-m".to_string(), "comment".to_string(), "--comment".to_string()]);
    args.push(rule.id.to_tag());

    args.push("-j".to_string());
    args.push(rule.action.verb().to_string());
    match &rule.action {
        Action::Reject(reason) => {
            if let Some(arg) = reason.iptables_arg(family) {
                args.push("--reject-with".to_string());
                args.push(arg.to_string());
            }
        }
        Action::Log {
            prefix: Some(prefix),
        } => {
            args.push("--log-prefix".to_string());
            args.push(prefix.clone());
        }
        _ => {}
    }
    args
}

fn decode_protocol(prot: &str) -> Option<Protocol> {
    match prot {
        "tcp" | "6" => Some(Protocol::Tcp),
        "udp" | "17" => Some(Protocol::Udp),
        "icmp" | "1" | "ipv6-icmp" | "icmpv6" | "58" => Some(Protocol::Icmp),
        _ => None,
    }
}

fn decode_network(text: &str) -> Result<Option<AddrMatch>> {
    if matches!(text, "0.0.0.0/0" | "::/0" | "anywhere") {
        return Ok(None);
    }
    text.parse::<IpNetwork>()
        .map(|net| Some(AddrMatch::Network(net)))
        .map_err(|e| Error::Parse {
            row: 0,
            message: format!("invalid address '{text}': {e}"),
        })
}

fn decode_interface(text: &str) -> Option<String> {
    (text != "*" && !text.starts_with('!')).then(|| text.to_string())
}

fn decode_range(text: &str) -> Option<AddrMatch> {
    let (start, end) = text.split_once('-')?;
    Some(AddrMatch::Range {
        start: start.parse::<IpAddr>().ok()?,
        end: end.parse::<IpAddr>().ok()?,
    })
}

fn decode_ports(text: &str) -> Option<PortRange> {
    match text.split_once(':') {
        Some((start, end)) => PortRange::new(start.parse().ok()?, end.parse().ok()?).ok(),
        None => PortRange::new(text.parse().ok()?, text.parse().ok()?).ok(),
    }
}

/// Match details decoded from the free-form tail of a listing line.
#[derive(Default)]
struct Extras {
    src_range: Option<AddrMatch>,
    dst_range: Option<AddrMatch>,
    sport: Option<PortRange>,
    dport: Option<PortRange>,
    states: Option<Vec<ConnState>>,
    reject_with: Option<RejectReason>,
    log_prefix: Option<String>,
}

fn decode_extras(extra: &str) -> Extras {
    let mut extras = Extras::default();

    // Strip the comment and a quoted log prefix before tokenizing
    let mut text = extra.to_string();
    if let Some(start) = text.find("/* ")
        && let Some(len) = text[start..].find(" */")
    {
        text.replace_range(start..start + len + 3, "");
    }
    if let Some(start) = text.find("prefix \"") {
        let value_start = start + "prefix \"".len();
        if let Some(len) = text[value_start..].find('"') {
            extras.log_prefix = Some(text[value_start..value_start + len].to_string());
            text.replace_range(start..value_start + len + 1, "");
        }
    }

    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        let next = tokens.get(i + 1).copied();
        if let Some(value) = token.strip_prefix("spt:").or_else(|| token.strip_prefix("spts:")) {
            extras.sport = decode_ports(value);
        } else if let Some(value) = token.strip_prefix("dpt:").or_else(|| token.strip_prefix("dpts:")) {
            extras.dport = decode_ports(value);
        } else if token == "ctstate" || token == "state" {
            extras.states = next.map(|list| {
                list.split(',')
                    .filter_map(|s| s.parse::<ConnState>().ok())
                    .collect()
            });
            i += 1;
        } else if token == "reject-with" {
            extras.reject_with = next.and_then(RejectReason::from_iptables_arg);
            i += 1;
        } else if token == "range" && i >= 2 && tokens[i - 1] == "IP" {
            let range = next.and_then(decode_range);
            match tokens[i - 2] {
                "source" => extras.src_range = range,
                "destination" => extras.dst_range = range,
                _ => {}
            }
            i += 1;
        }
        i += 1;
    }
    extras
}

/// Rebuilds a managed rule from a listing row.
///
/// Returns `Ok(None)` for rules without an fwsync tag. Matches are decoded
/// best-effort in canonical order; identity comes from the tag alone.
pub fn decode_rule(row: &IptRow, scope: Scope) -> Result<Option<RuleSpec>> {
    let Some(id) = row.comment.as_deref().and_then(RuleId::from_tag) else {
        return Ok(None);
    };
    let extras = decode_extras(&row.extra);
    let with_row = |e: Error| match e {
        Error::Parse { message, .. } => Error::Parse {
            row: row.num,
            message,
        },
        other => other,
    };

    let action = match row.target.as_str() {
        "ACCEPT" => Action::Accept,
        "DROP" => Action::Drop,
        "REJECT" => Action::Reject(extras.reject_with.unwrap_or_default()),
        "LOG" => Action::Log {
            prefix: extras.log_prefix.clone(),
        },
        other => {
            return Err(Error::Parse {
                row: row.num,
                message: format!("managed rule {id} has unsupported target '{other}'"),
            });
        }
    };

    let mut matches = Vec::new();
    if let Some(protocol) = decode_protocol(&row.prot) {
        matches.push(MatchExpr::Protocol(protocol));
    }
    if let Some(addr) = extras
        .src_range
        .or(decode_network(&row.source).map_err(with_row)?)
    {
        matches.push(MatchExpr::Source(addr));
    }
    if let Some(addr) = extras
        .dst_range
        .or(decode_network(&row.destination).map_err(with_row)?)
    {
        matches.push(MatchExpr::Destination(addr));
    }
    if let Some(range) = extras.sport {
        matches.push(MatchExpr::SourcePort(range));
    }
    if let Some(range) = extras.dport {
        matches.push(MatchExpr::DestinationPort(range));
    }
    if let Some(states) = extras.states.filter(|s| !s.is_empty()) {
        matches.push(MatchExpr::ConnState(states));
    }
    if let Some(name) = decode_interface(&row.in_iface) {
        matches.push(MatchExpr::InInterface(name));
    }
    if let Some(name) = decode_interface(&row.out_iface) {
        matches.push(MatchExpr::OutInterface(name));
    }

    Ok(Some(RuleSpec {
        id,
        table: scope.table(),
        chain: scope.chain(),
        matches,
        action,
        handle: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{Chain, Table};

    fn scope() -> Scope {
        Scope::new(Table::Filter, Chain::Input).unwrap()
    }

    fn web_allow() -> RuleSpec {
        RuleSpec::new("web-allow", Table::Filter, Chain::Input, Action::Accept)
            .with_match(MatchExpr::DestinationPort(PortRange::single(443)))
            .with_match(MatchExpr::Protocol(Protocol::Tcp))
    }

    #[test]
    fn test_rule_args_protocol_first() {
        let args = rule_args(&web_allow(), Family::Ipv4);
        assert_eq!(
            args,
            [
                "-p", "tcp", "--dport", "443", "-m", "comment", "--comment", "fwsync:web-allow",
                "-j", "ACCEPT"
            ]
        );
    }

    #[test]
    fn test_rule_args_full() {
        let rule = RuleSpec::new(
            "full",
            Table::Filter,
            Chain::Input,
            Action::Reject(RejectReason::AdminProhibited),
        )
        .with_match(MatchExpr::Protocol(Protocol::Udp))
        .with_match(MatchExpr::Source(AddrMatch::Range {
            start: "fd00::1".parse().unwrap(),
            end: "fd00::9".parse().unwrap(),
        }))
        .with_match(MatchExpr::SourcePort(PortRange { start: 1000, end: 2000 }))
        .with_match(MatchExpr::ConnState(vec![ConnState::New, ConnState::Established]))
        .with_match(MatchExpr::InInterface("eth+".into()));

        let args = rule_args(&rule, Family::Ipv6).join(" ");
        assert_eq!(
            args,
            "-p udp -m iprange --src-range fd00::1-fd00::9 --sport 1000:2000 \
             -m conntrack --ctstate NEW,ESTABLISHED -i eth+ \
             -m comment --comment fwsync:full -j REJECT --reject-with icmp6-adm-prohibited"
        );
    }

    #[test]
    fn test_log_prefix_arg() {
        let rule = RuleSpec::new(
            "log",
            Table::Filter,
            Chain::Input,
            Action::Log {
                prefix: Some("fw drop: ".into()),
            },
        );
        let args = rule_args(&rule, Family::Ipv4);
        assert_eq!(args[args.len() - 2..], ["--log-prefix", "fw drop: "]);
    }

    fn decode(line: &str) -> Option<RuleSpec> {
        let row = ColumnMap::iptables(Family::Ipv4)
            .unwrap()
            .decode(line)
            .unwrap()
            .unwrap();
        decode_rule(&row, scope()).unwrap()
    }

    #[test]
    fn test_decode_managed_rule() {
        let rule = decode(
            "1  12  720 ACCEPT  6  --  eth0  *  10.0.0.0/8  0.0.0.0/0  tcp dpt:443 ctstate NEW,ESTABLISHED /* fwsync:web-allow */",
        )
        .unwrap();
        assert_eq!(rule.id, RuleId::from("web-allow"));
        assert_eq!(rule.action, Action::Accept);
        assert_eq!(rule.handle, None);
        assert_eq!(
            rule.matches,
            [
                MatchExpr::Protocol(Protocol::Tcp),
                MatchExpr::Source(AddrMatch::Network("10.0.0.0/8".parse().unwrap())),
                MatchExpr::DestinationPort(PortRange::single(443)),
                MatchExpr::ConnState(vec![ConnState::New, ConnState::Established]),
                MatchExpr::InInterface("eth0".into()),
            ]
        );
    }

    #[test]
    fn test_decode_reject_and_log() {
        let reject = decode(
            "2 0 0 REJECT all -- * * 0.0.0.0/0 0.0.0.0/0 /* fwsync:r */ reject-with icmp-host-prohibited",
        )
        .unwrap();
        assert_eq!(reject.action, Action::Reject(RejectReason::HostProhibited));

        let log = decode(
            "3 0 0 LOG all -- * * 0.0.0.0/0 0.0.0.0/0 source IP range 10.0.0.1-10.0.0.9 /* fwsync:l */ LOG flags 0 level 4 prefix \"fw drop: \"",
        )
        .unwrap();
        assert_eq!(
            log.action,
            Action::Log {
                prefix: Some("fw drop: ".into())
            }
        );
        assert!(matches!(
            log.matches.as_slice(),
            [MatchExpr::Source(AddrMatch::Range { .. })]
        ));
    }

    #[test]
    fn test_decode_foreign_rule() {
        assert!(decode("4 0 0 ACCEPT all -- lo * 0.0.0.0/0 0.0.0.0/0").is_none());
        assert!(decode("5 0 0 ACCEPT all -- lo * 0.0.0.0/0 0.0.0.0/0 /* allow loopback */").is_none());
        // Accounting rule without -j
        assert!(decode("7 5 300 tcp -- * * 0.0.0.0/0 0.0.0.0/0").is_none());
    }

    #[test]
    fn test_decode_unsupported_target() {
        let row = ColumnMap::iptables(Family::Ipv4)
            .unwrap()
            .decode("6 0 0 MASQUERADE all -- * * 0.0.0.0/0 0.0.0.0/0 /* fwsync:m */")
            .unwrap()
            .unwrap();
        let err = decode_rule(&row, scope()).unwrap_err();
        assert!(matches!(err, Error::Parse { row: 6, .. }));
    }

    #[test]
    fn test_handles_are_rejected() {
        assert!(line_number(Locator::Handle(3)).is_err());
        assert_eq!(line_number(Locator::Line(3)).unwrap(), 3);
    }
}
