//! `nft` command-line adapter
//!
//! Each scope maps to table `<table>` and base chain `<hook>` in the `ip` or
//! `ip6` family, e.g. `ip filter input`. The table and chain are created on
//! first write. Rules are listed with `nft -a list chain`, which prints one
//! statement per line followed by `# handle N`; identity comes from the rule
//! `comment`.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ChainOps, Located, Locator};
use crate::core::error::{Error, Result};
use crate::core::exec;
use crate::core::rule::{
    Action, AddrMatch, Chain, ConnState, Family, MatchExpr, PortRange, Protocol, RejectReason,
    RuleSpec, Scope, Table,
};
use crate::core::rule_id::RuleId;
use crate::core::stream::{self, Page, PageWindow, RowInfo, StreamOutcome};
use crate::elevation;

const HANDLE_MARKER: &str = "# handle ";

pub struct NftTarget {
    program: PathBuf,
    family: Family,
    scope: Scope,
    chain_ready: AtomicBool,
}

impl NftTarget {
    pub fn new(program: impl Into<PathBuf>, family: Family, scope: Scope) -> Self {
        Self {
            program: program.into(),
            family,
            scope,
            chain_ready: AtomicBool::new(false),
        }
    }

    fn command(&self, args: &[&str]) -> Result<Command> {
        Ok(elevation::create_elevated_nft_command(&self.program, args)?)
    }

    fn location(&self) -> [&'static str; 3] {
        [
            nft_family(self.family),
            self.scope.table().as_str(),
            self.scope.chain().hook_name(),
        ]
    }

    fn listing_command(&self) -> Result<Command> {
        let [family, table, chain] = self.location();
        self.command(&["-a", "list", "chain", family, table, chain])
    }

    /// Creates the table and base chain if this adapter has not done so yet.
    ///
    /// `nft add` is a no-op for objects that already exist.
    async fn ensure_chain(&self) -> Result<()> {
        if self.chain_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let [family, table, chain] = self.location();
        exec::run(self.command(&["add", "table", family, table])?).await?;

        let (kind, priority) = base_chain(self.scope);
        exec::run(self.command(&[
            "add", "chain", family, table, chain, "{", "type", kind, "hook", chain, "priority",
            priority, ";", "}",
        ])?)
        .await?;

        self.chain_ready.store(true, Ordering::Release);
        debug!(scope = %self.scope, "Base chain ready");
        Ok(())
    }

    async fn write_rule(&self, verb: &str, handle: Option<u64>, rule: &RuleSpec) -> Result<()> {
        self.ensure_chain().await?;
        let [family, table, chain] = self.location();
        let handle = handle.map(|h| h.to_string());
        let expr = rule_expr(rule, self.family);

        let mut args = vec![verb, "rule", family, table, chain];
        if let Some(handle) = &handle {
            args.extend(["handle", handle.as_str()]);
        }
        args.extend(expr.iter().map(String::as_str));
        exec::run(self.command(&args)?).await?;
        Ok(())
    }
}

const fn nft_family(family: Family) -> &'static str {
    match family {
        Family::Ipv4 => "ip",
        Family::Ipv6 => "ip6",
    }
}

/// Chain type and named priority for the base chain of a scope.
const fn base_chain(scope: Scope) -> (&'static str, &'static str) {
    match (scope.table(), scope.chain()) {
        (Table::Filter, _) => ("filter", "filter"),
        (Table::Nat, Chain::Prerouting | Chain::Output) => ("nat", "dstnat"),
        (Table::Nat, _) => ("nat", "srcnat"),
        (Table::Mangle, Chain::Output) => ("route", "mangle"),
        (Table::Mangle, _) => ("filter", "mangle"),
        (Table::Raw, _) => ("filter", "raw"),
    }
}

/// Missing table or chain means there is nothing to list yet.
fn is_missing_chain(err: &Error) -> bool {
    err.stderr().is_some_and(|stderr| {
        stderr.contains("No such file or directory") || stderr.contains("does not exist")
    })
}

fn handle_of(at: Locator) -> Result<u64> {
    match at {
        Locator::Handle(handle) => Ok(handle),
        Locator::Line(line) => Err(Error::Internal(format!(
            "nft rules are addressed by handle (got line {line})"
        ))),
    }
}

#[async_trait]
impl ChainOps for NftTarget {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn family(&self) -> Family {
        self.family
    }

    async fn fetch(&self) -> Result<Vec<Located>> {
        let scope = self.scope;
        let parser = move |_: u64, line: &str| -> Result<Option<Located>> {
            let Some((statement, handle)) = split_handle(line) else {
                return Ok(None);
            };
            let Some(rule) = decode_rule(statement, handle, scope)? else {
                debug!(handle, "Skipping unmanaged rule");
                return Ok(None);
            };
            Ok(Some(Located {
                rule,
                at: Locator::Handle(handle),
            }))
        };

        match stream::stream_command(
            self.listing_command()?,
            PageWindow::all(),
            parser,
            CancellationToken::new(),
        )
        .await
        {
            StreamOutcome::Failed(e) if is_missing_chain(&e) => Ok(Vec::new()),
            outcome => outcome.into_page().map(|page| page.rows),
        }
    }

    async fn append(&self, rule: &RuleSpec) -> Result<()> {
        self.write_rule("add", None, rule).await?;
        info!(scope = %self.scope, id = %rule.id, "Appended rule");
        Ok(())
    }

    async fn prepend(&self, rule: &RuleSpec) -> Result<()> {
        self.write_rule("insert", None, rule).await?;
        info!(scope = %self.scope, id = %rule.id, "Inserted rule");
        Ok(())
    }

    async fn remove(&self, at: Locator) -> Result<()> {
        let handle = handle_of(at)?.to_string();
        let [family, table, chain] = self.location();
        exec::run(self.command(&["delete", "rule", family, table, chain, "handle", &handle])?)
            .await?;
        info!(scope = %self.scope, %handle, "Deleted rule");
        Ok(())
    }

    async fn replace(&self, at: Locator, rule: &RuleSpec) -> Result<()> {
        let handle = handle_of(at)?;
        self.write_rule("replace", Some(handle), rule).await?;
        info!(scope = %self.scope, handle, id = %rule.id, "Replaced rule");
        Ok(())
    }

    async fn page(&self, page: u64, limit: u64) -> Result<Page> {
        let window = PageWindow::page(page, limit)?;
        let parser = |index: u64, line: &str| -> Result<Option<RowInfo>> {
            Ok(split_handle(line).map(|(statement, handle)| RowInfo {
                row_no: index,
                handle: Some(handle),
                row: statement.to_string(),
            }))
        };
        match stream::stream_command(self.listing_command()?, window, parser, CancellationToken::new())
            .await
        {
            StreamOutcome::Failed(e) if is_missing_chain(&e) => Ok(Page {
                rows: Vec::new(),
                has_more: false,
            }),
            outcome => outcome.into_page(),
        }
    }
}

/// Splits `<statement> # handle N` into its parts.
fn split_handle(line: &str) -> Option<(&str, u64)> {
    let (statement, handle) = line.trim().rsplit_once(HANDLE_MARKER)?;
    let statement = statement.trim_end();
    // Table and chain headers carry handles too
    if statement.is_empty() || statement.ends_with('{') {
        return None;
    }
    Some((statement, handle.trim().parse().ok()?))
}

/// iptables spells interface wildcards `eth+`, nft `eth*`.
fn iface_to_nft(name: &str) -> String {
    match name.strip_suffix('+') {
        Some(stem) => format!("\"{stem}*\""),
        None => format!("\"{name}\""),
    }
}

fn iface_from_nft(name: &str) -> String {
    match name.strip_suffix('*') {
        Some(stem) => format!("{stem}+"),
        None => name.to_string(),
    }
}

fn l4proto(protocol: Protocol, family: Family) -> Option<&'static str> {
    match (protocol, family) {
        (Protocol::Tcp, _) => Some("tcp"),
        (Protocol::Udp, _) => Some("udp"),
        (Protocol::Icmp, Family::Ipv4) => Some("icmp"),
        (Protocol::Icmp, Family::Ipv6) => Some("ipv6-icmp"),
        (Protocol::All, _) => None,
    }
}

fn port_expr(range: &PortRange) -> String {
    if range.is_single() {
        range.start.to_string()
    } else {
        format!("{}-{}", range.start, range.end)
    }
}

/// Rule statement tokens, passed to nft as separate arguments.
pub fn rule_expr(rule: &RuleSpec, family: Family) -> Vec<String> {
    let addr_kw = nft_family(family).to_string();
    let protocol = rule.protocol();
    let mut expr = Vec::new();

    if let Some(proto) = protocol.and_then(|p| l4proto(p, family)) {
        expr.extend(["meta".to_string(), "l4proto".to_string(), proto.to_string()]);
    }

    for m in &rule.matches {
        match m {
            MatchExpr::Protocol(_) => {}
            MatchExpr::Source(addr) => {
                expr.extend([addr_kw.clone(), "saddr".to_string(), addr.to_string()]);
            }
            MatchExpr::Destination(addr) => {
                expr.extend([addr_kw.clone(), "daddr".to_string(), addr.to_string()]);
            }
            MatchExpr::SourcePort(range) | MatchExpr::DestinationPort(range) => {
                let proto = protocol.and_then(|p| l4proto(p, family)).unwrap_or("tcp");
                let dir = if matches!(m, MatchExpr::SourcePort(_)) {
                    "sport"
                } else {
                    "dport"
                };
                expr.extend([proto.to_string(), dir.to_string(), port_expr(range)]);
            }
            MatchExpr::ConnState(states) => {
                let states: Vec<String> = states
                    .iter()
                    .map(|s| s.as_ref().to_lowercase())
                    .collect();
                expr.extend(["ct".to_string(), "state".to_string(), states.join(",")]);
            }
            MatchExpr::InInterface(name) => {
                expr.extend(["iifname".to_string(), iface_to_nft(name)]);
            }
            MatchExpr::OutInterface(name) => {
                expr.extend(["oifname".to_string(), iface_to_nft(name)]);
            }
        }
    }

    match &rule.action {
        Action::Accept => expr.push("accept".to_string()),
        Action::Drop => expr.push("drop".to_string()),
        Action::Reject(reason) => {
            expr.push("reject".to_string());
            if let Some(args) = reason.nft_args(family) {
                expr.extend(args.iter().map(ToString::to_string));
            }
        }
        Action::Log { prefix } => {
            expr.push("log".to_string());
            if let Some(prefix) = prefix {
                expr.extend(["prefix".to_string(), format!("\"{prefix}\"")]);
            }
        }
    }

    expr.extend(["comment".to_string(), format!("\"{}\"", rule.id.to_tag())]);
    expr
}

/// Splits an nft statement on whitespace, keeping `"..."` strings whole (unquoted).
fn tokenize(statement: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for c in statement.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        tokens.push(current);
    }
    tokens
}

fn decode_addr(text: &str, row: u64) -> Result<AddrMatch> {
    let invalid = |e: String| Error::Parse {
        row,
        message: format!("invalid address '{text}': {e}"),
    };
    if let Some((start, end)) = text.split_once('-') {
        return Ok(AddrMatch::Range {
            start: start.parse::<IpAddr>().map_err(|e| invalid(e.to_string()))?,
            end: end.parse::<IpAddr>().map_err(|e| invalid(e.to_string()))?,
        });
    }
    text.parse::<IpNetwork>()
        .map(AddrMatch::Network)
        .map_err(|e| invalid(e.to_string()))
}

fn decode_port(text: &str, row: u64) -> Result<PortRange> {
    text.parse::<PortRange>().map_err(|e| Error::Parse {
        row,
        message: format!("invalid port '{text}': {e}"),
    })
}

fn decode_proto(text: &str) -> Option<Protocol> {
    match text {
        "tcp" => Some(Protocol::Tcp),
        "udp" => Some(Protocol::Udp),
        "icmp" | "ipv6-icmp" | "icmpv6" => Some(Protocol::Icmp),
        _ => None,
    }
}

fn decode_reject(tokens: &[String]) -> RejectReason {
    use strum::IntoEnumIterator;

    let with: Vec<&str> = tokens.iter().map(String::as_str).collect();
    RejectReason::iter()
        .find(|reason| {
            [Family::Ipv4, Family::Ipv6]
                .into_iter()
                .any(|family| reason.nft_args(family) == Some(with.as_slice()))
        })
        .unwrap_or_default()
}

/// Rebuilds a managed rule from one `nft -a list chain` statement.
///
/// Returns `Ok(None)` for rules without an fwsync comment.
pub fn decode_rule(statement: &str, handle: u64, scope: Scope) -> Result<Option<RuleSpec>> {
    let tokens = tokenize(statement);
    let Some(id) = tokens
        .iter()
        .position(|t| t == "comment")
        .and_then(|i| tokens.get(i + 1))
        .and_then(|c| RuleId::from_tag(c))
    else {
        return Ok(None);
    };

    let mut protocol = None;
    let mut matches = Vec::new();
    let mut action = None;
    let mut i = 0;
    let arg = |i: usize| tokens.get(i).map(String::as_str).unwrap_or_default();

    while i < tokens.len() {
        match (arg(i), arg(i + 1)) {
            ("meta", "l4proto") | ("ip", "protocol") | ("ip6", "nexthdr") => {
                protocol = protocol.or(decode_proto(arg(i + 2)));
                i += 3;
            }
            ("ip" | "ip6", "saddr") => {
                matches.push(MatchExpr::Source(decode_addr(arg(i + 2), handle)?));
                i += 3;
            }
            ("ip" | "ip6", "daddr") => {
                matches.push(MatchExpr::Destination(decode_addr(arg(i + 2), handle)?));
                i += 3;
            }
            (proto @ ("tcp" | "udp"), dir @ ("sport" | "dport")) => {
                protocol = protocol.or(decode_proto(proto));
                let range = decode_port(arg(i + 2), handle)?;
                matches.push(if dir == "sport" {
                    MatchExpr::SourcePort(range)
                } else {
                    MatchExpr::DestinationPort(range)
                });
                i += 3;
            }
            ("ct", "state") => {
                let states = arg(i + 2)
                    .split(',')
                    .filter_map(|s| s.parse::<ConnState>().ok())
                    .collect();
                matches.push(MatchExpr::ConnState(states));
                i += 3;
            }
            ("iifname", name) => {
                matches.push(MatchExpr::InInterface(iface_from_nft(name)));
                i += 2;
            }
            ("oifname", name) => {
                matches.push(MatchExpr::OutInterface(iface_from_nft(name)));
                i += 2;
            }
            ("counter", _) => {
                // counter packets N bytes M
                i += if arg(i + 1) == "packets" { 5 } else { 1 };
            }
            ("accept", _) => {
                action = Some(Action::Accept);
                i += 1;
            }
            ("drop", _) => {
                action = Some(Action::Drop);
                i += 1;
            }
            ("reject", _) => {
                let end = tokens[i..]
                    .iter()
                    .position(|t| t == "comment")
                    .map_or(tokens.len(), |p| i + p);
                action = Some(Action::Reject(decode_reject(&tokens[i + 1..end])));
                i = end;
            }
            ("log", "prefix") => {
                action = Some(Action::Log {
                    prefix: Some(arg(i + 2).to_string()),
                });
                i += 3;
            }
            ("log", _) => {
                action = Some(Action::Log { prefix: None });
                i += 1;
            }
            ("comment", _) => i += 2,
            _ => i += 1,
        }
    }

    let Some(action) = action else {
        return Err(Error::Parse {
            row: handle,
            message: format!("managed rule {id} has no supported verdict: {statement}"),
        });
    };
    if let Some(protocol) = protocol {
        matches.insert(0, MatchExpr::Protocol(protocol));
    }

    Ok(Some(RuleSpec {
        id,
        table: scope.table(),
        chain: scope.chain(),
        matches,
        action,
        handle: Some(handle),
    }))
}
