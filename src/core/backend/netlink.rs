//! nf_tables over netlink (`netlink` feature)
//!
//! Same table/chain layout as the `nft` adapter (`ip filter input` ...), but
//! rules are built as expression lists and sent in netlink batches, so every
//! multi-step change is one kernel transaction. Identity is carried in the
//! rule user data as the comment TLV `nft` itself writes, which keeps managed
//! rules readable with `nft list`.
//!
//! rustables objects are not `Send`; all netlink work runs on the blocking
//! pool and is built from owned values inside the task.
//!
//! rustables always sends NEWRULE with `NLM_F_APPEND`. Inserting at the head
//! of the chain and replacing by handle need other flags, so those batches
//! are finalized, the NEWRULE header is rewritten, and the bytes are sent on
//! a netlink socket opened here.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use rustables::data_type::ip_to_vec;
use rustables::expr::{
    Bitwise, Cmp, CmpOp, Conntrack, ConntrackKey, ExpressionVariant, HighLevelPayload, IPv4HeaderField,
    IPv6HeaderField, IcmpCode, Immediate, Log, Meta, MetaType, NetworkHeaderField, Register, Reject,
    RejectType, TCPHeaderField, TransportHeaderField, UDPHeaderField, Verdict, VerdictKind,
    VerdictType,
};
use rustables::{
    list_rules_for_chain, Batch, Chain, ChainPolicy, ChainType, Hook, HookClass, MsgType,
    ProtocolFamily, Rule, Table,
};
use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::{ChainOps, Located, Locator};
use crate::core::error::{Error, Result};
use crate::core::rule::{
    Action, AddrMatch, Chain as RuleChain, ConnState, Family, MatchExpr, PortRange, Protocol,
    RejectReason, RuleSpec, Scope, Table as RuleTable,
};
use crate::core::rule_id::RuleId;
use crate::core::stream::{Page, PageWindow, RowInfo};

/// `NFTNL_UDATA_RULE_COMMENT`
const UDATA_COMMENT: u8 = 0;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
/// `(NFNL_SUBSYS_NFTABLES << 8) | NFT_MSG_NEWRULE`
const NEWRULE_MSG: u16 = (10 << 8) | 6;

const NLM_F_REQUEST: u16 = 0x001;
const NLM_F_ACK: u16 = 0x004;
const NLM_F_REPLACE: u16 = 0x100;
const NLM_F_CREATE: u16 = 0x400;

/// Where a NEWRULE sent through [`placed_batch`] lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// No position and no `NLM_F_APPEND`: the kernel links the rule first.
    Head,
    /// Swaps the rule with this handle; the handle and position are kept.
    Replace(u64),
}

impl Placement {
    const fn flags(self) -> u16 {
        match self {
            Self::Head => NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE,
            Self::Replace(_) => NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE,
        }
    }
}

pub struct NetlinkTarget {
    family: Family,
    scope: Scope,
    chain_ready: AtomicBool,
}

impl NetlinkTarget {
    pub fn new(family: Family, scope: Scope) -> Self {
        Self {
            family,
            scope,
            chain_ready: AtomicBool::new(false),
        }
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Family, Scope) -> Result<T> + Send + 'static,
    {
        let (family, scope) = (self.family, self.scope);
        tokio::task::spawn_blocking(move || work(family, scope))
            .await
            .map_err(|e| Error::Internal(format!("netlink task failed: {e}")))?
    }

    /// Hands `finish` a batch that already creates the table and chain (in
    /// the same transaction) if this adapter has not done so yet.
    async fn transact<F>(&self, finish: F) -> Result<()>
    where
        F: FnOnce(Batch, &Chain, Family) -> Result<()> + Send + 'static,
    {
        let create = !self.chain_ready.load(Ordering::Acquire);
        self.blocking(move |family, scope| {
            let table = table_for(family, scope);
            let chain = chain_for(&table, scope);
            let mut batch = Batch::new();
            if create {
                batch.add(&table, MsgType::Add);
                batch.add(&chain, MsgType::Add);
            }
            finish(batch, &chain, family)
        })
        .await?;
        self.chain_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Sends a batch built by `fill` through rustables.
    async fn send<F>(&self, fill: F) -> Result<()>
    where
        F: FnOnce(&mut Batch, &Chain, Family) -> Result<()> + Send + 'static,
    {
        self.transact(move |mut batch, chain, family| {
            fill(&mut batch, chain, family)?;
            batch.send().map_err(netlink)
        })
        .await
    }

    async fn place(&self, rule: &RuleSpec, placement: Placement) -> Result<()> {
        let spec = rule.clone();
        self.transact(move |batch, chain, family| {
            let (bytes, seq) = placed_batch(batch, chain, &spec, family, placement)?;
            transmit(&bytes, seq)
        })
        .await
    }
}

fn netlink(e: impl std::fmt::Display) -> Error {
    Error::Netlink(e.to_string())
}

const fn protocol_family(family: Family) -> ProtocolFamily {
    match family {
        Family::Ipv4 => ProtocolFamily::Ipv4,
        Family::Ipv6 => ProtocolFamily::Ipv6,
    }
}

fn table_for(family: Family, scope: Scope) -> Table {
    Table::new(protocol_family(family)).with_name(scope.table().as_str())
}

fn chain_for(table: &Table, scope: Scope) -> Chain {
    let (class, priority, kind) = match (scope.table(), scope.chain()) {
        (RuleTable::Filter, c) => (hook_class(c), 0, ChainType::Filter),
        (RuleTable::Nat, c @ (RuleChain::Prerouting | RuleChain::Output)) => {
            (hook_class(c), -100, ChainType::Nat)
        }
        (RuleTable::Nat, c) => (hook_class(c), 100, ChainType::Nat),
        (RuleTable::Mangle, RuleChain::Output) => (HookClass::Out, -150, ChainType::Route),
        (RuleTable::Mangle, c) => (hook_class(c), -150, ChainType::Filter),
        (RuleTable::Raw, c) => (hook_class(c), -300, ChainType::Filter),
    };
    Chain::new(table)
        .with_name(scope.chain().hook_name())
        .with_hook(Hook::new(class, priority))
        .with_type(kind)
        .with_policy(ChainPolicy::Accept)
}

const fn hook_class(chain: RuleChain) -> HookClass {
    match chain {
        RuleChain::Prerouting => HookClass::PreRouting,
        RuleChain::Input => HookClass::In,
        RuleChain::Forward => HookClass::Forward,
        RuleChain::Output => HookClass::Out,
        RuleChain::Postrouting => HookClass::PostRouting,
    }
}

/// Rule user data holding one comment TLV: type, length, bytes, NUL.
pub fn comment_udata(comment: &str) -> Vec<u8> {
    let mut udata = Vec::with_capacity(comment.len() + 3);
    udata.push(UDATA_COMMENT);
    udata.push(u8::try_from(comment.len() + 1).unwrap_or(u8::MAX));
    udata.extend_from_slice(comment.as_bytes());
    udata.push(0);
    udata
}

/// Finds the comment TLV in rule user data.
pub fn udata_comment(udata: &[u8]) -> Option<String> {
    let mut rest = udata;
    while let [kind, len, tail @ ..] = rest {
        let len = usize::from(*len);
        if tail.len() < len {
            return None;
        }
        let (value, next) = tail.split_at(len);
        if *kind == UDATA_COMMENT {
            let value = value.strip_suffix(&[0]).unwrap_or(value);
            return std::str::from_utf8(value).ok().map(str::to_string);
        }
        rest = next;
    }
    None
}

const fn l4proto_number(protocol: Protocol, family: Family) -> Option<u8> {
    match (protocol, family) {
        (Protocol::Tcp, _) => Some(6),
        (Protocol::Udp, _) => Some(17),
        (Protocol::Icmp, Family::Ipv4) => Some(1),
        (Protocol::Icmp, Family::Ipv6) => Some(58),
        (Protocol::All, _) => None,
    }
}

const fn conn_state_bit(state: ConnState) -> u32 {
    match state {
        ConnState::Invalid => 1,
        ConnState::Established => 2,
        ConnState::Related => 4,
        ConnState::New => 8,
        ConnState::Untracked => 64,
    }
}

fn addr_payload(family: Family, source: bool) -> HighLevelPayload {
    let field = match (family, source) {
        (Family::Ipv4, true) => NetworkHeaderField::IPv4(IPv4HeaderField::Saddr),
        (Family::Ipv4, false) => NetworkHeaderField::IPv4(IPv4HeaderField::Daddr),
        (Family::Ipv6, true) => NetworkHeaderField::IPv6(IPv6HeaderField::Saddr),
        (Family::Ipv6, false) => NetworkHeaderField::IPv6(IPv6HeaderField::Daddr),
    };
    HighLevelPayload::Network(field)
}

fn port_payload(protocol: Option<Protocol>, source: bool) -> Result<HighLevelPayload> {
    let field = match (protocol, source) {
        (Some(Protocol::Tcp), true) => TransportHeaderField::Tcp(TCPHeaderField::Sport),
        (Some(Protocol::Tcp), false) => TransportHeaderField::Tcp(TCPHeaderField::Dport),
        (Some(Protocol::Udp), true) => TransportHeaderField::Udp(UDPHeaderField::Sport),
        (Some(Protocol::Udp), false) => TransportHeaderField::Udp(UDPHeaderField::Dport),
        _ => {
            return Err(Error::validation(
                "port",
                "Port matching requires a tcp or udp protocol predicate",
            ));
        }
    };
    Ok(HighLevelPayload::Transport(field))
}

fn match_addr(rule: Rule, family: Family, source: bool, addr: &AddrMatch) -> Result<Rule> {
    let rule = rule.with_expr(addr_payload(family, source).build());
    match addr {
        AddrMatch::Network(net) => {
            let (network, mask) = network_parts(net);
            let zero = vec![0u8; mask.len()];
            Ok(rule
                .with_expr(Bitwise::new(mask, zero).map_err(netlink)?)
                .with_expr(Cmp::new(CmpOp::Eq, network)))
        }
        AddrMatch::Range { start, end } => Ok(rule
            .with_expr(Cmp::new(CmpOp::Gte, ip_to_vec(*start)))
            .with_expr(Cmp::new(CmpOp::Lte, ip_to_vec(*end)))),
    }
}

/// Network address and mask bytes in network order.
fn network_parts(net: &IpNetwork) -> (Vec<u8>, Vec<u8>) {
    (ip_to_vec(net.network()), ip_to_vec(net.mask()))
}

fn match_port(rule: Rule, protocol: Option<Protocol>, source: bool, range: &PortRange) -> Result<Rule> {
    let rule = rule.with_expr(port_payload(protocol, source)?.build());
    if range.is_single() {
        return Ok(rule.with_expr(Cmp::new(CmpOp::Eq, range.start.to_be_bytes())));
    }
    Ok(rule
        .with_expr(Cmp::new(CmpOp::Gte, range.start.to_be_bytes()))
        .with_expr(Cmp::new(CmpOp::Lte, range.end.to_be_bytes())))
}

/// Interface name bytes as nft compares them: NUL-terminated, or a bare
/// prefix for `eth+` wildcards.
fn iface_bytes(name: &str) -> Vec<u8> {
    match name.strip_suffix('+') {
        Some(stem) => stem.as_bytes().to_vec(),
        None => {
            let mut bytes = name.as_bytes().to_vec();
            bytes.push(0);
            bytes
        }
    }
}

fn reject_expr(reason: RejectReason) -> Result<Reject> {
    let code = match reason {
        RejectReason::TcpReset => {
            return Ok(Reject::default().with_type(RejectType::TcpRst));
        }
        RejectReason::PortUnreachable => IcmpCode::PortUnreach,
        RejectReason::HostUnreachable => IcmpCode::HostUnreach,
        RejectReason::NetUnreachable => IcmpCode::NoRoute,
        RejectReason::AdminProhibited => IcmpCode::AdminProhibited,
        other => {
            return Err(Error::validation(
                "action",
                format!("Reject reason {other} is not supported by the netlink backend"),
            ));
        }
    };
    Ok(Reject::default()
        .with_type(RejectType::IcmpxUnreach)
        .with_icmp_code(code))
}

/// Builds the expression list for a rule, tagged with its identity.
fn build_rule(chain: &Chain, spec: &RuleSpec, family: Family) -> Result<Rule> {
    let protocol = spec.protocol();
    let mut rule = Rule::new(chain)
        .map_err(netlink)?
        .with_userdata(comment_udata(&spec.id.to_tag()));

    // Protocol first: transport payloads depend on it
    if let Some(number) = protocol.and_then(|p| l4proto_number(p, family)) {
        rule = rule
            .with_expr(Meta::new(MetaType::L4Proto))
            .with_expr(Cmp::new(CmpOp::Eq, [number]));
    }

    for expr in &spec.matches {
        rule = match expr {
            MatchExpr::Protocol(_) => rule,
            MatchExpr::Source(addr) => match_addr(rule, family, true, addr)?,
            MatchExpr::Destination(addr) => match_addr(rule, family, false, addr)?,
            MatchExpr::SourcePort(range) => match_port(rule, protocol, true, range)?,
            MatchExpr::DestinationPort(range) => match_port(rule, protocol, false, range)?,
            MatchExpr::ConnState(states) => {
                let mask = states.iter().fold(0u32, |acc, s| acc | conn_state_bit(*s));
                rule.with_expr(Conntrack::new(ConntrackKey::State))
                    .with_expr(Bitwise::new(mask.to_ne_bytes(), 0u32.to_ne_bytes()).map_err(netlink)?)
                    .with_expr(Cmp::new(CmpOp::Neq, 0u32.to_ne_bytes()))
            }
            MatchExpr::InInterface(name) => rule
                .with_expr(Meta::new(MetaType::IifName))
                .with_expr(Cmp::new(CmpOp::Eq, iface_bytes(name))),
            MatchExpr::OutInterface(name) => rule
                .with_expr(Meta::new(MetaType::OifName))
                .with_expr(Cmp::new(CmpOp::Eq, iface_bytes(name))),
        };
    }

    Ok(match &spec.action {
        Action::Accept => rule.with_expr(Immediate::new_verdict(VerdictKind::Accept)),
        Action::Drop => rule.with_expr(Immediate::new_verdict(VerdictKind::Drop)),
        Action::Reject(reason) => rule.with_expr(reject_expr(*reason)?),
        Action::Log { prefix } => {
            rule.with_expr(Log::new(None, prefix.clone()).map_err(netlink)?)
        }
    })
}

/// Verdict of a listed rule. Match predicates are not decoded back.
fn decode_action(rule: &Rule) -> Option<Action> {
    let accept = Verdict::default().with_code(VerdictType::Accept);
    let drop = Verdict::default().with_code(VerdictType::Drop);
    let mut action = None;
    for expr in rule.get_expressions()?.iter() {
        match expr.get_data() {
            Some(ExpressionVariant::Immediate(imm)) if imm.get_dreg() == Some(&Register::Verdict) => {
                let verdict = imm.get_data().and_then(|d| d.get_verdict());
                if verdict == Some(&accept) {
                    action = Some(Action::Accept);
                } else if verdict == Some(&drop) {
                    action = Some(Action::Drop);
                }
            }
            Some(ExpressionVariant::Reject(_)) => action = Some(Action::Reject(RejectReason::default())),
            Some(ExpressionVariant::Log(_)) => action = action.or(Some(Action::Log { prefix: None })),
            _ => {}
        }
    }
    action
}

fn decode_rule(rule: &Rule, scope: Scope) -> Option<Located> {
    let handle = *rule.get_handle()?;
    let id = rule
        .get_userdata()
        .and_then(|udata| udata_comment(udata))
        .and_then(|comment| RuleId::from_tag(&comment))?;
    let action = decode_action(rule)?;
    Some(Located {
        rule: RuleSpec {
            id,
            table: scope.table(),
            chain: scope.chain(),
            matches: Vec::new(),
            action,
            handle: Some(handle),
        },
        at: Locator::Handle(handle),
    })
}

/// All rules of the scope's chain; a missing table or chain lists as empty.
fn list_chain(family: Family, scope: Scope) -> Result<Vec<Rule>> {
    let table = table_for(family, scope);
    let chain = chain_for(&table, scope);
    match list_rules_for_chain(&chain) {
        Ok(rules) => Ok(rules),
        Err(e) if e.to_string().contains("No such file or directory") => Ok(Vec::new()),
        Err(e) => Err(netlink(e)),
    }
}

fn handle_of(at: Locator) -> Result<u64> {
    match at {
        Locator::Handle(handle) => Ok(handle),
        Locator::Line(line) => Err(Error::Internal(format!(
            "netlink rules are addressed by handle (got line {line})"
        ))),
    }
}

/// Applies a page window to an already materialized listing.
fn window_rows<T>(items: Vec<T>, window: PageWindow) -> (Vec<T>, bool) {
    let offset = usize::try_from(window.offset()).unwrap_or(usize::MAX);
    let end = window
        .end()
        .map_or(usize::MAX, |end| usize::try_from(end).unwrap_or(usize::MAX));
    let has_more = items.len() > end;
    let rows = items.into_iter().skip(offset).take(end.saturating_sub(offset)).collect();
    (rows, has_more)
}

#[async_trait]
impl ChainOps for NetlinkTarget {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn family(&self) -> Family {
        self.family
    }

    async fn fetch(&self) -> Result<Vec<Located>> {
        self.blocking(|family, scope| {
            let rules = list_chain(family, scope)?;
            let total = rules.len();
            let managed: Vec<Located> = rules.iter().filter_map(|r| decode_rule(r, scope)).collect();
            debug!(%scope, total, managed = managed.len(), "Listed chain over netlink");
            Ok(managed)
        })
        .await
    }

    async fn append(&self, rule: &RuleSpec) -> Result<()> {
        let spec = rule.clone();
        self.send(move |batch, chain, family| {
            batch.add(&build_rule(chain, &spec, family)?, MsgType::Add);
            Ok(())
        })
        .await?;
        info!(scope = %self.scope, id = %rule.id, "Appended rule");
        Ok(())
    }

    async fn prepend(&self, rule: &RuleSpec) -> Result<()> {
        self.place(rule, Placement::Head).await?;
        info!(scope = %self.scope, id = %rule.id, "Inserted rule");
        Ok(())
    }

    async fn remove(&self, at: Locator) -> Result<()> {
        let handle = handle_of(at)?;
        self.send(move |batch, chain, _| {
            batch.add(&Rule::new(chain).map_err(netlink)?.with_handle(handle), MsgType::Del);
            Ok(())
        })
        .await?;
        info!(scope = %self.scope, handle, "Deleted rule");
        Ok(())
    }

    async fn replace(&self, at: Locator, rule: &RuleSpec) -> Result<()> {
        let handle = handle_of(at)?;
        self.place(rule, Placement::Replace(handle)).await?;
        info!(scope = %self.scope, handle, id = %rule.id, "Replaced rule");
        Ok(())
    }

    async fn page(&self, page: u64, limit: u64) -> Result<Page> {
        let window = PageWindow::page(page, limit)?;
        self.blocking(move |family, scope| {
            let rules = list_chain(family, scope)?;
            let described: Vec<(Option<u64>, String)> = rules
                .iter()
                .map(|r| (r.get_handle().copied(), describe(r, scope)))
                .collect();
            let (rows, has_more) = window_rows(described, window);
            let offset = window.offset();
            Ok(Page {
                rows: rows
                    .into_iter()
                    .zip(offset..)
                    .map(|((handle, row), row_no)| RowInfo { row_no, handle, row })
                    .collect(),
                has_more,
            })
        })
        .await
    }
}

/// Appends the NEWRULE for `spec` to `batch`, finalizes it and rewrites the
/// NEWRULE flags for `placement`. Returns the bytes and the NEWRULE sequence.
fn placed_batch(
    mut batch: Batch,
    chain: &Chain,
    spec: &RuleSpec,
    family: Family,
    placement: Placement,
) -> Result<(Vec<u8>, u32)> {
    let mut rule = build_rule(chain, spec, family)?;
    if let Placement::Replace(handle) = placement {
        rule = rule.with_handle(handle);
    }
    batch.add(&rule, MsgType::Add);
    let mut bytes = batch.finalize();
    let seq = set_rule_flags(&mut bytes, placement.flags())?;
    Ok((bytes, seq))
}

#[derive(Debug, Clone, Copy)]
struct MsgHeader {
    offset: usize,
    len: usize,
    kind: u16,
    flags: u16,
    seq: u32,
}

fn field<const N: usize>(bytes: &[u8], at: usize) -> Option<[u8; N]> {
    bytes.get(at..at.checked_add(N)?)?.try_into().ok()
}

/// Netlink message headers in a buffer, stopping at the first malformed one.
fn headers(bytes: &[u8]) -> Vec<MsgHeader> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let (Some(len), Some(kind), Some(flags), Some(seq)) = (
        field(bytes, offset).map(u32::from_ne_bytes),
        field(bytes, offset + 4).map(u16::from_ne_bytes),
        field(bytes, offset + 6).map(u16::from_ne_bytes),
        field(bytes, offset + 8).map(u32::from_ne_bytes),
    ) {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len < NLMSG_HDRLEN || len > bytes.len() - offset {
            break;
        }
        found.push(MsgHeader {
            offset,
            len,
            kind,
            flags,
            seq,
        });
        offset += len.next_multiple_of(4);
    }
    found
}

/// Overwrites the flags of the only NEWRULE message and returns its sequence.
fn set_rule_flags(bytes: &mut [u8], flags: u16) -> Result<u32> {
    let mut rules = headers(bytes).into_iter().filter(|h| h.kind == NEWRULE_MSG);
    let (Some(rule), None) = (rules.next(), rules.next()) else {
        return Err(Error::Internal("batch must hold exactly one NEWRULE message".into()));
    };
    bytes[rule.offset + 6..rule.offset + 8].copy_from_slice(&flags.to_ne_bytes());
    Ok(rule.seq)
}

/// Sends a finalized batch and waits for the kernel to acknowledge `seq`.
fn transmit(batch: &[u8], seq: u32) -> Result<()> {
    let sock = socket::socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkNetFilter,
    )
    .map_err(netlink)?;
    let fd = sock.as_raw_fd();
    let kernel = NetlinkAddr::new(0, 0);

    let mut sent = 0;
    while sent < batch.len() {
        sent += socket::sendto(fd, &batch[sent..], &kernel, MsgFlags::empty()).map_err(netlink)?;
    }

    let mut reply = vec![0u8; 16 * 1024];
    loop {
        let len = socket::recv(fd, &mut reply, MsgFlags::empty()).map_err(netlink)?;
        if len == 0 {
            return Err(Error::Netlink("netlink socket closed before the rule was acknowledged".into()));
        }
        for header in headers(&reply[..len]) {
            if header.kind != NLMSG_ERROR {
                continue;
            }
            let code = field(&reply[..len], header.offset + NLMSG_HDRLEN).map_or(0, i32::from_ne_bytes);
            if code != 0 {
                return Err(netlink(Errno::from_raw(-code)));
            }
            if header.seq == seq {
                return Ok(());
            }
        }
    }
}

/// One-line summary of a listed rule for paged output.
fn describe(rule: &Rule, scope: Scope) -> String {
    let tag = rule
        .get_userdata()
        .and_then(|udata| udata_comment(udata))
        .unwrap_or_else(|| "-".to_string());
    let action = decode_action(rule).map_or_else(|| "?".to_string(), |a| a.to_string());
    let exprs = rule.get_expressions().map_or(0, |e| e.iter().count());
    format!("{scope} {action} exprs={exprs} comment={tag}")
}
