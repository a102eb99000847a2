//! Shared test utilities for core module tests
//!
//! Provides an in-memory backend and rule builders so reconcile and adapter
//! contract tests never touch a real firewall. This module is only compiled
//! in test mode.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::backend::{ChainOps, Located, Locator, RuleTarget, TargetFactory};
use crate::core::error::{Error, Result};
use crate::core::rule::{Action, Chain, Family, MatchExpr, PortRange, Protocol, RuleSpec, Scope, Table};
use crate::core::stream::{Page, PageWindow, RowInfo};

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("FWSYNC_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FWSYNC_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// An accepted tcp rule in filter/INPUT matching destination `port`.
pub fn rule(id: &str, port: u16) -> RuleSpec {
    RuleSpec::new(id, Table::Filter, Chain::Input, Action::Accept)
        .with_match(MatchExpr::Protocol(Protocol::Tcp))
        .with_match(MatchExpr::DestinationPort(PortRange::single(port)))
}

#[derive(Debug, Default)]
struct ChainState {
    rules: Vec<RuleSpec>,
    next_handle: u64,
    operations: Vec<String>,
    fetches: usize,
    failures: HashMap<String, String>,
}

impl ChainState {
    fn assign_handle(&mut self, rule: &RuleSpec) -> RuleSpec {
        self.next_handle += 1;
        let mut stored = rule.clone();
        stored.handle = Some(self.next_handle);
        stored
    }

    fn position(&self, at: Locator) -> Result<usize> {
        let found = match at {
            Locator::Handle(handle) => self.rules.iter().position(|r| r.handle == Some(handle)),
            Locator::Line(line) => usize::try_from(line)
                .ok()
                .and_then(|line| line.checked_sub(1))
                .filter(|index| *index < self.rules.len()),
        };
        found.ok_or_else(|| Error::Command {
            program: "mock".into(),
            message: "exited with status 1".into(),
            stderr: Some(format!("Could not process rule: No such file or directory ({at:?})")),
            exit_code: Some(1),
        })
    }
}

/// Stateful in-memory chain with handle semantics like nftables, or line
/// numbers like iptables after [`MockChain::by_line`].
///
/// Clones share state, so a test can keep a handle on a chain that was
/// handed out as a `Box<dyn RuleTarget>`.
#[derive(Debug, Clone)]
pub struct MockChain {
    scope: Scope,
    by_line: bool,
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            by_line: false,
            state: Arc::default(),
        }
    }

    /// Addresses rules by 1-based line number instead of handle.
    pub fn by_line(mut self) -> Self {
        self.by_line = true;
        self
    }

    pub fn with_rules(scope: Scope, rules: Vec<RuleSpec>) -> Self {
        let chain = Self::new(scope);
        chain.seed(rules);
        chain
    }

    /// Places rules in the chain without recording operations.
    pub fn seed(&self, rules: Vec<RuleSpec>) {
        let mut state = self.state();
        for rule in rules {
            let stored = state.assign_handle(&rule);
            state.rules.push(stored);
        }
    }

    /// Makes every later `op` call fail with `stderr`.
    ///
    /// `op` is one of `fetch`, `append`, `prepend`, `remove`, `replace`.
    pub fn fail_on(&self, op: &str, stderr: &str) {
        self.state().failures.insert(op.to_string(), stderr.to_string());
    }

    /// Mutations applied so far, e.g. `["remove 1", "append web"]`.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state().fetches
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_fail(state: &ChainState, op: &str) -> Result<()> {
        match state.failures.get(op) {
            Some(stderr) => Err(Error::Command {
                program: "mock".into(),
                message: "exited with status 1".into(),
                stderr: Some(stderr.clone()),
                exit_code: Some(1),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainOps for MockChain {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn family(&self) -> Family {
        Family::Ipv4
    }

    async fn fetch(&self) -> Result<Vec<Located>> {
        let mut state = self.state();
        state.fetches += 1;
        Self::check_fail(&state, "fetch")?;
        Ok(state
            .rules
            .iter()
            .zip(1u64..)
            .map(|(r, line)| Located {
                rule: r.clone(),
                at: if self.by_line {
                    Locator::Line(line)
                } else {
                    Locator::Handle(r.handle.unwrap_or_default())
                },
            })
            .collect())
    }

    async fn append(&self, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state();
        Self::check_fail(&state, "append")?;
        let stored = state.assign_handle(rule);
        state.rules.push(stored);
        state.operations.push(format!("append {}", rule.id));
        Ok(())
    }

    async fn prepend(&self, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state();
        Self::check_fail(&state, "prepend")?;
        let stored = state.assign_handle(rule);
        state.rules.insert(0, stored);
        state.operations.push(format!("prepend {}", rule.id));
        Ok(())
    }

    async fn remove(&self, at: Locator) -> Result<()> {
        let mut state = self.state();
        Self::check_fail(&state, "remove")?;
        let index = state.position(at)?;
        state.rules.remove(index);
        let (Locator::Line(n) | Locator::Handle(n)) = at;
        state.operations.push(format!("remove {n}"));
        Ok(())
    }

    async fn replace(&self, at: Locator, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state();
        Self::check_fail(&state, "replace")?;
        let index = state.position(at)?;
        let handle = state.rules[index].handle;
        let mut stored = rule.clone();
        stored.handle = handle;
        state.rules[index] = stored;
        state
            .operations
            .push(format!("replace {}", handle.unwrap_or_default()));
        Ok(())
    }

    async fn page(&self, page: u64, limit: u64) -> Result<Page> {
        let window = PageWindow::page(page, limit)?;
        let rows = self.fetch().await?;
        let offset = usize::try_from(window.offset()).unwrap_or(usize::MAX);
        let end = window.end().map_or(usize::MAX, |e| usize::try_from(e).unwrap_or(usize::MAX));
        Ok(Page {
            has_more: rows.len() > end,
            rows: rows
                .into_iter()
                .zip(0u64..)
                .skip(offset)
                .take(end.saturating_sub(offset))
                .map(|(located, row_no)| RowInfo {
                    row_no,
                    handle: located.rule.handle,
                    row: format!("{} {}", located.rule.id, located.rule.action),
                })
                .collect(),
        })
    }
}

/// Hands out one shared [`MockChain`] per scope and counts opens.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    chains: Arc<Mutex<HashMap<Scope, MockChain>>>,
    opened: Arc<Mutex<usize>>,
}

impl MockFactory {
    /// The chain for `scope`, created empty on first use.
    pub fn chain(&self, scope: Scope) -> MockChain {
        self.chains
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(scope)
            .or_insert_with(|| MockChain::new(scope))
            .clone()
    }

    pub fn opened(&self) -> usize {
        *self.opened.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TargetFactory for MockFactory {
    fn open(&self, scope: Scope) -> Result<Box<dyn RuleTarget>> {
        *self.opened.lock().unwrap_or_else(std::sync::PoisonError::into_inner) += 1;
        Ok(Box::new(self.chain(scope)))
    }
}
