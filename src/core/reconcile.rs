//! Desired-state reconciliation
//!
//! [`update_all`] converges one scope to a desired rule list:
//!
//! 1. List the managed rules currently in the scope (the only backend listing)
//! 2. Plan the delta by rule ID: desired IDs already present are left
//!    untouched, missing ones are added, leftovers are removed
//! 3. Apply every removal by position, then append every addition
//!
//! Rules are never compared by content. A rule whose matches changed but
//! whose ID did not is retained as-is; give it a new ID (or use
//! [`RuleSpec::with_derived_id`]) to have it replaced.
//!
//! The first backend failure aborts the remaining batch and is returned as
//! [`Error::Reconcile`] with the counts completed so far.
//!
//! [`RuleSpec::with_derived_id`]: crate::core::rule::RuleSpec::with_derived_id

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use super::backend::{ChainOps, Located, Locator, RuleTarget, TargetFactory};
use super::error::{Error, Result};
use super::rule::{Action, Family, RuleSpec, Scope};
use super::rule_id::RuleId;
use super::stream::Page;

/// Outcome of one [`update_all`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub changed: bool,
    pub added: usize,
    pub removed: usize,
}

impl std::ops::AddAssign for UpdateSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.changed |= rhs.changed;
        self.added += rhs.added;
        self.removed += rhs.removed;
    }
}

/// Edit script computed by [`plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Delta {
    pub add: Vec<RuleSpec>,
    pub remove: Vec<RuleSpec>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Computes the minimal add/remove lists that turn `existing` into `desired`.
///
/// Both lists keep the order of their source.
pub fn plan(desired: &[RuleSpec], existing: &[RuleSpec]) -> Delta {
    let present: HashSet<&RuleId> = existing.iter().map(|r| &r.id).collect();
    let wanted: HashSet<&RuleId> = desired.iter().map(|r| &r.id).collect();

    Delta {
        add: desired
            .iter()
            .filter(|r| !present.contains(&r.id))
            .cloned()
            .collect(),
        remove: existing
            .iter()
            .filter(|r| !wanted.contains(&r.id))
            .cloned()
            .collect(),
    }
}

/// Validates a desired set against the target scope before anything is sent.
///
/// # Errors
///
/// Returns a validation error for invalid rules, rules outside `scope`, or
/// duplicate IDs.
pub fn check_desired(scope: Scope, family: Family, desired: &[RuleSpec]) -> Result<()> {
    let mut seen = HashSet::with_capacity(desired.len());
    for rule in desired {
        rule.validate(family)?;
        if rule.table != scope.table() || rule.chain != scope.chain() {
            return Err(Error::validation(
                "scope",
                format!(
                    "Rule {} targets {}/{} but is being reconciled into {scope}",
                    rule.id, rule.table, rule.chain
                ),
            ));
        }
        if !seen.insert(&rule.id) {
            return Err(Error::validation(
                "id",
                format!("Duplicate rule ID {} in {scope}", rule.id),
            ));
        }
    }
    Ok(())
}

fn aborted(summary: UpdateSummary, source: Error) -> Error {
    Error::Reconcile {
        added: summary.added,
        removed: summary.removed,
        source: Box::new(source),
    }
}

/// Converges `target`'s scope to `desired`. Removals are applied before additions.
///
/// The chain is listed once; removals use the positions from that listing
/// (iptables lines bottom-up, so earlier deletions never shift later ones)
/// and additions are appended without a second existence check.
///
/// `changed` reflects the planned delta; `added`/`removed` count the
/// operations that actually modified the backend.
///
/// # Errors
///
/// Validation errors are returned before the backend is touched. A backend
/// failure while applying the delta is returned as [`Error::Reconcile`].
pub async fn update_all<T: ChainOps + ?Sized>(
    target: &T,
    desired: &[RuleSpec],
) -> Result<UpdateSummary> {
    let scope = ChainOps::scope(target);
    check_desired(scope, ChainOps::family(target), desired)?;

    let existing = ChainOps::fetch(target).await?;
    let wanted: HashSet<&RuleId> = desired.iter().map(|r| &r.id).collect();
    let present: HashSet<&RuleId> = existing.iter().map(|e| &e.rule.id).collect();

    let mut removals: Vec<&Located> = existing
        .iter()
        .filter(|e| !wanted.contains(&e.rule.id))
        .collect();
    removals.sort_by_key(|e| match e.at {
        Locator::Line(line) => Reverse(line),
        Locator::Handle(_) => Reverse(0),
    });
    let additions: Vec<&RuleSpec> = desired
        .iter()
        .filter(|r| !present.contains(&r.id))
        .collect();
    debug!(
        %scope,
        existing = existing.len(),
        desired = desired.len(),
        to_add = additions.len(),
        to_remove = removals.len(),
        "Planned delta"
    );

    let mut summary = UpdateSummary {
        changed: !additions.is_empty() || !removals.is_empty(),
        ..UpdateSummary::default()
    };

    for entry in removals {
        if let Err(e) = target.remove(entry.at).await {
            warn!(%scope, id = %entry.rule.id, error = %e, "Removal failed, aborting reconcile");
            return Err(aborted(summary, e));
        }
        summary.removed += 1;
    }
    for rule in additions {
        if let Err(e) = target.append(rule).await {
            warn!(%scope, id = %rule.id, error = %e, "Addition failed, aborting reconcile");
            return Err(aborted(summary, e));
        }
        summary.added += 1;
    }

    if summary.changed {
        info!(%scope, added = summary.added, removed = summary.removed, "Reconciled");
    } else {
        debug!(%scope, "Already converged");
    }
    Ok(summary)
}

/// Per-scope result of [`Reconciler::reconcile_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScopeReport {
    pub scope: Scope,
    #[serde(flatten)]
    pub summary: UpdateSummary,
}

/// Caller-facing entry point: resolves (table, chain) to a backend target and
/// reconciles or lists it.
///
/// Concurrent calls against the same scope are not serialized here.
pub struct Reconciler<F> {
    factory: F,
}

impl<F: TargetFactory> Reconciler<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Opens a target after validating the scope; no backend is touched
    /// for an invalid (table, chain) pair.
    fn open(&self, table: &str, chain: &str) -> Result<Box<dyn RuleTarget>> {
        let scope = Scope::parse(table, chain)?;
        self.factory.open(scope)
    }

    pub async fn reconcile(
        &self,
        table: &str,
        chain: &str,
        desired: &[RuleSpec],
    ) -> Result<UpdateSummary> {
        let target = self.open(table, chain)?;
        target.update_all(desired).await
    }

    /// Lists the managed rules of a scope and returns the delta `reconcile`
    /// would apply, without applying it.
    pub async fn preview(&self, table: &str, chain: &str, desired: &[RuleSpec]) -> Result<Delta> {
        let target = self.open(table, chain)?;
        check_desired(target.scope(), target.family(), desired)?;
        let existing = target.list().await?;
        Ok(plan(desired, &existing))
    }

    pub async fn list_paged(&self, table: &str, chain: &str, page: u64, limit: u64) -> Result<Page> {
        let target = self.open(table, chain)?;
        target.list_page(page, limit).await
    }

    pub async fn list(&self, table: &str, chain: &str) -> Result<Vec<RuleSpec>> {
        self.open(table, chain)?.list().await
    }

    pub async fn delete(&self, table: &str, chain: &str, id: RuleId) -> Result<bool> {
        let target = self.open(table, chain)?;
        let scope = target.scope();
        let lookup = RuleSpec::new(id, scope.table(), scope.chain(), Action::Accept);
        target.delete(&lookup).await
    }

    /// Groups a mixed rule list by scope and reconciles each scope in
    /// (table, chain) order.
    ///
    /// Only scopes that appear in `desired` are touched.
    pub async fn reconcile_all(&self, desired: &[RuleSpec]) -> Result<Vec<ScopeReport>> {
        let grouped = group_by_scope(desired)?;
        let mut reports = Vec::with_capacity(grouped.len());
        for (scope, rules) in grouped {
            let target = self.factory.open(scope)?;
            let summary = target.update_all(&rules).await?;
            reports.push(ScopeReport { scope, summary });
        }
        Ok(reports)
    }
}

/// Splits rules by (table, chain), validating each pair.
pub fn group_by_scope(rules: &[RuleSpec]) -> Result<BTreeMap<Scope, Vec<RuleSpec>>> {
    let mut grouped: BTreeMap<Scope, Vec<RuleSpec>> = BTreeMap::new();
    for rule in rules {
        grouped.entry(rule.scope()?).or_default().push(rule.clone());
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{Chain, MatchExpr, PortRange, Protocol, Table};
    use crate::core::test_helpers::{MockChain, MockFactory, rule};

    fn input() -> Scope {
        Scope::new(Table::Filter, Chain::Input).unwrap()
    }

    fn ids(rules: &[RuleSpec]) -> Vec<String> {
        rules.iter().map(|r| r.id.to_string()).collect()
    }

    #[test]
    fn test_plan_minimal_edit() {
        let existing = vec![rule("A", 1), rule("B", 2), rule("C", 3)];
        let desired = vec![rule("B", 2), rule("C", 3), rule("D", 4)];
        let delta = plan(&desired, &existing);
        assert_eq!(ids(&delta.add), ["D"]);
        assert_eq!(ids(&delta.remove), ["A"]);
    }

    #[test]
    fn test_plan_ignores_content_changes() {
        let existing = vec![rule("A", 1)];
        let desired = vec![rule("A", 9999)];
        assert!(plan(&desired, &existing).is_empty());
    }

    #[tokio::test]
    async fn test_web_allow_replaces_legacy_allow() {
        let target = MockChain::with_rules(input(), vec![rule("legacy-allow", 80)]);
        let desired = vec![rule("web-allow", 443)];

        let summary = target.update_all(&desired).await.unwrap();
        assert_eq!(
            summary,
            UpdateSummary {
                changed: true,
                added: 1,
                removed: 1
            }
        );
        assert_eq!(ids(&target.list().await.unwrap()), ["web-allow"]);
        // Removal strictly before addition
        assert_eq!(target.operations(), ["remove 1", "append web-allow"]);
    }

    #[tokio::test]
    async fn test_chain_listed_once_per_run() {
        let target = MockChain::with_rules(input(), vec![rule("A", 1), rule("B", 2), rule("C", 3)]);
        let desired = [rule("B", 2), rule("C", 3), rule("D", 4), rule("E", 5)];

        let summary = target.update_all(&desired).await.unwrap();
        assert_eq!((summary.added, summary.removed), (2, 1));
        assert_eq!(target.fetch_count(), 1);
        assert_eq!(target.operations(), ["remove 1", "append D", "append E"]);
    }

    #[tokio::test]
    async fn test_line_removals_run_bottom_up() {
        let target = MockChain::with_rules(
            input(),
            vec![rule("A", 1), rule("B", 2), rule("C", 3), rule("D", 4)],
        )
        .by_line();

        target.update_all(&[rule("B", 2)]).await.unwrap();
        assert_eq!(target.operations(), ["remove 4", "remove 3", "remove 1"]);
        assert_eq!(ids(&target.list().await.unwrap()), ["B"]);
        assert_eq!(target.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let target = MockChain::new(input());
        let desired = vec![rule("a", 1), rule("b", 2)];
        target.update_all(&desired).await.unwrap();
        let ops_after_first = target.operations().len();

        let again = target.update_all(&desired).await.unwrap();
        assert_eq!(again, UpdateSummary::default());
        assert_eq!(target.operations().len(), ops_after_first);
    }

    #[tokio::test]
    async fn test_retained_rules_untouched() {
        let target = MockChain::with_rules(input(), vec![rule("A", 1), rule("B", 2), rule("C", 3)]);
        let before = target.list().await.unwrap();

        target
            .update_all(&[rule("B", 2), rule("C", 3), rule("D", 4)])
            .await
            .unwrap();
        assert_eq!(target.operations(), ["remove 1", "append D"]);

        let after = target.list().await.unwrap();
        assert_eq!(after[0], before[1]);
        assert_eq!(after[1], before[2]);
    }

    #[tokio::test]
    async fn test_empty_desired_clears_managed_rules() {
        let target = MockChain::with_rules(input(), vec![rule("A", 1), rule("B", 2)]);
        let summary = target.update_all(&[]).await.unwrap();
        assert_eq!(summary.removed, 2);
        assert!(target.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mid_batch_failure_reports_progress() {
        let target = MockChain::with_rules(input(), vec![rule("old", 1)]);
        target.fail_on("append", "iptables: Resource temporarily unavailable.");

        let err = target
            .update_all(&[rule("new-1", 2), rule("new-2", 3)])
            .await
            .unwrap_err();
        match &err {
            Error::Reconcile {
                added,
                removed,
                source,
            } => {
                assert_eq!((*added, *removed), (0, 1));
                assert_eq!(
                    source.stderr(),
                    Some("iptables: Resource temporarily unavailable.")
                );
            }
            other => panic!("expected reconcile error, got {other:?}"),
        }
        // The second addition was never attempted
        assert_eq!(target.operations(), ["remove 1"]);
        assert_eq!(err.stderr(), Some("iptables: Resource temporarily unavailable."));
    }

    #[tokio::test]
    async fn test_listing_failure_is_not_wrapped() {
        let target = MockChain::new(input());
        target.fail_on("fetch", "iptables: No chain/target/match by that name.");
        let err = target.update_all(&[rule("a", 1)]).await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_desired_ids_rejected() {
        let target = MockChain::new(input());
        let err = target
            .update_all(&[rule("a", 1), rule("a", 2)])
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(target.operations().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_scope_rejected() {
        let target = MockChain::new(input());
        let outbound = RuleSpec::new("out", Table::Filter, Chain::Output, Action::Accept);
        assert!(target.update_all(&[outbound]).await.unwrap_err().is_validation());
        assert_eq!(target.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_reconciler_rejects_scope_before_opening() {
        let factory = MockFactory::default();
        let reconciler = Reconciler::new(factory.clone());

        let err = reconciler.reconcile("raw", "POSTROUTING", &[]).await.unwrap_err();
        assert!(err.is_validation());
        let err = reconciler.list_paged("raw", "POSTROUTING", 0, 10).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(factory.opened(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_all_groups_scopes() {
        let factory = MockFactory::default();
        let reconciler = Reconciler::new(factory.clone());

        let outbound = RuleSpec::new("dns-out", Table::Filter, Chain::Output, Action::Accept)
            .with_match(MatchExpr::Protocol(Protocol::Udp))
            .with_match(MatchExpr::DestinationPort(PortRange::single(53)));
        let desired = vec![outbound, rule("web", 443), rule("ssh", 22)];

        let reports = reconciler.reconcile_all(&desired).await.unwrap();
        let scopes: Vec<String> = reports.iter().map(|r| r.scope.to_string()).collect();
        assert_eq!(scopes, ["filter/INPUT", "filter/OUTPUT"]);
        assert_eq!(reports[0].summary.added, 2);
        assert_eq!(reports[1].summary.added, 1);

        let again = reconciler.reconcile_all(&desired).await.unwrap();
        assert!(again.iter().all(|r| !r.summary.changed));
    }

    #[tokio::test]
    async fn test_preview_and_delete() {
        let factory = MockFactory::default();
        factory.chain(input()).seed(vec![rule("old", 1)]);
        let reconciler = Reconciler::new(factory.clone());

        let delta = reconciler
            .preview("filter", "INPUT", &[rule("new", 2)])
            .await
            .unwrap();
        assert_eq!(ids(&delta.add), ["new"]);
        assert_eq!(ids(&delta.remove), ["old"]);
        assert!(factory.chain(input()).operations().is_empty());

        assert!(reconciler.delete("filter", "INPUT", RuleId::from("old")).await.unwrap());
        assert!(!reconciler.delete("filter", "INPUT", RuleId::from("old")).await.unwrap());
    }

    #[test]
    fn test_summary_accumulates() {
        let mut total = UpdateSummary::default();
        total += UpdateSummary {
            changed: false,
            added: 0,
            removed: 0,
        };
        total += UpdateSummary {
            changed: true,
            added: 2,
            removed: 1,
        };
        assert_eq!(
            total,
            UpdateSummary {
                changed: true,
                added: 2,
                removed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_mock_chain_fetch_is_counted() {
        let target = MockChain::new(input());
        let _ = target.list().await.unwrap();
        assert_eq!(target.fetch_count(), 1);
    }
}
