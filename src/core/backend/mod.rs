//! Backend adapters
//!
//! A [`RuleTarget`] is bound to one [`Scope`] and exposes the same operation
//! set for every backend:
//!
//! - [`iptables::IptablesTarget`]: spawns `iptables`/`ip6tables`, parses `-L` listings
//! - [`nft::NftTarget`]: spawns `nft`, parses `nft -a list chain`
//! - `netlink::NetlinkTarget`: talks nf_tables over netlink directly (`netlink` feature)
//!
//! Backends only implement the positional primitives of [`ChainOps`]
//! (fetch, append, prepend, remove, replace). The idempotent contract of
//! [`RuleTarget`] (existence checks, not-found as `false`, validation before
//! any backend call) is shared and lives here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::error::{Error, Result};
use super::reconcile::{self, UpdateSummary};
use super::rule::{Family, RuleSpec, Scope};
use super::stream::Page;

pub mod iptables;
#[cfg(feature = "netlink")]
pub mod netlink;
pub mod nft;

/// Operations against the rules of one (table, chain) scope.
#[async_trait]
pub trait RuleTarget: Send + Sync {
    fn scope(&self) -> Scope;

    fn family(&self) -> Family;

    /// Looks a rule up by `handle` if it is set and non-zero, otherwise by ID.
    async fn exists(&self, rule: &RuleSpec) -> Result<bool>;

    /// Appends the rule unless it already exists.
    async fn add(&self, rule: &RuleSpec) -> Result<bool>;

    /// Prepends the rule unless it already exists.
    async fn insert(&self, rule: &RuleSpec) -> Result<bool>;

    /// Removes the rule. An absent rule is not an error.
    async fn delete(&self, rule: &RuleSpec) -> Result<bool>;

    /// Replaces an existing rule's matches and action in place.
    async fn update(&self, rule: &RuleSpec) -> Result<bool>;

    /// Managed rules in backend order.
    async fn list(&self) -> Result<Vec<RuleSpec>>;

    /// Raw backend rows, paginated at the source.
    async fn list_page(&self, page: u64, limit: u64) -> Result<Page>;

    /// Converges the scope to `desired` with a single listing. See
    /// [`reconcile::update_all`].
    async fn update_all(&self, desired: &[RuleSpec]) -> Result<UpdateSummary>;
}

/// Where a fetched rule sits in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    /// 1-based iptables line number
    Line(u64),
    /// nf_tables rule handle
    Handle(u64),
}

/// A managed rule as found in the backend.
#[derive(Debug, Clone)]
pub struct Located {
    pub rule: RuleSpec,
    pub at: Locator,
}

/// Positional primitives a backend provides for its bound scope.
///
/// `fetch` returns managed rules only; rules without an fwsync tag are
/// invisible here.
#[async_trait]
pub trait ChainOps: Send + Sync {
    fn scope(&self) -> Scope;

    fn family(&self) -> Family;

    async fn fetch(&self) -> Result<Vec<Located>>;

    async fn append(&self, rule: &RuleSpec) -> Result<()>;

    async fn prepend(&self, rule: &RuleSpec) -> Result<()>;

    async fn remove(&self, at: Locator) -> Result<()>;

    async fn replace(&self, at: Locator, rule: &RuleSpec) -> Result<()>;

    async fn page(&self, page: u64, limit: u64) -> Result<Page>;
}

fn locate<'a>(entries: &'a [Located], rule: &RuleSpec) -> Option<&'a Located> {
    match rule.handle {
        Some(handle) if handle > 0 => entries.iter().find(|e| e.rule.handle == Some(handle)),
        _ => entries.iter().find(|e| e.rule.id == rule.id),
    }
}

/// Rejects rules that do not belong to the target's scope or fail validation.
pub fn check_rule<T: ChainOps + ?Sized>(target: &T, rule: &RuleSpec) -> Result<()> {
    rule.validate(target.family())?;
    let scope = target.scope();
    if rule.table != scope.table() || rule.chain != scope.chain() {
        return Err(Error::validation(
            "scope",
            format!(
                "Rule {} targets {}/{} but this adapter is bound to {scope}",
                rule.id, rule.table, rule.chain
            ),
        ));
    }
    Ok(())
}

#[async_trait]
impl<T: ChainOps> RuleTarget for T {
    fn scope(&self) -> Scope {
        ChainOps::scope(self)
    }

    fn family(&self) -> Family {
        ChainOps::family(self)
    }

    async fn exists(&self, rule: &RuleSpec) -> Result<bool> {
        let entries = self.fetch().await?;
        Ok(locate(&entries, rule).is_some())
    }

    async fn add(&self, rule: &RuleSpec) -> Result<bool> {
        check_rule(self, rule)?;
        if self.exists(rule).await? {
            return Ok(false);
        }
        self.append(rule).await?;
        Ok(true)
    }

    async fn insert(&self, rule: &RuleSpec) -> Result<bool> {
        check_rule(self, rule)?;
        if self.exists(rule).await? {
            return Ok(false);
        }
        self.prepend(rule).await?;
        Ok(true)
    }

    async fn delete(&self, rule: &RuleSpec) -> Result<bool> {
        let entries = self.fetch().await?;
        let Some(found) = locate(&entries, rule) else {
            return Ok(false);
        };
        self.remove(found.at).await?;
        Ok(true)
    }

    async fn update(&self, rule: &RuleSpec) -> Result<bool> {
        check_rule(self, rule)?;
        let entries = self.fetch().await?;
        let Some(found) = locate(&entries, rule) else {
            return Ok(false);
        };
        // The stored tag must keep the identity the rule was found under
        let mut replacement = rule.clone();
        replacement.id = found.rule.id.clone();
        self.replace(found.at, &replacement).await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<RuleSpec>> {
        Ok(self.fetch().await?.into_iter().map(|e| e.rule).collect())
    }

    async fn list_page(&self, page: u64, limit: u64) -> Result<Page> {
        self.page(page, limit).await
    }

    async fn update_all(&self, desired: &[RuleSpec]) -> Result<UpdateSummary> {
        reconcile::update_all(self, desired).await
    }
}

/// Which backend implementation to build
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    #[default]
    Iptables,
    Nft,
    Netlink,
}

/// Everything needed to open a [`RuleTarget`] for a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub family: Family,
    pub iptables_command: PathBuf,
    pub ip6tables_command: PathBuf,
    pub nft_command: PathBuf,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            family: Family::default(),
            iptables_command: PathBuf::from("iptables"),
            ip6tables_command: PathBuf::from("ip6tables"),
            nft_command: PathBuf::from("nft"),
        }
    }
}

/// Builds adapters bound to a scope.
pub trait TargetFactory: Send + Sync {
    fn open(&self, scope: Scope) -> Result<Box<dyn RuleTarget>>;
}

impl TargetFactory for BackendSettings {
    fn open(&self, scope: Scope) -> Result<Box<dyn RuleTarget>> {
        match self.kind {
            BackendKind::Iptables => {
                let program = match self.family {
                    Family::Ipv4 => &self.iptables_command,
                    Family::Ipv6 => &self.ip6tables_command,
                };
                Ok(Box::new(iptables::IptablesTarget::new(
                    program.clone(),
                    self.family,
                    scope,
                )?))
            }
            BackendKind::Nft => Ok(Box::new(nft::NftTarget::new(
                self.nft_command.clone(),
                self.family,
                scope,
            ))),
            #[cfg(feature = "netlink")]
            BackendKind::Netlink => Ok(Box::new(netlink::NetlinkTarget::new(self.family, scope))),
            #[cfg(not(feature = "netlink"))]
            BackendKind::Netlink => Err(Error::validation(
                "backend",
                "fwsync was built without the netlink feature",
            )),
        }
    }
}
