//! Core rule reconciliation functionality
//!
//! This module contains the rule model, the backend adapters and the
//! reconciliation logic. It provides:
//!
//! - [`rule`]: Rule specifications, match predicates and table/chain scopes
//! - [`rule_id`]: Stable rule identities and their comment tag encoding
//! - [`backend`]: The `RuleTarget` adapter trait and its iptables, nft and netlink variants
//! - [`reconcile`]: Delta computation and remove-before-add application
//! - [`stream`]: Paginated, cancellable reading of backend command output
//! - [`desired`]: Loading desired rule sets from JSON documents
//! - [`error`]: Error types for backend operations
//! - [`rule_constraints`]: Business rules for valid field combinations

pub mod backend;
pub mod columns;
pub mod desired;
pub mod error;
pub mod exec;
pub mod reconcile;
pub mod rule;
pub mod rule_constraints;
pub mod rule_id;
pub mod stream;

#[cfg(test)]
pub mod test_helpers;
