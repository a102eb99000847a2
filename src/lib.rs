//! fwsync - declarative packet-filter rule reconciliation
//!
//! Converges the rules of one iptables/nftables table and chain to a desired
//! list with the fewest additions and removals.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, backend adapters, streaming output reader and reconciler
//! - [`audit`] - Audit logging for privileged operations
//! - [`elevation`] - Privilege escalation for backend commands
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories)
//!
//! # Example
//!
//! ```no_run
//! use fwsync::{BackendSettings, Reconciler, RuleSpec};
//! use fwsync::core::rule::{Action, Chain, MatchExpr, PortRange, Protocol, Table};
//!
//! # async fn run() -> fwsync::Result<()> {
//! let web = RuleSpec::new("web-allow", Table::Filter, Chain::Input, Action::Accept)
//!     .with_match(MatchExpr::Protocol(Protocol::Tcp))
//!     .with_match(MatchExpr::DestinationPort(PortRange::single(443)));
//!
//! let reconciler = Reconciler::new(BackendSettings::default());
//! let summary = reconciler.reconcile("filter", "INPUT", &[web]).await?;
//! println!("added {}, removed {}", summary.added, summary.removed);
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::backend::{BackendKind, BackendSettings, RuleTarget, TargetFactory};
pub use core::error::{Error, Result};
pub use core::reconcile::{Reconciler, UpdateSummary};
pub use core::rule::{RuleSpec, Scope};
pub use core::rule_id::RuleId;
pub use core::stream::{Page, RowInfo};
