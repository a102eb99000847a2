use thiserror::Error;

use crate::elevation::ElevationError;

/// Core error types for fwsync
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A backend command exited unsuccessfully or could not be spawned
    #[error("{program} failed: {message}")]
    Command {
        program: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Input validation failed; nothing was sent to the backend
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Backend output could not be decoded
    #[error("Parse error at row {row}: {message}")]
    Parse { row: u64, message: String },

    /// nf_tables netlink request failed
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] ElevationError),

    /// The streaming reader was cancelled by its caller before completing
    #[error("Command output stream cancelled")]
    Cancelled,

    /// A reconcile batch stopped on its first failing operation
    #[error("Reconcile aborted after {removed} removal(s) and {added} addition(s): {source}")]
    Reconcile {
        added: usize,
        removed: usize,
        #[source]
        source: Box<Error>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Caller errors are rejected before any backend call.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation { .. } => true,
            Self::Reconcile { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    /// The backend's literal diagnostic text, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Command { stderr, .. } => stderr.as_deref(),
            Self::Netlink(msg) => Some(msg),
            Self::Reconcile { source, .. } => source.stderr(),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Command { exit_code, .. } => *exit_code,
            Self::Reconcile { source, .. } => source.exit_code(),
            _ => None,
        }
    }

    /// Operator-facing explanation of this error.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Self::Validation { field, message } => {
                ErrorTranslation::new(format!("Invalid rule: {field}: {message}"))
                    .with_suggestion("Nothing was changed; fix the rule definition and retry")
            }
            Self::Elevation(e) => ErrorTranslation::new(format!("Could not elevate privileges: {e}"))
                .with_suggestion("Run as root, or set FWSYNC_ELEVATION_METHOD to sudo, run0 or pkexec"),
            Self::Reconcile { source, .. } => source.translate(),
            other => match other.stderr() {
                Some(stderr) if !stderr.trim().is_empty() => BackendErrorPattern::match_error(stderr),
                _ => BackendErrorPattern::match_error(&other.to_string()),
            },
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables/nft diagnostic patterns and their translations
pub struct BackendErrorPattern;

impl BackendErrorPattern {
    /// Matches backend stderr against known patterns and returns an operator-facing translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run fwsync as root or through sudo/run0")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Stale line number: the chain changed between lookup and delete/replace
        if lower.contains("index of deletion too big")
            || lower.contains("index of replacement too big")
            || lower.contains("index of insertion too big")
        {
            return ErrorTranslation::new("The chain changed while the operation was in flight")
                .with_suggestion("Another process modified the same chain")
                .with_suggestion("Serialize reconciliations per table/chain and retry");
        }

        if lower.contains("xtables lock") || lower.contains("resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process is holding the xtables lock")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("command not found") || lower.contains("no such file or directory (os error") {
            return ErrorTranslation::new("Backend binary is not installed or not found in PATH")
                .with_suggestion("Install iptables or nftables with your package manager")
                .with_suggestion("Or point FWSYNC_IPTABLES_COMMAND / FWSYNC_NFT_COMMAND at the binary");
        }

        if lower.contains("bad rule") {
            return ErrorTranslation::new("No matching rule exists in the chain")
                .with_suggestion("The rule was removed by someone else; list the chain and retry");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Unknown chain, target or match extension")
                .with_suggestion("Check that the chain exists in the selected table")
                .with_suggestion("Load the needed xt_* kernel module (e.g. xt_comment, xt_conntrack)");
        }

        if lower.contains("table does not exist") || lower.contains("do you need to insmod") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("Load the table's kernel module (e.g. iptable_raw)")
                .with_suggestion("Check the table name: filter, nat, mangle or raw");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Ensure IP addresses and network masks are valid")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Simple_rule_management");
        }

        if lower.contains("invalid port") || (lower.contains("port") && lower.contains("range")) {
            return ErrorTranslation::new("Invalid port or port range")
                .with_suggestion("Port numbers must be between 1 and 65535")
                .with_suggestion("For port ranges, ensure start <= end");
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use proper IP format: 192.168.1.1 or 192.168.1.0/24")
                .with_suggestion("For IPv6: 2001:db8::1 or 2001:db8::/32");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        ErrorTranslation::new(format!("Firewall error: {}", msg.trim()))
            .with_suggestion("Check the backend's error message above for details")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
