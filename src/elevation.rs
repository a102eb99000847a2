//! Privilege elevation for backend commands
//!
//! fwsync usually runs as an unprivileged user and only elevates the backend
//! binaries themselves (`iptables`, `ip6tables`, `nft`). Nothing else is ever
//! run through an elevation wrapper.
//!
//! # Elevation Strategy
//!
//! - **Already root**: the backend binary is run directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `FWSYNC_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for scripts with sudoers NOPASSWD rules.
//!   Example: `FWSYNC_ELEVATION_METHOD=sudo fwsync reconcile rules.json`
//!
//! - `FWSYNC_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Example
//!
//! ```no_run
//! use fwsync::elevation::create_elevated_iptables_command;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_iptables_command(Path::new("iptables"), &["-t", "filter", "-S"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use tokio::process::Command;

pub const ELEVATION_METHOD_ENV: &str = "FWSYNC_ELEVATION_METHOD";
pub const NO_ELEVATION_ENV: &str = "FWSYNC_TEST_NO_ELEVATION";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit or run as root")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `FWSYNC_ELEVATION_METHOD`
    #[error("Invalid FWSYNC_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
///
/// Paths containing a separator are checked directly.
pub(crate) fn binary_exists(name: &OsStr) -> bool {
    let path = Path::new(name);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(wrapper: &str, program: &OsStr, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

/// Internal helper to build an elevated command for a backend program.
///
/// Callers go through the per-backend functions so that only firewall
/// binaries are ever elevated.
fn build_elevated_command(program: &OsStr, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict test mode override
    if std::env::var_os(NO_ELEVATION_ENV).is_some() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct root execution
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit method override
    if let Ok(method) = std::env::var(ELEVATION_METHOD_ENV) {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(OsStr::new(&method)) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists(OsStr::new("run0")) {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists(OsStr::new("pkexec")) {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}

/// Creates an elevated `iptables`/`ip6tables` command.
///
/// `program` is the configured binary (`iptables`, `ip6tables-legacy`, an
/// absolute path...). Arguments are passed without shell interpretation.
///
/// # Errors
///
/// Returns `Err` if no usable elevation method is available.
pub fn create_elevated_iptables_command(
    program: &Path,
    args: &[&str],
) -> Result<Command, ElevationError> {
    build_elevated_command(program.as_os_str(), args)
}

/// Creates an elevated `nft` command.
///
/// # Errors
///
/// Returns `Err` if no usable elevation method is available.
pub fn create_elevated_nft_command(program: &Path, args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(program.as_os_str(), args)
}
