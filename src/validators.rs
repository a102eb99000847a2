//! Input validation for values that end up on a backend command line
//!
//! Every string that reaches `iptables`/`nft` argv or a netlink attribute
//! passes through one of these checks first. Arguments are never interpreted
//! by a shell, but nft re-tokenizes its argv, so quoting characters are
//! rejected outright rather than escaped.

/// Longest log prefix accepted by the xt_LOG target.
pub const MAX_LOG_PREFIX_LEN: usize = 29;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// A single trailing `+` is accepted as the iptables prefix wildcard (`eth+`).
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    let stem = name.strip_suffix('+').unwrap_or(name);

    if stem.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if stem == "." || stem == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a log prefix.
///
/// Log prefixes appear in kernel logs and on the nft command line, so only a
/// conservative character set is allowed.
///
/// # Errors
///
/// Returns `Err` if:
/// - Prefix is empty
/// - Prefix exceeds 29 characters
/// - Prefix contains characters outside `[A-Za-z0-9 _:.-]`
pub fn validate_log_prefix(prefix: &str) -> Result<String, String> {
    if prefix.is_empty() {
        return Err("Log prefix cannot be empty".to_string());
    }

    if prefix.len() > MAX_LOG_PREFIX_LEN {
        return Err(format!(
            "Log prefix too long (max {MAX_LOG_PREFIX_LEN} chars)"
        ));
    }

    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | ':' | '.'))
    {
        return Err("Log prefix contains invalid characters".to_string());
    }

    Ok(prefix.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_port() {
        assert!(validate_port(0).is_err());
        assert_eq!(validate_port(22), Ok(22));
        assert_eq!(validate_port(65535), Ok(65535));
    }

    #[test]
    fn test_validate_port_range() {
        assert_eq!(validate_port_range(1000, 2000), Ok((1000, 2000)));
        assert_eq!(validate_port_range(80, 80), Ok((80, 80)));
        assert!(validate_port_range(2000, 1000).is_err());
        assert!(validate_port_range(0, 10).is_err());
    }

    #[test]
    fn test_validate_interface() {
        assert!(validate_interface("eth0").is_ok());
        assert!(validate_interface("wg-vpn.10").is_ok());
        assert!(validate_interface("eth+").is_ok());
        assert!(validate_interface("").is_err());
        assert!(validate_interface("+").is_err());
        assert!(validate_interface("eth0+x").is_err());
        assert!(validate_interface("..").is_err());
        assert!(validate_interface("eth0\"; drop").is_err());
        assert!(validate_interface("averyveryverylongname").is_err());
    }

    #[test]
    fn test_validate_log_prefix() {
        assert_eq!(validate_log_prefix("fwsync drop: "), Ok("fwsync drop: ".to_string()));
        assert!(validate_log_prefix("").is_err());
        assert!(validate_log_prefix("quote\"inside").is_err());
        assert!(validate_log_prefix(&"x".repeat(30)).is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_validate_port_rejects_zero(port in any::<u16>()) {
            let result = validate_port(port);
            if port == 0 {
                prop_assert!(result.is_err());
            } else {
                prop_assert_eq!(result.unwrap(), port);
            }
        }

        #[test]
        fn test_validate_port_range_consistency(
            start in 1u16..=65535,
            end in 1u16..=65535
        ) {
            let result = validate_port_range(start, end);
            if start <= end {
                prop_assert_eq!(result.unwrap(), (start, end));
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_validate_interface_length_constraint(name in "[a-zA-Z0-9_-]{1,20}") {
            let result = validate_interface(&name);
            if name.len() <= 15 {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_validate_interface_char_constraint(
            valid_prefix in "[a-zA-Z0-9_-]{1,10}",
            invalid_char in "[^a-zA-Z0-9._+-]"
        ) {
            let invalid_name = format!("{valid_prefix}{invalid_char}");
            prop_assert!(validate_interface(&invalid_name).is_err());
        }

        #[test]
        fn test_log_prefix_never_contains_quotes(prefix in "\\PC{1,29}") {
            if let Ok(valid) = validate_log_prefix(&prefix) {
                prop_assert!(!valid.contains('"'));
                prop_assert!(!valid.contains('\''));
            }
        }
    }
}
