//! Stable rule identities and the tag that carries them through the backend
//!
//! A [`RuleId`] is an opaque byte string chosen by the caller. It is stamped
//! onto every managed rule as a comment (`-m comment` for iptables, `comment`
//! for nft, the comment TLV of the rule user data for netlink) so that the rule
//! can be recognised on a later fetch no matter where it sits in the chain.
//!
//! # Tag format
//!
//! - `fwsync:<id>` when every byte is in `[A-Za-z0-9._:/@+-]`
//! - `fwsync#<hex>` otherwise
//!
//! Both forms survive `iptables -L` and `nft list` output without quoting or
//! escaping, and neither can contain `*/` or `"`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use super::error::{Error, Result};

pub const TAG_PREFIX: &str = "fwsync:";
pub const TAG_PREFIX_HEX: &str = "fwsync#";

/// Longest identifier accepted, in bytes.
///
/// Hex encoding doubles the length; with the prefix the tag stays under the
/// 255-byte limit of both the xt_comment match and the nft comment TLV.
pub const MAX_ID_LEN: usize = 120;

/// Bytes taken from the SHA-256 digest for content-derived identities.
const DERIVED_ID_BYTES: usize = 16;

const HEX_MARKER: &str = "hex:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(Vec<u8>);

impl RuleId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Derives an identity from the canonical JSON of the rule's semantic content.
    ///
    /// Two rules with identical table, chain, matches and action always derive
    /// the same identity.
    pub fn derive(content: &impl Serialize) -> Result<Self> {
        let canonical = serde_json::to_vec(content)?;
        let digest = Sha256::digest(&canonical);
        Ok(Self(digest[..DERIVED_ID_BYTES].to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::validation("id", "Rule ID cannot be empty"));
        }
        if self.0.len() > MAX_ID_LEN {
            return Err(Error::validation(
                "id",
                format!("Rule ID too long ({} bytes, max {MAX_ID_LEN})", self.0.len()),
            ));
        }
        Ok(())
    }

    fn is_plain(&self) -> bool {
        self.0.iter().copied().all(is_tag_byte)
    }

    /// Encodes the identity as the comment tag stored in the backend.
    pub fn to_tag(&self) -> String {
        if self.is_plain() {
            // is_tag_byte admits ASCII only
            format!("{TAG_PREFIX}{}", String::from_utf8_lossy(&self.0))
        } else {
            format!("{TAG_PREFIX_HEX}{}", hex::encode(&self.0))
        }
    }

    /// Recovers an identity from a backend comment.
    ///
    /// Returns `None` for comments that were not written by fwsync, including
    /// malformed hex payloads.
    pub fn from_tag(comment: &str) -> Option<Self> {
        let comment = comment.trim();
        if let Some(plain) = comment.strip_prefix(TAG_PREFIX) {
            if plain.is_empty() || !plain.bytes().all(is_tag_byte) {
                return None;
            }
            return Some(Self(plain.as_bytes().to_vec()));
        }
        let encoded = comment.strip_prefix(TAG_PREFIX_HEX)?;
        hex::decode(encoded).ok().filter(|b| !b.is_empty()).map(Self)
    }

    /// Parses the textual form produced by [`fmt::Display`].
    pub fn parse(text: &str) -> Result<Self> {
        let id = match text.strip_prefix(HEX_MARKER) {
            Some(encoded) => Self(hex::decode(encoded).map_err(|e| {
                Error::validation("id", format!("Invalid hex rule ID: {e}"))
            })?),
            None => Self(text.as_bytes().to_vec()),
        };
        id.validate()?;
        Ok(id)
    }
}

const fn is_tag_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b':' | b'/' | b'@' | b'+')
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if !text.starts_with(HEX_MARKER) && !text.chars().any(char::is_control) => {
                f.write_str(text)
            }
            _ => write!(f, "{HEX_MARKER}{}", hex::encode(&self.0)),
        }
    }
}

impl From<&str> for RuleId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for RuleId {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl Serialize for RuleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RuleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_tag() {
        let id = RuleId::from("web-allow");
        assert_eq!(id.to_tag(), "fwsync:web-allow");
        assert_eq!(RuleId::from_tag("fwsync:web-allow"), Some(id));
    }

    #[test]
    fn test_unsafe_bytes_are_hex_encoded() {
        let id = RuleId::from("allow */ \"quoted\"");
        let tag = id.to_tag();
        assert!(tag.starts_with(TAG_PREFIX_HEX));
        assert!(!tag.contains('"'));
        assert!(!tag.contains("*/"));
        assert_eq!(RuleId::from_tag(&tag), Some(id));
    }

    #[test]
    fn test_foreign_comments_are_not_ids() {
        assert_eq!(RuleId::from_tag("allow ssh"), None);
        assert_eq!(RuleId::from_tag("fwsync:"), None);
        assert_eq!(RuleId::from_tag("fwsync#zz"), None);
        assert_eq!(RuleId::from_tag("fwsync:has space"), None);
    }

    #[test]
    fn test_validate_limits() {
        assert!(RuleId::new(Vec::new()).validate().is_err());
        assert!(RuleId::new(vec![0xff; MAX_ID_LEN]).validate().is_ok());
        assert!(RuleId::new(vec![b'a'; MAX_ID_LEN + 1]).validate().is_err());
        // Worst case tag still fits the 255-byte comment limit
        assert!(RuleId::new(vec![0xff; MAX_ID_LEN]).to_tag().len() < 255);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = RuleId::derive(&("filter", "INPUT", 443)).unwrap();
        let b = RuleId::derive(&("filter", "INPUT", 443)).unwrap();
        let c = RuleId::derive(&("filter", "INPUT", 80)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_bytes().len(), DERIVED_ID_BYTES);
    }

    #[test]
    fn test_display_and_serde() {
        let binary = RuleId::new(vec![0, 1, 2, 254]);
        assert_eq!(binary.to_string(), "hex:000102fe");
        let json = serde_json::to_string(&binary).unwrap();
        assert_eq!(json, "\"hex:000102fe\"");
        let back: RuleId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, binary);

        let text: RuleId = serde_json::from_str("\"web-allow\"").unwrap();
        assert_eq!(text, RuleId::from("web-allow"));
        assert!(serde_json::from_str::<RuleId>("\"\"").is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_tag_recovers_any_id(bytes in proptest::collection::vec(any::<u8>(), 1..=MAX_ID_LEN)) {
            let id = RuleId::new(bytes);
            let tag = id.to_tag();
            prop_assert!(tag.is_ascii());
            prop_assert!(!tag.contains(char::is_whitespace));
            prop_assert_eq!(RuleId::from_tag(&tag), Some(id));
        }

        #[test]
        fn test_display_parses_back(bytes in proptest::collection::vec(any::<u8>(), 1..=MAX_ID_LEN)) {
            let id = RuleId::new(bytes);
            prop_assert_eq!(RuleId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
