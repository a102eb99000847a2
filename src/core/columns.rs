//! Column mapping for `iptables -L -n -v -x --line-numbers` output
//!
//! The listing is whitespace-aligned text with one header line per chain and
//! one column header line. Column layout differs per binary and IP family:
//! `ip6tables` (legacy) prints the `opt` column blank, which drops a token
//! from every data line. Rather than correcting column counts per line, each
//! (backend, family) pair gets a static layout that is validated once when the
//! adapter is built, and rows are decoded by walking that layout.
//!
//! A rule without a `-j` (plain accounting rules) lists with a blank target,
//! so the target column is recognized by looking at the two tokens after
//! `bytes`.

use super::error::{Error, Result};
use super::rule::Family;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Column {
    Num,
    Pkts,
    Bytes,
    Target,
    Prot,
    Opt,
    In,
    Out,
    Source,
    Destination,
}

/// Whether a column always yields a token.
#[derive(Debug, Clone, Copy)]
pub enum Presence {
    Always,
    /// Present only when the token satisfies the predicate.
    Optional(fn(&str) -> bool),
    /// Printed as blank space when the predicate holds for the next token and
    /// the one after it. Decodes as an empty string.
    Blank(fn(&str, Option<&str>) -> bool),
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub column: Column,
    pub presence: Presence,
}

const fn always(column: Column) -> ColumnSpec {
    ColumnSpec {
        column,
        presence: Presence::Always,
    }
}

/// `--`, `-f` and `!f` are the only values iptables prints for `opt`.
fn is_opt_token(token: &str) -> bool {
    matches!(token, "--" | "-f" | "!f")
}

/// Protocol names iptables prints instead of numbers.
const PROTOCOL_NAMES: &[&str] = &[
    "all", "tcp", "udp", "udplite", "icmp", "icmpv6", "ipv6-icmp", "esp", "ah", "sctp", "mh", "gre",
];

fn is_protocol_token(token: &str) -> bool {
    let token = token.strip_prefix('!').unwrap_or(token);
    (!token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())) || PROTOCOL_NAMES.contains(&token)
}

/// The target is blank when a protocol sits in its place and is followed by
/// something that is not a protocol (the `opt` column, or `in` when `opt` is
/// blank too).
fn is_blank_target(token: &str, next: Option<&str>) -> bool {
    is_protocol_token(token) && next.is_some_and(|n| is_opt_token(n) || !is_protocol_token(n))
}

const TARGET: ColumnSpec = ColumnSpec {
    column: Column::Target,
    presence: Presence::Blank(is_blank_target),
};

const IPTABLES_V4: &[ColumnSpec] = &[
    always(Column::Num),
    always(Column::Pkts),
    always(Column::Bytes),
    TARGET,
    always(Column::Prot),
    always(Column::Opt),
    always(Column::In),
    always(Column::Out),
    always(Column::Source),
    always(Column::Destination),
];

const IPTABLES_V6: &[ColumnSpec] = &[
    always(Column::Num),
    always(Column::Pkts),
    always(Column::Bytes),
    TARGET,
    always(Column::Prot),
    ColumnSpec {
        column: Column::Opt,
        presence: Presence::Optional(is_opt_token),
    },
    always(Column::In),
    always(Column::Out),
    always(Column::Source),
    always(Column::Destination),
];

const REQUIRED: &[Column] = &[
    Column::Num,
    Column::Target,
    Column::Source,
    Column::Destination,
];

/// One decoded data line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IptRow {
    pub num: u64,
    pub pkts: u64,
    pub bytes: u64,
    pub target: String,
    pub prot: String,
    pub opt: Option<String>,
    pub in_iface: String,
    pub out_iface: String,
    pub source: String,
    pub destination: String,
    /// Everything after the destination column (match details, comment).
    pub extra: String,
    /// Content of the trailing `/* ... */`, if any.
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ColumnMap {
    specs: &'static [ColumnSpec],
}

impl ColumnMap {
    /// Layout for `iptables` / `ip6tables` listings.
    pub fn iptables(family: Family) -> Result<Self> {
        let specs = match family {
            Family::Ipv4 => IPTABLES_V4,
            Family::Ipv6 => IPTABLES_V6,
        };
        Self::validated(specs)
    }

    fn validated(specs: &'static [ColumnSpec]) -> Result<Self> {
        let invalid = |msg: String| Error::Internal(format!("Invalid column layout: {msg}"));

        if !matches!(specs.first(), Some(s) if s.column == Column::Num) {
            return Err(invalid("first column must be num".into()));
        }
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|s| s.column == spec.column) {
                return Err(invalid(format!("duplicate column {}", spec.column)));
            }
        }
        for required in REQUIRED {
            if let Some(spec) = specs.iter().find(|s| s.column == *required) {
                if matches!(spec.presence, Presence::Optional(_)) {
                    return Err(invalid(format!("column {required} cannot be optional")));
                }
            } else {
                return Err(invalid(format!("missing column {required}")));
            }
        }
        if matches!(specs.last(), Some(s) if !matches!(s.presence, Presence::Always)) {
            return Err(invalid("last column cannot be optional".into()));
        }
        Ok(Self { specs })
    }

    /// Decodes one listing line.
    ///
    /// Returns `Ok(None)` for chain headers, column headers and blank lines.
    pub fn decode(&self, line: &str) -> Result<Option<IptRow>> {
        let line = line.trim_end();
        let mut tokens = Tokens::new(line);

        let Some(first) = tokens.peek() else {
            return Ok(None);
        };
        if !first.bytes().all(|b| b.is_ascii_digit()) {
            // "Chain INPUT (policy ...)" and "num pkts bytes ..." headers
            return Ok(None);
        }

        let mut row = IptRow::default();
        for spec in self.specs {
            let token = match spec.presence {
                Presence::Always => tokens.next(),
                Presence::Optional(present) => match tokens.peek() {
                    Some(t) if present(t) => tokens.next(),
                    _ => continue,
                },
                Presence::Blank(blank) => match tokens.peek_pair() {
                    (Some(t), next) if blank(t, next) => Some(""),
                    _ => tokens.next(),
                },
            };
            let Some(token) = token else {
                return Err(Error::Parse {
                    row: row.num,
                    message: format!("missing {} column in '{line}'", spec.column),
                });
            };
            let row_no = row.num;
            let number = |token: &str| {
                token.parse::<u64>().map_err(|_| Error::Parse {
                    row: row_no,
                    message: format!("invalid {} value '{token}'", spec.column),
                })
            };
            match spec.column {
                Column::Num => row.num = number(token)?,
                Column::Pkts => row.pkts = number(token)?,
                Column::Bytes => row.bytes = number(token)?,
                Column::Target => row.target = token.to_string(),
                Column::Prot => row.prot = token.to_string(),
                Column::Opt => row.opt = Some(token.to_string()),
                Column::In => row.in_iface = token.to_string(),
                Column::Out => row.out_iface = token.to_string(),
                Column::Source => row.source = token.to_string(),
                Column::Destination => row.destination = token.to_string(),
            }
        }

        row.extra = tokens.rest().trim().to_string();
        row.comment = extract_comment(&row.extra);
        Ok(Some(row))
    }
}

/// Content of the `/* ... */` block xt_comment appends to a listing line.
pub fn extract_comment(extra: &str) -> Option<String> {
    let start = extra.find("/* ")? + 3;
    let len = extra[start..].find(" */")?;
    Some(extra[start..start + len].to_string())
}

/// Whitespace tokenizer that remembers where the unread tail starts.
#[derive(Clone, Copy)]
struct Tokens<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    fn span(&self) -> Option<(usize, usize)> {
        let rest = &self.line[self.pos..];
        let start = self.pos + rest.find(|c: char| !c.is_whitespace())?;
        let end = self.line[start..]
            .find(char::is_whitespace)
            .map_or(self.line.len(), |len| start + len);
        Some((start, end))
    }

    fn peek(&self) -> Option<&'a str> {
        self.span().map(|(start, end)| &self.line[start..end])
    }

    fn next(&mut self) -> Option<&'a str> {
        let (start, end) = self.span()?;
        self.pos = end;
        Some(&self.line[start..end])
    }

    fn peek_pair(&self) -> (Option<&'a str>, Option<&'a str>) {
        let mut ahead = *self;
        (ahead.next(), ahead.next())
    }

    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }
}
