//! Shard derivation and literal scrubbing for captured query text.
//!
//! Scrubbing replaces quoted string literals with [`REDACTED_LITERAL`] unless
//! the literal has one of the whitelisted shapes (timestamp, typed GUID,
//! boolean). Unquoted numbers are never touched, so `LIMIT 10` survives.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Replacement for string literals that are not whitelisted.
pub const REDACTED_LITERAL: &str = "'xxx'";

/// Any single-quoted literal, empty ones and doubled quotes included.
static SQL_STRING_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'([^']|'')*'").unwrap_or_else(|_| unreachable!()));

/// First schema-qualified relation after `FROM`.
static SHARD_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)from\s+(\w+|"\w+")\."#).unwrap_or_else(|_| unreachable!()));

static DATETIME_LITERAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^'(\d{4}-\d\d-\d\d \d\d:\d\d:\d\d.\d{6})'$").unwrap_or_else(|_| unreachable!())
});

static GUID_LITERAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^'([A-Z]{3}-\w{8}-\w{4}-\w{4}-\w{4}-\w{12})'$")
        .unwrap_or_else(|_| unreachable!())
});

static BOOL_LITERAL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^'(t|f)'$").unwrap_or_else(|_| unreachable!()));

/// Shard name and shard-free query derived from a captured value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDerivation {
    /// Schema name without quotes, empty when the query is not qualified
    pub shard_name: String,
    /// The value with every `<shard>.` qualifier removed
    pub stripped_value: String,
}

/// Derives the shard (schema) a query addresses.
///
/// Only the first `FROM <schema>.` is considered; multi-schema queries keep
/// the other qualifiers.
#[must_use]
pub fn derive_shard(value: &str) -> ShardDerivation {
    let Some(raw) = SHARD_REGEX
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    else {
        return ShardDerivation {
            shard_name: String::new(),
            stripped_value: value.to_string(),
        };
    };

    ShardDerivation {
        shard_name: raw.replace('"', ""),
        stripped_value: value.replace(&format!("{raw}."), ""),
    }
}

/// Redacts every non-whitelisted string literal in `text`.
#[must_use]
pub fn scrub(text: &str) -> String {
    match SQL_STRING_REGEX.replace_all(text, |caps: &Captures<'_>| {
        let literal = &caps[0];
        if is_whitelisted(literal) {
            literal.to_string()
        } else {
            REDACTED_LITERAL.to_string()
        }
    }) {
        Cow::Borrowed(unchanged) => unchanged.to_string(),
        Cow::Owned(scrubbed) => scrubbed,
    }
}

/// Checks a quoted literal (quotes included) against the safe shapes.
#[must_use]
pub fn is_whitelisted(literal: &str) -> bool {
    DATETIME_LITERAL_REGEX.is_match(literal)
        || GUID_LITERAL_REGEX.is_match(literal)
        || BOOL_LITERAL_REGEX.is_match(literal)
}
