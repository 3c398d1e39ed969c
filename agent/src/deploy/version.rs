//! Workload version tags
//!
//! Tags look like `v1.4` or `1.4-rc1`: an optional leading `v`, a major and a
//! minor number, and anything after that is ignored. Input that does not match
//! parses to `0.0` so that comparison is always defined.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag assumed when a version cannot be determined.
///
/// Parses to `1.0`, so a failed lookup never outranks a real running tag.
pub const SENTINEL_TAG: &str = "v1.0";

/// A `(major, minor)` version, ordered lexicographically
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionTag {
    pub major: u64,
    pub minor: u64,
}

impl VersionTag {
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Parse a free-form version string, falling back to `0.0`
    pub fn parse(input: &str) -> Self {
        Self::try_parse(input).unwrap_or_default()
    }

    /// Parse a version string, returning `None` when it does not start with
    /// `[v]<digits>.<digits>`
    pub fn try_parse(input: &str) -> Option<Self> {
        let rest = input.strip_prefix('v').unwrap_or(input);
        let (major, rest) = leading_number(rest)?;
        let rest = rest.strip_prefix('.')?;
        let (minor, _) = leading_number(rest)?;
        Some(Self { major, minor })
    }
}

/// Split off a run of ASCII digits. `None` if there are none or the value
/// overflows.
fn leading_number(s: &str) -> Option<(u64, &str)> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(s.len(), |(i, _)| i);
    if end == 0 {
        return None;
    }
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}

/// Compare two tags
pub fn compare(a: &VersionTag, b: &VersionTag) -> Ordering {
    a.cmp(b)
}

/// True if `latest` is strictly newer than `current`
pub fn is_newer(latest: &str, current: &str) -> bool {
    VersionTag::parse(latest) > VersionTag::parse(current)
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}
