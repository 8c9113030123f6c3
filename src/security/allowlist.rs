use std::collections::BTreeSet;
use std::fmt;

/// Strip a session/resource suffix (`user@host/phone` -> `user@host`) and
/// surrounding whitespace, preserving case.
///
/// Used to derive the reply target, which should echo the sender's own
/// spelling of the address.
pub fn bare_identity(raw: &str) -> &str {
    raw.split('/').next().unwrap_or(raw).trim()
}

/// Canonical form used for allow-list comparisons: bare identity, lowercased.
///
/// Total and idempotent; the same function builds the allow-list at config
/// time and classifies each inbound sender.
pub fn normalize_identity(raw: &str) -> String {
    bare_identity(raw).to_lowercase()
}

/// Set of normalized identities allowed to issue commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderAllowlist {
    entries: BTreeSet<String>,
}

impl SenderAllowlist {
    /// Build from raw configuration entries. Blank entries are dropped.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| normalize_identity(entry.as_ref()))
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { entries }
    }

    /// Parse a comma-separated list (`a@x.com, b@x.com/laptop`).
    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Classify a raw sender. `Err` carries the normalized identity that was
    /// refused so callers can record it.
    pub fn authorize(&self, raw_sender: &str) -> Result<AuthorizedSender, String> {
        let normalized = normalize_identity(raw_sender);
        if self.entries.contains(&normalized) {
            Ok(AuthorizedSender(normalized))
        } else {
            Err(normalized)
        }
    }
}

/// A normalized identity proven to be on the allow-list for the current
/// message. Only [`SenderAllowlist::authorize`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthorizedSender(String);

impl AuthorizedSender {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorizedSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_resource_and_lowercases() {
        assert_eq!(normalize_identity("A@B.com/Phone"), "a@b.com");
        assert_eq!(normalize_identity("A@B.com/Phone"), normalize_identity("a@b.com"));
    }

    #[test]
    fn normalize_trims_whitespace() {
        assert_eq!(normalize_identity("  ops@x.com  "), "ops@x.com");
        assert_eq!(normalize_identity(" ops@x.com /laptop"), "ops@x.com");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["Ops@X.com/laptop", "", "/only-resource", "a/b/c", "  MiXeD@Case.ORG "] {
            let once = normalize_identity(raw);
            assert_eq!(normalize_identity(&once), once, "input: {raw:?}");
        }
    }

    #[test]
    fn normalize_splits_on_first_slash_only() {
        assert_eq!(normalize_identity("ops@x.com/res/extra"), "ops@x.com");
    }

    #[test]
    fn bare_identity_preserves_case() {
        assert_eq!(bare_identity("Ops@X.com/laptop"), "Ops@X.com");
        assert_eq!(bare_identity("ops@x.com"), "ops@x.com");
    }

    #[test]
    fn allowlist_normalizes_and_drops_blank_entries() {
        let list = SenderAllowlist::parse("Ops@X.com/laptop, ,dev@x.com,");
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["dev@x.com", "ops@x.com"]);
    }

    #[test]
    fn allowlist_accepts_resource_and_case_variants() {
        let list = SenderAllowlist::new(["ops@x.com"]);
        let sender = list.authorize("ops@x.com/laptop").unwrap();
        assert_eq!(sender.as_str(), "ops@x.com");
        assert!(list.authorize("OPS@X.com").is_ok());
    }

    #[test]
    fn allowlist_rejects_unknown_sender_with_normalized_identity() {
        let list = SenderAllowlist::new(["ops@x.com"]);
        assert_eq!(list.authorize("Eve@X.com/pwn").unwrap_err(), "eve@x.com");
    }

    #[test]
    fn empty_allowlist_rejects_everyone() {
        let list = SenderAllowlist::parse(" , ");
        assert!(list.is_empty());
        assert!(list.authorize("ops@x.com").is_err());
        assert!(list.authorize("").is_err());
    }
}
