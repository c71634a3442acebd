//! XMPP addresses on top of the `jid` crate.
//!
//! [`Jid`] adds the empty address ("no address") that stanza attributes
//! need, plus comparison with or without the resource.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("{0}")]
    Invalid(String),
}

impl From<jid::Error> for JidError {
    fn from(e: jid::Error) -> Self {
        JidError::Invalid(e.to_string())
    }
}

/// An XMPP address. The empty JID (`Jid::default()`) stands for "no address".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Jid(Option<jid::Jid>);

impl Jid {
    /// Lenient constructor: invalid input yields the empty JID.
    pub fn new(s: &str) -> Self {
        Self::parse(s).unwrap_or_default()
    }

    /// Strict parse. The empty string parses to the empty JID.
    pub fn parse(s: &str) -> Result<Self, JidError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(Some(jid::Jid::new(s)?)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn node(&self) -> &str {
        self.0
            .as_ref()
            .and_then(|j| j.node())
            .map(|n| n.as_str())
            .unwrap_or_default()
    }

    pub fn domain(&self) -> &str {
        self.0.as_ref().map(|j| j.domain().as_str()).unwrap_or_default()
    }

    pub fn resource(&self) -> &str {
        self.0
            .as_ref()
            .and_then(|j| j.resource())
            .map(|r| r.as_str())
            .unwrap_or_default()
    }

    /// The JID without its resource.
    pub fn bare(&self) -> Jid {
        Jid(self.0.as_ref().map(|j| jid::Jid::from(j.to_bare())))
    }

    /// The domain part as a JID of its own.
    pub fn domain_jid(&self) -> Jid {
        Jid(self
            .0
            .as_ref()
            .map(|j| jid::Jid::from(jid::BareJid::from_parts(None, j.domain()))))
    }

    /// Compare two JIDs, optionally ignoring the resource.
    pub fn compare(&self, other: &Jid, with_resource: bool) -> bool {
        if with_resource {
            return self.0 == other.0;
        }
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => a.to_bare() == b.to_bare(),
            (None, None) => true,
            _ => false,
        }
    }
}

impl From<jid::Jid> for Jid {
    fn from(j: jid::Jid) -> Self {
        Self(Some(j))
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(j) => write!(f, "{}", j),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full() {
        let jid = Jid::parse("User@Example.COM/Fluux.Desk").unwrap();
        assert_eq!(jid.node(), "user");
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), "Fluux.Desk");
        assert_eq!(jid.to_string(), "user@example.com/Fluux.Desk");
    }

    #[test]
    fn test_parse_domain_only() {
        let jid = Jid::parse("example.com").unwrap();
        assert!(jid.node().is_empty());
        assert!(jid.resource().is_empty());
        assert_eq!(jid.to_string(), "example.com");
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let jid = Jid::parse("a@b/c@d/e").unwrap();
        assert_eq!(jid.domain(), "b");
        assert_eq!(jid.resource(), "c@d/e");
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["@example.com", "user@", "user@example.com/"] {
            assert!(
                matches!(Jid::parse(bad), Err(JidError::Invalid(_))),
                "{bad} should not parse"
            );
        }
        assert!(Jid::new("@broken").is_empty());
    }

    #[test]
    fn test_empty() {
        assert!(Jid::parse("").unwrap().is_empty());
        assert!(Jid::parse("  ").unwrap().is_empty());
        assert!(Jid::default().is_empty());
        assert_eq!(Jid::default().to_string(), "");
        assert_eq!(Jid::default().domain(), "");
        assert!(Jid::default().bare().is_empty());
    }

    #[test]
    fn test_compare() {
        let full = Jid::new("user@example.com/res");
        let other = Jid::new("user@example.com/other");
        assert!(full.compare(&other, false));
        assert!(!full.compare(&other, true));
        assert!(full.compare(&full.bare(), false));
        assert!(!full.compare(&Jid::default(), false));
        assert!(Jid::default().compare(&Jid::default(), true));
        assert_eq!(full.domain_jid(), Jid::new("example.com"));
    }

    #[test]
    fn test_case_insensitive_parts_compare_equal() {
        let a = Jid::new("Juliet@Capulet.LIT/balcony");
        let b = Jid::new("juliet@capulet.lit/balcony");
        assert!(a.compare(&b, true));
        assert!(!a.compare(&Jid::new("juliet@capulet.lit/Balcony"), true));
    }
}
