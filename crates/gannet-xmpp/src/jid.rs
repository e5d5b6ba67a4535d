//! Jabber ID parsing and normalization.
//!
//! A JID is `node@domain/resource` with the domain mandatory. Parsing runs
//! every part through its stringprep profile (nodeprep, nameprep,
//! resourceprep); equality and hashing operate on the normalized form, so
//! `User1@Example.COM` and `user1@example.com` compare equal.

use std::fmt;
use std::str::FromStr;

use stringprep::{nameprep, nodeprep, resourceprep};
use thiserror::Error;

/// Maximum length of a single JID part after preparation, in bytes.
const MAX_PART_LEN: usize = 1023;

/// Errors that can occur while parsing a JID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JidParseError {
    /// The node part is present but empty.
    #[error("node part is empty")]
    NodeEmpty,
    /// The node part exceeds 1023 bytes after nodeprep.
    #[error("node part is too long")]
    NodeTooLong,
    /// Nodeprep rejected the node part.
    #[error("node part fails nodeprep")]
    NodePrep,
    /// The domain part is empty.
    #[error("domain part is empty")]
    DomainEmpty,
    /// The domain part exceeds 1023 bytes after nameprep.
    #[error("domain part is too long")]
    DomainTooLong,
    /// Nameprep rejected the domain part.
    #[error("domain part fails nameprep")]
    DomainPrep,
    /// The resource part is present but empty.
    #[error("resource part is empty")]
    ResourceEmpty,
    /// The resource part exceeds 1023 bytes after resourceprep.
    #[error("resource part is too long")]
    ResourceTooLong,
    /// Resourceprep rejected the resource part.
    #[error("resource part fails resourceprep")]
    ResourcePrep,
    /// A full JID was required but no resource was present.
    #[error("resource part required but missing")]
    ResourceMissing,
}

fn length_check(
    len: usize,
    error_empty: JidParseError,
    error_too_long: JidParseError,
) -> Result<(), JidParseError> {
    if len == 0 {
        Err(error_empty)
    } else if len > MAX_PART_LEN {
        Err(error_too_long)
    } else {
        Ok(())
    }
}

fn prep_node(raw: &str) -> Result<String, JidParseError> {
    let node = nodeprep(raw).map_err(|_| JidParseError::NodePrep)?;
    length_check(node.len(), JidParseError::NodeEmpty, JidParseError::NodeTooLong)?;
    Ok(node.into_owned())
}

fn prep_domain(raw: &str) -> Result<String, JidParseError> {
    let domain = nameprep(raw).map_err(|_| JidParseError::DomainPrep)?;
    let domain = domain.trim_end_matches('.');
    length_check(
        domain.len(),
        JidParseError::DomainEmpty,
        JidParseError::DomainTooLong,
    )?;
    Ok(domain.to_owned())
}

fn prep_resource(raw: &str) -> Result<String, JidParseError> {
    let resource = resourceprep(raw).map_err(|_| JidParseError::ResourcePrep)?;
    length_check(
        resource.len(),
        JidParseError::ResourceEmpty,
        JidParseError::ResourceTooLong,
    )?;
    Ok(resource.into_owned())
}

/// Split and normalize a raw JID string into its prepared parts.
fn parse_parts(s: &str) -> Result<(Option<String>, String, Option<String>), JidParseError> {
    let (before_resource, resource) = match s.find('/') {
        Some(slash) => (&s[..slash], Some(&s[slash + 1..])),
        None => (s, None),
    };

    let (node, domain) = match before_resource.find('@') {
        Some(at) => (Some(&before_resource[..at]), &before_resource[at + 1..]),
        None => (None, before_resource),
    };

    let node = node.map(prep_node).transpose()?;
    let domain = prep_domain(domain)?;
    let resource = resource.map(prep_resource).transpose()?;

    Ok((node, domain, resource))
}

/// A parsed JID, bare or full.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse a JID from its string form.
    pub fn new(s: &str) -> Result<Jid, JidParseError> {
        let (node, domain, resource) = parse_parts(s)?;
        Ok(Jid {
            node,
            domain,
            resource,
        })
    }

    /// The node part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether a resource is present.
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// The bare form, dropping any resource.
    pub fn to_bare(&self) -> BareJid {
        BareJid {
            node: self.node.clone(),
            domain: self.domain.clone(),
        }
    }

    /// The full form, if a resource is present.
    pub fn try_into_full(self) -> Result<FullJid, JidParseError> {
        match self.resource {
            Some(resource) => Ok(FullJid {
                node: self.node,
                domain: self.domain,
                resource,
            }),
            None => Err(JidParseError::ResourceMissing),
        }
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Jid, JidParseError> {
        Jid::new(s)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl From<BareJid> for Jid {
    fn from(bare: BareJid) -> Jid {
        Jid {
            node: bare.node,
            domain: bare.domain,
            resource: None,
        }
    }
}

impl From<FullJid> for Jid {
    fn from(full: FullJid) -> Jid {
        Jid {
            node: full.node,
            domain: full.domain,
            resource: Some(full.resource),
        }
    }
}

/// A JID guaranteed to carry no resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BareJid {
    node: Option<String>,
    domain: String,
}

impl BareJid {
    /// Parse a bare JID; a resource in the input is an error.
    pub fn new(s: &str) -> Result<BareJid, JidParseError> {
        let jid = Jid::new(s)?;
        if jid.is_full() {
            return Err(JidParseError::ResourcePrep);
        }
        Ok(jid.to_bare())
    }

    /// Build a bare JID from already-raw parts, running preparation.
    pub fn from_parts(node: Option<&str>, domain: &str) -> Result<BareJid, JidParseError> {
        Ok(BareJid {
            node: node.map(prep_node).transpose()?,
            domain: prep_domain(domain)?,
        })
    }

    /// The node part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Attach a resource, producing a full JID.
    pub fn with_resource(&self, resource: &str) -> Result<FullJid, JidParseError> {
        Ok(FullJid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: prep_resource(resource)?,
        })
    }
}

impl FromStr for BareJid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<BareJid, JidParseError> {
        BareJid::new(s)
    }
}

impl fmt::Display for BareJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)
    }
}

/// A JID guaranteed to carry a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullJid {
    node: Option<String>,
    domain: String,
    resource: String,
}

impl FullJid {
    /// Parse a full JID; a missing resource is an error.
    pub fn new(s: &str) -> Result<FullJid, JidParseError> {
        Jid::new(s)?.try_into_full()
    }

    /// The node part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The bare form of this JID.
    pub fn to_bare(&self) -> BareJid {
        BareJid {
            node: self.node.clone(),
            domain: self.domain.clone(),
        }
    }
}

impl FromStr for FullJid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<FullJid, JidParseError> {
        FullJid::new(s)
    }
}

impl fmt::Display for FullJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        write!(f, "{}/{}", self.domain, self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let jid = Jid::new("user1@vysper.org/tablet").unwrap();
        assert_eq!(jid.node(), Some("user1"));
        assert_eq!(jid.domain(), "vysper.org");
        assert_eq!(jid.resource(), Some("tablet"));
        assert!(jid.is_full());
    }

    #[test]
    fn parse_bare_and_domain_only() {
        let jid = Jid::new("user1@vysper.org").unwrap();
        assert_eq!(jid.resource(), None);

        let jid = Jid::new("vysper.org").unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "vysper.org");
    }

    #[test]
    fn at_inside_resource_is_not_a_separator() {
        let jid = Jid::new("vysper.org/weird@resource").unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "vysper.org");
        assert_eq!(jid.resource(), Some("weird@resource"));
    }

    #[test]
    fn slash_inside_resource_is_kept() {
        let jid = Jid::new("user1@vysper.org/home/desk").unwrap();
        assert_eq!(jid.resource(), Some("home/desk"));
    }

    #[test]
    fn normalization_case_folds() {
        let a = Jid::new("User1@Vysper.ORG/Tablet").unwrap();
        let b = Jid::new("user1@vysper.org/Tablet").unwrap();
        assert_eq!(a, b);
        // Resourceprep preserves case.
        assert_eq!(a.resource(), Some("Tablet"));
    }

    #[test]
    fn round_trip() {
        for s in ["user1@vysper.org/tablet", "user1@vysper.org", "vysper.org"] {
            let jid = Jid::new(s).unwrap();
            let reparsed = Jid::new(&jid.to_string()).unwrap();
            assert_eq!(jid, reparsed);
            assert_eq!(jid.to_string(), s);
        }
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert_eq!(Jid::new("@vysper.org"), Err(JidParseError::NodeEmpty));
        assert_eq!(Jid::new("user1@"), Err(JidParseError::DomainEmpty));
        assert_eq!(
            Jid::new("user1@vysper.org/"),
            Err(JidParseError::ResourceEmpty)
        );
        assert_eq!(Jid::new(""), Err(JidParseError::DomainEmpty));
    }

    #[test]
    fn over_long_parts_are_rejected() {
        let node = "a".repeat(1024);
        assert_eq!(
            Jid::new(&format!("{node}@vysper.org")),
            Err(JidParseError::NodeTooLong)
        );
        let resource = "r".repeat(1024);
        assert_eq!(
            Jid::new(&format!("vysper.org/{resource}")),
            Err(JidParseError::ResourceTooLong)
        );
    }

    #[test]
    fn bare_full_conversions() {
        let full = FullJid::new("user1@vysper.org/tablet").unwrap();
        let bare = full.to_bare();
        assert_eq!(bare.to_string(), "user1@vysper.org");
        let back = bare.with_resource("phone").unwrap();
        assert_eq!(back.to_string(), "user1@vysper.org/phone");

        assert!(FullJid::new("user1@vysper.org").is_err());
        assert!(BareJid::new("user1@vysper.org/tablet").is_err());
    }

    #[test]
    fn hash_matches_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(BareJid::new("User1@Vysper.org").unwrap());
        assert!(set.contains(&BareJid::new("user1@vysper.org").unwrap()));
    }
}
