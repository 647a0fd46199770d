//! Mailbox addressing policy
//!
//! Translates wire addresses into canonical mailbox names and gates which
//! domains this instance accepts and stores. Acceptance and storage are
//! separate decisions: a sink domain may be accepted on the wire while its
//! mail is discarded before reaching the store.

use crate::config::Config;
use crate::error::{Error, Result};

const MAX_LOCAL_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 253;

/// A parsed wire address, split but not yet canonicalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

/// Parse an RFC 5321 mailbox address.
///
/// Accepts dot-atom and quoted-string local parts. Bracketed IP-literal
/// domains are rejected; this server only serves named domains.
pub fn parse_email_address(raw: &str) -> Result<EmailAddress> {
    if raw != raw.trim() {
        return Err(Error::Parse(format!(
            "Address has surrounding whitespace: {:?}",
            raw
        )));
    }
    if raw.is_empty() {
        return Err(Error::Parse("Empty address".to_string()));
    }

    let (local, rest) = if let Some(quoted) = raw.strip_prefix('"') {
        let (local, len) = parse_quoted_local(quoted)?;
        // len counts the content plus closing quote; +1 for the opening one.
        (local, &raw[len + 1..])
    } else {
        match raw.rfind('@') {
            Some(at) => (raw[..at].to_string(), &raw[at..]),
            None => return Err(Error::Parse(format!("Address missing domain: {:?}", raw))),
        }
    };
    let domain = match rest.strip_prefix('@') {
        Some(d) => d,
        None => {
            return Err(Error::Parse(format!(
                "Expected @ after local part: {:?}",
                raw
            )))
        }
    };

    if local.is_empty() {
        return Err(Error::Parse(format!("Empty local part: {:?}", raw)));
    }
    if local.len() > MAX_LOCAL_LEN {
        return Err(Error::Parse(format!("Local part too long: {:?}", raw)));
    }
    if !raw.starts_with('"') && !valid_dot_atom(&local) {
        return Err(Error::Parse(format!("Invalid local part: {:?}", raw)));
    }
    validate_domain(domain)?;

    Ok(EmailAddress {
        local,
        domain: domain.to_ascii_lowercase(),
    })
}

/// Parse the interior of a quoted local part, returning the unquoted content
/// and the number of input bytes consumed (content plus closing quote).
fn parse_quoted_local(s: &str) -> Result<(String, usize)> {
    let mut local = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((local, i + 1)),
            '\\' => match chars.next() {
                Some((_, escaped)) => local.push(escaped),
                None => break,
            },
            '\r' | '\n' => break,
            _ => local.push(c),
        }
    }
    Err(Error::Parse("Unterminated quoted local part".to_string()))
}

fn valid_dot_atom(local: &str) -> bool {
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    local.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '.' || "!#$%&'*+-/=?^_`{|}~".contains(c)
    })
}

fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(Error::Parse("Empty domain".to_string()));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(Error::Parse(format!("Domain too long: {:?}", domain)));
    }
    if domain.starts_with('[') {
        return Err(Error::Parse(format!(
            "IP-literal domains are not served: {:?}",
            domain
        )));
    }
    for label in domain.split('.') {
        if label.is_empty()
            || label.len() > 63
            || label.starts_with('-')
            || label.ends_with('-')
            || !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::Parse(format!("Invalid domain: {:?}", domain)));
        }
    }
    Ok(())
}

/// Addressing policy built from the runtime configuration.
pub struct AddrPolicy {
    accept_domains: Vec<String>,
    discard_domains: Vec<String>,
}

impl AddrPolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            accept_domains: config
                .accept_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            discard_domains: config
                .discard_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether SMTP should accept mail for this domain at all.
    pub fn should_accept_domain(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        self.accept_domains.is_empty() || self.accept_domains.contains(&domain)
    }

    /// Whether accepted mail for this domain should reach the store.
    pub fn should_store_domain(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        self.should_accept_domain(&domain) && !self.discard_domains.contains(&domain)
    }

    /// Canonical mailbox name for an address: lowercased local part with any
    /// `+tag` suffix stripped. Equal canonical forms share a mailbox.
    pub fn extract_mailbox(&self, addr: &EmailAddress) -> Result<String> {
        if !self.should_accept_domain(&addr.domain) {
            return Err(Error::Rejected(format!(
                "Domain not accepted: {}",
                addr.domain
            )));
        }
        let local = addr.local.to_lowercase();
        let name = match local.split_once('+') {
            Some((prefix, _)) if !prefix.is_empty() => prefix.to_string(),
            _ => local,
        };
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_policy() -> AddrPolicy {
        AddrPolicy::new(&Config::default())
    }

    fn domain_policy() -> AddrPolicy {
        AddrPolicy::new(&Config {
            accept_domains: vec!["example.com".to_string(), "sink.example.com".to_string()],
            discard_domains: vec!["sink.example.com".to_string()],
            ..Config::default()
        })
    }

    #[test]
    fn test_parse_simple_address() {
        let addr = parse_email_address("alice@example.com").unwrap();
        assert_eq!(addr.local, "alice");
        assert_eq!(addr.domain, "example.com");
    }

    #[test]
    fn test_parse_lowercases_domain_only() {
        let addr = parse_email_address("Alice@Example.COM").unwrap();
        assert_eq!(addr.local, "Alice");
        assert_eq!(addr.domain, "example.com");
    }

    #[test]
    fn test_parse_quoted_local() {
        let addr = parse_email_address("\"John Doe\"@example.com").unwrap();
        assert_eq!(addr.local, "John Doe");

        let addr = parse_email_address("\"tricky\\\"quote\"@example.com").unwrap();
        assert_eq!(addr.local, "tricky\"quote");
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        for raw in [
            "",
            "@example.com",
            "alice@",
            "alice",
            " alice@example.com",
            "alice@example.com ",
            "alice@[192.168.0.1]",
            "a..b@example.com",
            ".alice@example.com",
            "alice@-bad.com",
            "\"unterminated@example.com",
        ] {
            assert!(parse_email_address(raw).is_err(), "accepted {:?}", raw);
        }
    }

    #[test]
    fn test_parse_rejects_overlong_local() {
        let raw = format!("{}@example.com", "x".repeat(65));
        assert!(parse_email_address(&raw).is_err());
    }

    #[test]
    fn test_extract_mailbox_canonicalizes() {
        let policy = open_policy();
        let addr = parse_email_address("Alice@Example.COM").unwrap();
        assert_eq!(policy.extract_mailbox(&addr).unwrap(), "alice");
    }

    #[test]
    fn test_extract_mailbox_strips_tag() {
        let policy = open_policy();
        let addr = parse_email_address("bob+sale@example.com").unwrap();
        assert_eq!(policy.extract_mailbox(&addr).unwrap(), "bob");
    }

    #[test]
    fn test_extract_mailbox_keeps_leading_plus() {
        let policy = open_policy();
        let addr = parse_email_address("+tag@example.com").unwrap();
        assert_eq!(policy.extract_mailbox(&addr).unwrap(), "+tag");
    }

    #[test]
    fn test_extract_mailbox_is_idempotent() {
        let policy = open_policy();
        for raw in ["Alice@Example.COM", "bob+sale@example.com", "carl@x.org"] {
            let first = policy
                .extract_mailbox(&parse_email_address(raw).unwrap())
                .unwrap();
            let canonical = format!("{}@{}", first, "example.com");
            let second = policy
                .extract_mailbox(&parse_email_address(&canonical).unwrap())
                .unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_quoted_locals_compare_case_insensitively() {
        let policy = open_policy();
        let a = parse_email_address("\"Alice\"@example.com").unwrap();
        let b = parse_email_address("alice@example.com").unwrap();
        assert_eq!(
            policy.extract_mailbox(&a).unwrap(),
            policy.extract_mailbox(&b).unwrap()
        );
    }

    #[test]
    fn test_domain_gates() {
        let policy = domain_policy();
        assert!(policy.should_accept_domain("example.com"));
        assert!(policy.should_accept_domain("EXAMPLE.com"));
        assert!(!policy.should_accept_domain("other.org"));

        // Accepted on the wire, never stored.
        assert!(policy.should_accept_domain("sink.example.com"));
        assert!(!policy.should_store_domain("sink.example.com"));
        assert!(policy.should_store_domain("example.com"));
    }

    #[test]
    fn test_extract_mailbox_rejects_foreign_domain() {
        let policy = domain_policy();
        let addr = parse_email_address("alice@other.org").unwrap();
        assert!(matches!(
            policy.extract_mailbox(&addr),
            Err(Error::Rejected(_))
        ));
    }
}
