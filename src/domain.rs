//! Domain blocklist applied before any page is scraped.

use url::Url;

use crate::config::DEFAULT_BLOCKED_DOMAINS;

/// Checks candidate URLs against a static list of blocked domains.
///
/// A host is blocked when it equals a listed domain or is a subdomain of
/// one, so `m.facebook.com` is blocked by `facebook.com` while
/// `notfacebook.com` is not.
#[derive(Debug, Clone)]
pub struct DomainFilter {
    blocked: Vec<String>,
}

impl DomainFilter {
    /// Creates a filter from a list of domains.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let blocked = domains
            .into_iter()
            .map(|d| normalize_host(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        Self { blocked }
    }

    /// Returns the blocked domains.
    pub fn domains(&self) -> &[String] {
        &self.blocked
    }

    /// Returns whether the URL must not be scraped.
    ///
    /// URLs without a parseable host cannot be scraped and are rejected too.
    pub fn is_blocked(&self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => self.is_blocked_host(&host),
            None => true,
        }
    }

    /// Returns whether a bare host name is blocked.
    pub fn is_blocked_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.blocked.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }
}

impl Default for DomainFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_DOMAINS)
    }
}

fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    parsed.host_str().map(normalize_host)
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}
