//! Registrable domain (eTLD+1) computation.
//!
//! The registrable domain is the unit of site isolation: two URLs are
//! "same-site" when their registrable domains match. Only a compact table of
//! multi-label public suffixes is built in; every other host is treated as
//! having a single-label suffix.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::{Host, Url};

/// Public suffixes made of more than one label.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "ac.uk", "co.uk", "gov.uk", "org.uk", "ltd.uk", "me.uk", "net.uk",
    "com.au", "net.au", "org.au", "edu.au", "gov.au",
    "co.jp", "ne.jp", "or.jp", "ac.jp",
    "co.nz", "org.nz", "co.in", "co.za", "co.kr",
    "com.br", "com.cn", "com.mx", "com.tr", "com.tw",
    "github.io", "gitlab.io", "blogspot.com", "appspot.com", "herokuapp.com",
];

/// The effective top-level domain plus one label of a host.
///
/// An empty value means "no registrable domain" (opaque origins, `about:`
/// URLs, unparsable input).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrableDomain(String);

impl RegistrableDomain {
    /// Compute the registrable domain of a URL.
    pub fn from_url(url: &Url) -> Self {
        match url.host() {
            Some(Host::Domain(host)) => Self::from_host(host),
            Some(Host::Ipv4(addr)) => Self(addr.to_string()),
            Some(Host::Ipv6(addr)) => Self(format!("[{}]", addr)),
            None => Self::default(),
        }
    }

    /// Parse a URL string, returning an empty domain when it is invalid.
    pub fn from_url_str(url: &str) -> Self {
        Url::parse(url)
            .map(|u| Self::from_url(&u))
            .unwrap_or_default()
    }

    /// Compute the registrable domain of a bare host name.
    pub fn from_host(host: &str) -> Self {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return Self::default();
        }

        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() <= 1 {
            return Self(host);
        }

        let suffix_labels = MULTI_LABEL_SUFFIXES
            .iter()
            .filter(|suffix| host == **suffix || host.ends_with(&format!(".{}", suffix)))
            .map(|suffix| suffix.split('.').count())
            .max()
            .unwrap_or(1);

        if labels.len() <= suffix_labels {
            // The host is itself a public suffix.
            return Self(host);
        }

        let start = labels.len() - suffix_labels - 1;
        Self(labels[start..].join("."))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `url` belongs to this registrable domain.
    pub fn matches(&self, url: &Url) -> bool {
        !self.is_empty() && Self::from_url(url) == *self
    }
}

impl fmt::Display for RegistrableDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegistrableDomain {
    fn from(host: &str) -> Self {
        Self::from_host(host)
    }
}
