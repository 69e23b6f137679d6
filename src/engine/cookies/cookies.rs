//! Cookie core types.
//!
//! This module defines the **type-erased handle** used throughout the engine, the
//! serializable [`Cookie`] record and the request/notification types of the
//! [`CookieJar`] interface.
//!
//! # Concurrency model
//! - [`CookieJarHandle`] is `Arc<dyn CookieJar>`. Jars synchronize internally and all
//!   trait methods take `&self`, so one jar can be shared by every browsing session.
//! - Changes are published on a `tokio::sync::broadcast` channel as [`CookieChange`]s.
//!   Subscribers that fall behind receive `RecvError::Lagged` and must resynchronize by
//!   calling [`CookieJar::get`].
//!
//! ```rust,no_run
//! use gosub_cookie_policy::cookies::{CookieDetails, CookieJar, DefaultCookieJar};
//! use url::Url;
//!
//! let jar = DefaultCookieJar::new();
//! let url = Url::parse("https://shop.example.com/cart").unwrap();
//! let cookie = jar.set(CookieDetails::new(url, "session", "abc123").domain("example.com")).unwrap();
//! assert_eq!(cookie.domain, "example.com");
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::engine::cookies::CookieJar;
use crate::engine::policy::domain_matches;

/// A handle to a cookie jar.
pub type CookieJarHandle = Arc<dyn CookieJar>;

/// A cookie as stored by a [`CookieJar`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name (case-sensitive).
    pub name: String,

    /// Raw cookie value (not URL-decoded).
    pub value: String,

    /// Domain the cookie belongs to, without leading dot. For host-only cookies this is
    /// the host that set it.
    pub domain: String,

    /// True when the cookie was set without a `Domain` attribute.
    pub host_only: bool,

    /// Path scoping (e.g., `"/"`).
    pub path: String,

    /// If `true`, cookie is sent only over HTTPS.
    pub secure: bool,

    /// If `true`, cookie is blocked from access by client-side scripts.
    pub http_only: bool,

    /// SameSite policy (`"Strict"`, `"Lax"`, or `"None"`).
    pub same_site: Option<String>,

    /// Raw expiration attribute, if any. Session cookies have `None`.
    pub expires: Option<String>,
}

impl Cookie {
    /// Returns true when this cookie would be sent along with a request to `url`.
    pub fn matches_url(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };

        let domain_ok = if self.host_only {
            host.eq_ignore_ascii_case(&self.domain)
        } else {
            domain_matches(host, &self.domain)
        };

        domain_ok && url.path().starts_with(&self.path) && (!self.secure || url.scheme() == "https")
    }

    /// Identity of a cookie within a jar: domain, path and name.
    pub fn same_identity(&self, other: &Cookie) -> bool {
        self.name == other.name && self.path == other.path && self.domain.eq_ignore_ascii_case(&other.domain)
    }
}

/// Arguments for [`CookieJar::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieDetails {
    /// URL the cookie is set for. Its host must domain-match `domain` when given.
    pub url: Url,
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    pub expires: Option<String>,
}

impl CookieDetails {
    pub fn new(url: Url, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            url,
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            same_site: None,
            expires: None,
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn secure(mut self, on: bool) -> Self {
        self.secure = on;
        self
    }
}

/// Selects cookies in [`CookieJar::get`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieFilter {
    /// Only cookies that would be sent to this URL.
    pub url: Option<Url>,
    pub name: Option<String>,
    /// Only cookies whose domain equals or is a subdomain of this one.
    pub domain: Option<String>,
}

impl CookieFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_url(url: Url) -> Self {
        Self { url: Some(url), ..Self::default() }
    }

    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self { domain: Some(domain.into()), ..Self::default() }
    }

    pub fn matches(&self, cookie: &Cookie) -> bool {
        if let Some(url) = &self.url {
            if !cookie.matches_url(url) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &cookie.name != name {
                return false;
            }
        }
        if let Some(domain) = &self.domain {
            if !domain_matches(&cookie.domain, domain) {
                return false;
            }
        }
        true
    }
}

/// Why a cookie changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CookieChangeCause {
    /// Set or removed by an explicit call.
    Explicit,
    /// Replaced by a cookie with the same identity.
    Overwrite,
    Expired,
    Evicted,
}

/// Notification published by a [`CookieJar`] for every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieChange {
    pub cookie: Cookie,
    pub cause: CookieChangeCause,
    /// True when the cookie was removed, false when it was added.
    pub removed: bool,
}
