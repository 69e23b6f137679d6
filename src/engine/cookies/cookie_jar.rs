//! Cookie jar abstraction and a simple in-memory implementation.
//!
//! A **cookie jar** holds the cookies the rendering engine sets while pages load. The
//! policy engine only needs four things from it: query, set, remove and a stream of
//! changes. [`CookieJar`] captures exactly that, and [`DefaultCookieJar`] is a reference
//! implementation that keeps cookies **in memory only**.
//!
//! ## Notes & limitations
//! - `Set-Cookie` parsing is intentionally **minimal**: `Path`, `Domain`, `Expires`,
//!   `Secure`, `HttpOnly` and `SameSite` are handled; `Max-Age`, size limits and
//!   expiration enforcement are not.
//! - Cookies are bucketed by **domain**. Identity within the jar is
//!   `(domain, path, name)`.
//! - The jar is internally synchronized and every method takes `&self`.
//!
//! See also: RFC 6265bis (HTTP State Management Mechanism).

use std::collections::HashMap;
use std::sync::RwLock;

use http::HeaderMap;
use tokio::sync::broadcast;
use url::Url;

use crate::engine::cookies::{Cookie, CookieChange, CookieChangeCause, CookieDetails, CookieFilter};
use crate::engine::errors::CookieError;
use crate::engine::policy::domain_matches;
use crate::engine::DEFAULT_CHANNEL_CAPACITY;

/// The cookie store collaborator.
///
/// Implementations publish a [`CookieChange`] for every mutation, in the order the
/// mutations happened.
pub trait CookieJar: Send + Sync {
    /// Returns all cookies accepted by `filter`.
    fn get(&self, filter: &CookieFilter) -> Vec<Cookie>;

    /// Sets a cookie, replacing any cookie with the same domain, path and name.
    fn set(&self, details: CookieDetails) -> Result<Cookie, CookieError>;

    /// Removes the cookies named `name` that would be sent to `url`. Returns how many
    /// were removed.
    fn remove(&self, url: &Url, name: &str) -> Result<usize, CookieError>;

    /// Removes exactly the cookie with the identity of `cookie` (domain, path and name).
    /// Returns false when no such cookie is in the jar.
    fn remove_cookie(&self, cookie: &Cookie) -> Result<bool, CookieError>;

    /// Subscribes to the change stream.
    fn subscribe(&self) -> broadcast::Receiver<CookieChange>;

    /// Stores cookies found in response `headers` for the given `url`.
    ///
    /// Every `Set-Cookie` header goes through [`CookieJar::set`], so changes are
    /// published the same way.
    fn store_response_cookies(&self, url: &Url, headers: &HeaderMap) {
        for header in headers.get_all(http::header::SET_COOKIE) {
            let Ok(header_str) = header.to_str() else {
                continue;
            };
            let Some(details) = parse_set_cookie(url, header_str) else {
                log::debug!("ignoring malformed Set-Cookie header from {url}");
                continue;
            };
            if let Err(e) = self.set(details) {
                log::warn!("rejected cookie from {url}: {e}");
            }
        }
    }

    /// Removes all cookies from the jar.
    fn clear(&self);
}

/// Parses one `Set-Cookie` header value received from `url`.
pub fn parse_set_cookie(url: &Url, header: &str) -> Option<CookieDetails> {
    let (name, rest) = header.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut parts = rest.split(';');
    let value = parts.next().unwrap_or_default().trim();
    let mut details = CookieDetails::new(url.clone(), name, value);

    for part in parts {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim();
            match k.trim().to_ascii_lowercase().as_str() {
                "path" => details.path = Some(v.to_string()),
                "domain" => details.domain = Some(v.trim_start_matches('.').to_string()),
                "expires" => details.expires = Some(v.to_string()),
                "samesite" => {
                    // normalize to "Lax" | "Strict" | "None"
                    details.same_site = Some(if v.eq_ignore_ascii_case("lax") {
                        "Lax".to_string()
                    } else if v.eq_ignore_ascii_case("strict") {
                        "Strict".to_string()
                    } else if v.eq_ignore_ascii_case("none") {
                        "None".to_string()
                    } else {
                        v.to_string()
                    });
                }
                _ => {}
            }
        } else if part.eq_ignore_ascii_case("secure") {
            details.secure = true;
        } else if part.eq_ignore_ascii_case("httponly") {
            details.http_only = true;
        }
    }

    Some(details)
}

fn default_path(url: &Url) -> String {
    url.path()
        .rsplit_once('/')
        .map_or("/", |(a, _)| if a.is_empty() { "/" } else { a })
        .to_string()
}

/// Default in-memory cookie jar.
///
/// Cookies are stored per **domain** and matched to URLs via basic domain/path rules.
/// No expiration or eviction is enforced; `expires` is stored but not acted upon.
#[derive(Debug)]
pub struct DefaultCookieJar {
    /// Cookies bucketed by lowercase domain.
    entries: RwLock<HashMap<String, Vec<Cookie>>>,
    changes: broadcast::Sender<CookieChange>,
}

impl Default for DefaultCookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultCookieJar {
    /// Creates an empty in-memory cookie jar.
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        DefaultCookieJar {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn publish(&self, cookie: Cookie, cause: CookieChangeCause, removed: bool) {
        // Fails only when nobody subscribed.
        let _ = self.changes.send(CookieChange { cookie, cause, removed });
    }

    /// Number of cookies currently in the jar.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CookieJar for DefaultCookieJar {
    fn get(&self, filter: &CookieFilter) -> Vec<Cookie> {
        let entries = self.entries.read().unwrap();
        let mut cookies: Vec<Cookie> = entries
            .values()
            .flatten()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();

        // Longer paths first, as they would be sent in a request header.
        cookies.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then_with(|| a.name.cmp(&b.name)));
        cookies
    }

    fn set(&self, details: CookieDetails) -> Result<Cookie, CookieError> {
        let host = details
            .url
            .host_str()
            .ok_or_else(|| CookieError::NoHost(details.url.to_string()))?
            .to_ascii_lowercase();

        let (domain, host_only) = match details.domain.as_deref().map(|d| d.trim_start_matches('.')) {
            Some(domain) if !domain.is_empty() => {
                if !domain_matches(&host, domain) {
                    return Err(CookieError::DomainMismatch {
                        domain: domain.to_string(),
                        host,
                    });
                }
                (domain.to_ascii_lowercase(), false)
            }
            _ => (host, true),
        };

        let cookie = Cookie {
            path: details.path.unwrap_or_else(|| default_path(&details.url)),
            name: details.name,
            value: details.value,
            domain,
            host_only,
            secure: details.secure,
            http_only: details.http_only,
            same_site: details.same_site,
            expires: details.expires,
        };

        let replaced = {
            let mut entries = self.entries.write().unwrap();
            let bucket = entries.entry(cookie.domain.clone()).or_default();

            // Replace existing cookie with same identity
            match bucket.iter_mut().find(|c| c.same_identity(&cookie)) {
                Some(existing) => Some(std::mem::replace(existing, cookie.clone())),
                None => {
                    bucket.push(cookie.clone());
                    None
                }
            }
        };

        if let Some(old) = replaced {
            self.publish(old, CookieChangeCause::Overwrite, true);
        }
        self.publish(cookie.clone(), CookieChangeCause::Explicit, false);

        Ok(cookie)
    }

    fn remove(&self, url: &Url, name: &str) -> Result<usize, CookieError> {
        if url.host_str().is_none() {
            return Err(CookieError::NoHost(url.to_string()));
        }

        let removed: Vec<Cookie> = {
            let mut entries = self.entries.write().unwrap();
            let mut removed = Vec::new();
            for bucket in entries.values_mut() {
                let (gone, kept): (Vec<Cookie>, Vec<Cookie>) = bucket
                    .drain(..)
                    .partition(|c| c.name == name && c.matches_url(url));
                *bucket = kept;
                removed.extend(gone);
            }
            entries.retain(|_, bucket| !bucket.is_empty());
            removed
        };

        let count = removed.len();
        for cookie in removed {
            self.publish(cookie, CookieChangeCause::Explicit, true);
        }

        Ok(count)
    }

    fn remove_cookie(&self, cookie: &Cookie) -> Result<bool, CookieError> {
        let removed = {
            let mut entries = self.entries.write().unwrap();
            let key = cookie.domain.to_ascii_lowercase();
            let Some(bucket) = entries.get_mut(&key) else {
                return Ok(false);
            };
            let removed = bucket
                .iter()
                .position(|c| c.same_identity(cookie))
                .map(|idx| bucket.remove(idx));
            if bucket.is_empty() {
                entries.remove(&key);
            }
            removed
        };

        match removed {
            Some(cookie) => {
                self.publish(cookie, CookieChangeCause::Explicit, true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<CookieChange> {
        self.changes.subscribe()
    }

    fn clear(&self) {
        let drained: Vec<Cookie> = {
            let mut entries = self.entries.write().unwrap();
            entries.drain().flat_map(|(_, bucket)| bucket).collect()
        };

        for cookie in drained {
            self.publish(cookie, CookieChangeCause::Explicit, true);
        }
    }
}
