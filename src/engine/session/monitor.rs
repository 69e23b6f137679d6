//! Cookie enforcement for one browsing session.
//!
//! The monitor sees every change of the shared cookie jar, but only evaluates them while
//! its session is the active one. Disallowed cookies set during a page load are queued
//! and removed once the load finished; after that they are removed right away.

use std::sync::Arc;

use url::Url;

use crate::engine::cookies::{Cookie, CookieChange, CookieFilter, CookieJarHandle};
use crate::engine::policy::{check_url, CookiePolicyItem, ENFORCEMENT_COOKIE_NAME};
use crate::engine::storage::{LogAction, PolicyStore};

/// What the monitor did with a cookie change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not evaluated (background session, removal, enforcement cookie, no page).
    Ignored,
    /// Allowed and logged.
    Allowed,
    /// Disallowed, removal deferred until the page finished loading.
    Deferred,
    /// Disallowed and removed.
    Removed(Cookie),
}

pub struct CookieMonitor {
    store: Arc<PolicyStore>,
    jar: CookieJarHandle,
    loading: bool,
    pending_removals: Vec<Cookie>,
}

impl CookieMonitor {
    pub fn new(store: Arc<PolicyStore>, jar: CookieJarHandle) -> Self {
        Self {
            store,
            jar,
            loading: false,
            pending_removals: Vec::new(),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn pending(&self) -> &[Cookie] {
        &self.pending_removals
    }

    pub fn start_loading(&mut self) {
        self.loading = true;
    }

    /// Evaluates one change of the jar against the page at `url`.
    pub fn on_cookie_changed(&mut self, change: &CookieChange, url: Option<&Url>, active: bool) -> Verdict {
        if !active || change.removed || change.cookie.name == ENFORCEMENT_COOKIE_NAME {
            return Verdict::Ignored;
        }
        let Some(url) = url else {
            return Verdict::Ignored;
        };

        let cookie = &change.cookie;
        if self.store.is_cookie_allowed(cookie, url) {
            self.store.update_cookie_log(LogAction::Add, cookie, url);
            return Verdict::Allowed;
        }

        if self.loading {
            if !self.pending_removals.iter().any(|c| c.same_identity(cookie)) {
                log::debug!("deferring removal of cookie {} ({}) until {url} finished loading", cookie.name, cookie.domain);
                self.pending_removals.push(cookie.clone());
            }
            return Verdict::Deferred;
        }

        if self.remove(cookie) {
            Verdict::Removed(cookie.clone())
        } else {
            Verdict::Ignored
        }
    }

    /// Ends the load and removes every queued cookie. Returns the removed cookies.
    pub fn finished_loading(&mut self) -> Vec<Cookie> {
        self.loading = false;

        std::mem::take(&mut self.pending_removals)
            .into_iter()
            .filter(|c| c.name != ENFORCEMENT_COOKIE_NAME)
            .filter(|c| self.remove(c))
            .collect()
    }

    /// Re-evaluates every logged cookie of the item stored for `url`, removing and
    /// unlogging those that are no longer allowed.
    pub fn sweep_cookie_log(&mut self, url: &Url) -> Vec<Cookie> {
        let Some(CookiePolicyItem::Resolved(item)) = self.store.find_by_url(url) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for entry in item.cookies.iter() {
            let filter = CookieFilter {
                url: None,
                name: Some(entry.name.clone()),
                domain: Some(entry.setter.clone()),
            };
            let set: Vec<Cookie> = self
                .jar
                .get(&filter)
                .into_iter()
                .filter(|c| c.domain.eq_ignore_ascii_case(&entry.setter))
                .collect();

            let probe = set.first().cloned().unwrap_or_else(|| logged_cookie(&entry.setter, &entry.name));
            if self.store.is_cookie_allowed(&probe, url) {
                continue;
            }

            for cookie in set {
                if self.remove(&cookie) {
                    removed.push(cookie);
                }
            }
            self.store.update_cookie_log(LogAction::Remove, &probe, url);
        }

        removed
    }

    /// Re-evaluates the cookies of the jar that belong to the page at `url` or to one of
    /// the accessors of its policy. Used for sessions that were not enforced live.
    pub fn sweep_jar(&mut self, url: &Url) -> Vec<Cookie> {
        let mut cookies = self.jar.get(&CookieFilter::for_url(url.clone()));

        if let Some(CookiePolicyItem::Resolved(item)) = self.store.find_by_url(url) {
            for accessor in &item.policy.cookie_accessors {
                let Some(host) = check_url(&accessor.scope, false).and_then(|u| u.host_str().map(str::to_string)) else {
                    continue;
                };
                for cookie in self.jar.get(&CookieFilter::for_domain(host)) {
                    if !cookies.iter().any(|c| c.same_identity(&cookie)) {
                        cookies.push(cookie);
                    }
                }
            }
        }

        let mut removed = Vec::new();
        for cookie in cookies.into_iter().filter(|c| c.name != ENFORCEMENT_COOKIE_NAME) {
            if self.store.is_cookie_allowed(&cookie, url) {
                self.store.update_cookie_log(LogAction::Add, &cookie, url);
            } else if self.remove(&cookie) {
                removed.push(cookie);
            }
        }

        removed
    }

    fn remove(&self, cookie: &Cookie) -> bool {
        match self.jar.remove_cookie(cookie) {
            Ok(false) => false,
            Ok(true) => {
                log::info!("removed disallowed cookie {} ({})", cookie.name, cookie.domain);
                true
            }
            Err(e) => {
                log::warn!("failed to remove cookie {} ({}): {e}", cookie.name, cookie.domain);
                false
            }
        }
    }
}

/// A stand-in for a logged cookie that is no longer in the jar. Only name and domain
/// take part in the allow decision.
fn logged_cookie(setter: &str, name: &str) -> Cookie {
    Cookie {
        name: name.to_string(),
        value: String::new(),
        domain: setter.to_string(),
        host_only: false,
        path: "/".to_string(),
        secure: false,
        http_only: false,
        same_site: None,
        expires: None,
    }
}
