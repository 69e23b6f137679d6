//! The policy store.
//!
//! [`PolicyStore`] is the keyed table of [`CookiePolicyItem`]s, one per visited origin.
//! It keeps every item in memory behind a single lock and writes through to a
//! [`PolicyBackend`]. Holding the write lock across the backend call gives all writes,
//! including [`PolicyStore::clear`], one total order.
//!
//! Backend failures are logged and the operation becomes a no-op: the in-memory state is
//! only changed after the backend accepted the write.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use url::Url;

use crate::engine::cookies::Cookie;
use crate::engine::errors::{PolicyError, StoreError};
use crate::engine::policy::{
    check_url, domain_matches, merge_policy, origin_key, CookieAccessor, CookieLogEntry, CookiePolicyItem,
    PolicyState, PolicyUpdate, ServerPolicy, ENFORCEMENT_COOKIE_NAME,
};
use crate::engine::storage::{InMemoryPolicyBackend, PolicyBackend, PolicyBackendHandle};

/// Whether [`PolicyStore::update_cookie_log`] records or forgets a cookie.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogAction {
    Add,
    Remove,
}

pub struct PolicyStore {
    items: RwLock<BTreeMap<String, CookiePolicyItem>>,
    backend: PolicyBackendHandle,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    /// Opens a store over `backend`, loading everything it holds.
    pub fn open(backend: PolicyBackendHandle) -> Result<Self, StoreError> {
        let items = backend
            .load_all()?
            .into_iter()
            .map(|item| (normalize_key(item.source_url()), item))
            .collect::<BTreeMap<_, _>>();

        log::debug!("policy store opened with {} item(s) from {} backend", items.len(), backend.name());

        Ok(Self {
            items: RwLock::new(items),
            backend,
        })
    }

    /// A store that forgets everything when dropped.
    pub fn in_memory() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            backend: Arc::new(InMemoryPolicyBackend::new()),
        }
    }

    /// Looks up the item stored for an ascii-serialized origin.
    pub fn find_by_origin(&self, origin: &str) -> Option<CookiePolicyItem> {
        self.items.read().unwrap().get(origin).cloned()
    }

    /// Looks up the item stored for the origin of `url`.
    pub fn find_by_url(&self, url: &Url) -> Option<CookiePolicyItem> {
        self.find_by_origin(&origin_key(url))
    }

    /// Like [`find_by_url`](Self::find_by_url), but absent items are an error.
    pub fn get(&self, url: &Url) -> Result<CookiePolicyItem, PolicyError> {
        self.find_by_url(url).ok_or_else(|| PolicyError::PolicyNotFound { origin: origin_key(url) })
    }

    /// Merges `update` with the stored item for the same origin and persists the result.
    ///
    /// Returns the stored item, or `None` when the merge or the backend failed.
    pub fn upsert(&self, update: PolicyUpdate) -> Option<CookiePolicyItem> {
        let key = normalize_key(update.source_url());
        let mut items = self.items.write().unwrap();

        let merged = match merge_policy(items.get(&key), update) {
            Ok(item) => with_source_url(item, &key),
            Err(e) => {
                log::warn!("policy update for {key} dropped: {e}");
                return None;
            }
        };

        if let Err(e) = self.backend.save(&merged) {
            log::error!("failed to persist policy for {key} in {} backend: {e}", self.backend.name());
            return None;
        }

        items.insert(key, merged.clone());
        Some(merged)
    }

    /// Removes every stored item. Returns false when the backend refused.
    pub fn clear(&self) -> bool {
        let mut items = self.items.write().unwrap();

        if let Err(e) = self.backend.clear() {
            log::error!("failed to clear {} policy backend: {e}", self.backend.name());
            return false;
        }

        log::info!("cleared {} stored cookie policies", items.len());
        items.clear();
        true
    }

    /// Snapshot of every stored item, ordered by origin.
    pub fn items(&self) -> Vec<CookiePolicyItem> {
        self.items.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decides whether `cookie`, set while visiting `source_url`, may stay.
    ///
    /// The enforcement cookie is always allowed. Everything else needs a selected
    /// policy with an available accessor owning the cookie's domain.
    pub fn is_cookie_allowed(&self, cookie: &Cookie, source_url: &Url) -> bool {
        if cookie.name == ENFORCEMENT_COOKIE_NAME {
            return true;
        }

        let items = self.items.read().unwrap();
        let Some(CookiePolicyItem::Resolved(item)) = items.get(&origin_key(source_url)) else {
            return false;
        };

        if item.state != PolicyState::Selected {
            return false;
        }

        match resolve_accessor(&item.policy, cookie) {
            Some(accessor) => item.accessor_available(accessor.id),
            None => {
                log::trace!("no accessor owns cookie {} from {}", cookie.name, cookie.domain);
                false
            }
        }
    }

    /// Records or forgets `cookie` in the log of the item stored for `source_url`.
    ///
    /// Returns true when the log changed and was persisted.
    pub fn update_cookie_log(&self, action: LogAction, cookie: &Cookie, source_url: &Url) -> bool {
        let key = origin_key(source_url);
        let mut items = self.items.write().unwrap();

        let Some(CookiePolicyItem::Resolved(stored)) = items.get(&key) else {
            return false;
        };

        let entry = CookieLogEntry {
            setter: cookie.domain.clone(),
            url: key.clone(),
            name: cookie.name.clone(),
        };

        let mut updated = stored.clone();
        let changed = match action {
            LogAction::Add => updated.cookies.insert(entry),
            LogAction::Remove => updated.cookies.remove(&entry),
        };
        if !changed {
            return false;
        }

        let updated = CookiePolicyItem::Resolved(updated);
        if let Err(e) = self.backend.save(&updated) {
            log::error!("failed to persist cookie log for {key}: {e}");
            return false;
        }

        items.insert(key, updated);
        true
    }
}

/// Finds the accessor owning `cookie`.
///
/// A cookie belongs to an accessor when its domain equals the accessor's scope host or
/// is a subdomain of it. The longest scope host wins, ties go to the lowest id.
pub fn resolve_accessor<'a>(policy: &'a ServerPolicy, cookie: &Cookie) -> Option<&'a CookieAccessor> {
    policy
        .cookie_accessors
        .iter()
        .filter_map(|accessor| {
            let scope = check_url(&accessor.scope, false)?;
            let host = scope.host_str()?.to_string();
            domain_matches(&cookie.domain, &host).then_some((host.len(), accessor))
        })
        .max_by(|(len_a, a), (len_b, b)| len_a.cmp(len_b).then_with(|| b.id.cmp(&a.id)))
        .map(|(_, accessor)| accessor)
}

/// Items are keyed by origin. Anything that does not parse as a URL is kept verbatim.
fn normalize_key(source_url: &str) -> String {
    Url::parse(source_url)
        .map(|u| origin_key(&u))
        .unwrap_or_else(|_| source_url.to_string())
}

fn with_source_url(item: CookiePolicyItem, key: &str) -> CookiePolicyItem {
    match item {
        CookiePolicyItem::Unsupported(mut u) => {
            u.source_url = key.to_string();
            CookiePolicyItem::Unsupported(u)
        }
        CookiePolicyItem::Resolved(mut r) => {
            r.source_url = key.to_string();
            CookiePolicyItem::Resolved(r)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::policy::fixtures::{accessor, policy};
    use crate::engine::policy::{generate_defaults, toggle_purpose, PurposeId};

    struct FailingBackend;

    impl PolicyBackend for FailingBackend {
        fn load_all(&self) -> Result<Vec<CookiePolicyItem>, StoreError> {
            Ok(Vec::new())
        }
        fn save(&self, _item: &CookiePolicyItem) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
        fn clear(&self) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn cookie(name: &str, domain: &str) -> Cookie {
        Cookie {
            name: name.into(),
            value: "v".into(),
            domain: domain.into(),
            host_only: false,
            path: "/".into(),
            secure: false,
            http_only: false,
            same_site: None,
            expires: None,
        }
    }

    fn select(store: &PolicyStore, visited: &str, purposes: &[u32]) {
        let p = policy();
        let mut choice = generate_defaults(&p);
        for id in purposes {
            toggle_purpose(&p, &mut choice, PurposeId(*id), true);
        }
        store.upsert(PolicyUpdate::negotiated(visited, p)).unwrap();
        store.upsert(PolicyUpdate::submitted(visited, None, choice)).unwrap();
    }

    #[test]
    fn upsert_keys_by_origin() {
        let store = PolicyStore::in_memory();
        store.upsert(PolicyUpdate::negotiated("https://www.example.com/some/page?q=1", policy())).unwrap();

        assert!(store.find_by_origin("https://www.example.com").is_some());
        assert!(store.find_by_url(&url("https://www.example.com/other")).is_some());
        assert_eq!(store.items()[0].source_url(), "https://www.example.com");
        assert_eq!(
            store.get(&url("https://other.test/")).unwrap_err(),
            PolicyError::PolicyNotFound { origin: "https://other.test".into() }
        );
    }

    #[test]
    fn selected_policy_allows_available_accessor_only() {
        let store = PolicyStore::in_memory();
        select(&store, "https://www.example.com", &[1]);
        let visited = url("https://www.example.com/");

        assert!(store.is_cookie_allowed(&cookie("id", "ads.example.com"), &visited));
        // Tracker needs purpose 2 as well.
        assert!(!store.is_cookie_allowed(&cookie("id", "tracker.test"), &visited));
        assert!(!store.is_cookie_allowed(&cookie("id", "unrelated.org"), &visited));
    }

    #[test]
    fn not_selected_and_unsupported_deny_everything_but_enforcement_cookie() {
        let store = PolicyStore::in_memory();
        store.upsert(PolicyUpdate::negotiated("https://example.com", policy())).unwrap();
        store.upsert(PolicyUpdate::unsupported("https://nopolicy.test", true)).unwrap();

        let visited = url("https://example.com/");
        assert!(!store.is_cookie_allowed(&cookie("id", "ads.example.com"), &visited));
        assert!(store.is_cookie_allowed(&cookie(ENFORCEMENT_COOKIE_NAME, "example.com"), &visited));

        let unsupported = url("https://nopolicy.test/");
        assert!(!store.is_cookie_allowed(&cookie("anything", "nopolicy.test"), &unsupported));
        assert!(store.is_cookie_allowed(&cookie(ENFORCEMENT_COOKIE_NAME, "nopolicy.test"), &unsupported));

        assert!(!store.is_cookie_allowed(&cookie("id", "absent.test"), &url("https://absent.test/")));
    }

    #[test]
    fn most_specific_accessor_wins() {
        let mut p = policy();
        p.cookie_accessors = vec![
            accessor(20, "Site", "example.com", &[2]),
            accessor(21, "Ads", "ads.example.com", &[1]),
        ];

        assert_eq!(resolve_accessor(&p, &cookie("x", "cdn.ads.example.com")).unwrap().id.0, 21);
        assert_eq!(resolve_accessor(&p, &cookie("x", "www.example.com")).unwrap().id.0, 20);
        assert!(resolve_accessor(&p, &cookie("x", "evilexample.com")).is_none());

        p.cookie_accessors.push(accessor(5, "Dup", "https://example.com", &[]));
        assert_eq!(resolve_accessor(&p, &cookie("x", "www.example.com")).unwrap().id.0, 5);
    }

    #[test]
    fn cookie_log_add_and_remove() {
        let store = PolicyStore::in_memory();
        select(&store, "https://example.com", &[1]);
        let visited = url("https://example.com/a");
        let c = cookie("id", "ads.example.com");

        assert!(store.update_cookie_log(LogAction::Add, &c, &visited));
        assert!(!store.update_cookie_log(LogAction::Add, &c, &visited));

        let item = store.find_by_url(&visited).unwrap();
        let entries: Vec<_> = item.as_resolved().unwrap().cookies.iter().cloned().collect();
        assert_eq!(
            entries,
            vec![CookieLogEntry { setter: "ads.example.com".into(), url: "https://example.com".into(), name: "id".into() }]
        );

        assert!(store.update_cookie_log(LogAction::Remove, &c, &visited));
        assert!(store.find_by_url(&visited).unwrap().as_resolved().unwrap().cookies.is_empty());
        assert!(!store.update_cookie_log(LogAction::Add, &c, &url("https://absent.test/")));
    }

    #[test]
    fn backend_failures_are_no_ops() {
        let store = PolicyStore::open(Arc::new(FailingBackend)).unwrap();
        assert!(store.upsert(PolicyUpdate::negotiated("https://example.com", policy())).is_none());
        assert!(store.is_empty());
        assert!(!store.clear());
    }

    #[test]
    fn clear_drops_everything() {
        let store = PolicyStore::in_memory();
        select(&store, "https://example.com", &[1]);
        store.upsert(PolicyUpdate::unsupported("https://nopolicy.test", false)).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.clear());
        assert!(store.is_empty());
    }

    #[test]
    fn reopen_from_backend() {
        let backend: PolicyBackendHandle = Arc::new(InMemoryPolicyBackend::new());
        {
            let store = PolicyStore::open(backend.clone()).unwrap();
            select(&store, "https://example.com", &[1, 2]);
        }
        let store = PolicyStore::open(backend).unwrap();
        assert!(store.find_by_origin("https://example.com").unwrap().is_selected());
    }
}
