//! Policy value types.
//!
//! These records mirror what a site's policy service sends on the wire (a [`ServerPolicy`])
//! and what the browser keeps per visited origin (a [`CookiePolicyItem`]). Purpose and
//! accessor identifiers are only meaningful relative to the `ServerPolicy` version that
//! issued them.
//!
//! Field names are serialized in camelCase, matching the JSON used by the
//! `/CookiePolicyManager` endpoint and by the `cookiepolicy` enforcement cookie.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the cookie that carries the user's resolved choice for a scope.
pub const ENFORCEMENT_COOKIE_NAME: &str = "cookiepolicy";

/// Identifier of a [`Purpose`] within one [`ServerPolicy`] version.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurposeId(pub u32);

/// Identifier of a [`CookieAccessor`] within one [`ServerPolicy`] version.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessorId(pub u32);

impl Display for PurposeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for AccessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Visitor identifier handed out once per site on first resolution.
pub type VisitorId = Uuid;

/// Choice map for purposes.
pub type PurposeChoice = BTreeMap<PurposeId, bool>;

/// Choice map for cookie accessors.
pub type AccessorChoice = BTreeMap<AccessorId, bool>;

/// A single disclosed processing purpose (e.g. analytics).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purpose {
    pub id: PurposeId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub description_legal: String,
}

/// An entity that sets cookies, contingent on a set of purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieAccessor {
    pub id: AccessorId,
    pub name: String,
    /// Domain (optionally with scheme/port) the accessor sets cookies for.
    pub scope: String,
    #[serde(default)]
    pub purposes: Vec<PurposeId>,
}

impl CookieAccessor {
    /// Returns true when this accessor declares `purpose` as a dependency.
    pub fn depends_on(&self, purpose: PurposeId) -> bool {
        self.purposes.contains(&purpose)
    }
}

/// Policy template issued by a site's policy service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPolicy {
    pub scope: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub purposes: Vec<Purpose>,
    #[serde(default)]
    pub cookie_accessors: Vec<CookieAccessor>,
}

impl ServerPolicy {
    pub fn purpose(&self, id: PurposeId) -> Option<&Purpose> {
        self.purposes.iter().find(|p| p.id == id)
    }

    pub fn accessor(&self, id: AccessorId) -> Option<&CookieAccessor> {
        self.cookie_accessors.iter().find(|a| a.id == id)
    }

    /// Purposes that at least one accessor depends on. Purposes without dependents are
    /// informational only.
    pub fn depended_purposes(&self) -> Vec<PurposeId> {
        self.purposes
            .iter()
            .map(|p| p.id)
            .filter(|id| self.cookie_accessors.iter().any(|a| a.depends_on(*id)))
            .collect()
    }
}

/// The user's decision for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChoice {
    pub visitor_id: VisitorId,
    /// Unix timestamp in milliseconds of the first resolution.
    pub consent_timestamp: i64,
    #[serde(default)]
    pub purpose_choice: PurposeChoice,
    #[serde(default)]
    pub cookie_accessor_choice: AccessorChoice,
}

/// One cookie that was allowed to be set while visiting `url`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CookieLogEntry {
    /// Domain of the cookie (the setter).
    pub setter: String,
    /// Origin of the visited page at the time the cookie was set.
    pub url: String,
    /// Cookie name.
    pub name: String,
}

/// Insertion-ordered set of [`CookieLogEntry`] records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieLog(Vec<CookieLogEntry>);

impl CookieLog {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Adds `entry` unless an identical entry is already present. Returns true when added.
    pub fn insert(&mut self, entry: CookieLogEntry) -> bool {
        if self.0.contains(&entry) {
            return false;
        }
        self.0.push(entry);
        true
    }

    /// Removes `entry`. Returns true when it was present.
    pub fn remove(&mut self, entry: &CookieLogEntry) -> bool {
        let before = self.0.len();
        self.0.retain(|e| e != entry);
        before != self.0.len()
    }

    pub fn contains(&self, entry: &CookieLogEntry) -> bool {
        self.0.contains(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CookieLogEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Whether the user has made a choice for a resolved policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyState {
    Selected,
    NotSelected,
}

/// A site that does not implement the negotiation protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsupportedPolicy {
    pub source_url: String,
    /// The user chose to continue without a policy. Cookies stay denied.
    #[serde(default)]
    pub accept_anyway: bool,
}

/// A site with a negotiated server policy and (possibly default) choices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPolicy {
    /// Origin of the visited page this item is keyed by.
    pub source_url: String,
    pub state: PolicyState,
    pub policy: ServerPolicy,
    pub choice: PolicyChoice,
    #[serde(default)]
    pub cookies: CookieLog,
}

impl ResolvedPolicy {
    /// Derived availability of an accessor: every declared purpose is chosen and the
    /// accessor itself has not been switched off.
    pub fn accessor_available(&self, id: AccessorId) -> bool {
        let Some(accessor) = self.policy.accessor(id) else {
            return false;
        };

        let purposes_granted = accessor
            .purposes
            .iter()
            .all(|p| self.choice.purpose_choice.get(p).copied().unwrap_or(false));

        purposes_granted && self.choice.cookie_accessor_choice.get(&id).copied() != Some(false)
    }

    /// Value stored in the `cookiepolicy` enforcement cookie.
    pub fn enforcement_value(&self) -> EnforcementValue {
        EnforcementValue {
            version: self.policy.version,
            visitor_id: self.choice.visitor_id,
            consent_timestamp: self.choice.consent_timestamp,
            purpose_choice: self.choice.purpose_choice.clone(),
            cookie_accessor_choice: self.choice.cookie_accessor_choice.clone(),
        }
    }
}

/// Persisted per-site record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CookiePolicyItem {
    Unsupported(UnsupportedPolicy),
    Resolved(ResolvedPolicy),
}

impl CookiePolicyItem {
    pub fn source_url(&self) -> &str {
        match self {
            CookiePolicyItem::Unsupported(u) => &u.source_url,
            CookiePolicyItem::Resolved(r) => &r.source_url,
        }
    }

    pub fn as_resolved(&self) -> Option<&ResolvedPolicy> {
        match self {
            CookiePolicyItem::Resolved(r) => Some(r),
            CookiePolicyItem::Unsupported(_) => None,
        }
    }

    pub fn as_resolved_mut(&mut self) -> Option<&mut ResolvedPolicy> {
        match self {
            CookiePolicyItem::Resolved(r) => Some(r),
            CookiePolicyItem::Unsupported(_) => None,
        }
    }

    /// A policy is resolved for display purposes when the user made a choice.
    pub fn is_selected(&self) -> bool {
        matches!(self, CookiePolicyItem::Resolved(r) if r.state == PolicyState::Selected)
    }
}

/// JSON value of the enforcement cookie. The cookie log and UI fields are never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementValue {
    pub version: u32,
    pub visitor_id: VisitorId,
    pub consent_timestamp: i64,
    pub purpose_choice: PurposeChoice,
    pub cookie_accessor_choice: AccessorChoice,
}

impl EnforcementValue {
    pub fn to_cookie_value(&self) -> String {
        // Plain maps of ints and bools always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Current time as unix milliseconds, used for consent timestamps.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
