//! Policy merging and choice toggles.
//!
//! A stored [`CookiePolicyItem`] evolves through partial [`PolicyUpdate`]s. Precedence,
//! from low to high, is: generated defaults, the old item, the incoming update. The
//! identity of a resolved item (`visitor_id`, `consent_timestamp`) is fixed by the first
//! resolution and never changes afterwards.

use url::Url;

use crate::engine::errors::PolicyError;
use crate::engine::policy::types::{
    now_millis, AccessorChoice, AccessorId, CookieLog, CookiePolicyItem, PolicyChoice,
    PolicyState, PurposeChoice, PurposeId, ResolvedPolicy, ServerPolicy, UnsupportedPolicy,
};

/// A partial update to a stored policy item.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyUpdate {
    /// Terminal classification. Replaces whatever was stored.
    Unsupported(UnsupportedPolicy),
    Resolved(ResolvedUpdate),
}

/// Partial resolved item. Only the choices present in the maps are explicit.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedUpdate {
    pub source_url: String,
    pub state: PolicyState,
    /// Server policy the choices refer to. When absent, the stored policy is kept.
    pub policy: Option<ServerPolicy>,
    pub purpose_choice: PurposeChoice,
    pub cookie_accessor_choice: AccessorChoice,
    /// Replacement cookie log. When absent, the stored log is kept.
    pub cookies: Option<CookieLog>,
    /// Drop previously stored choices instead of layering the update over them.
    pub reset_choices: bool,
}

impl PolicyUpdate {
    /// A freshly negotiated policy without any user decision.
    pub fn negotiated(source_url: impl Into<String>, policy: ServerPolicy) -> Self {
        PolicyUpdate::Resolved(ResolvedUpdate {
            source_url: source_url.into(),
            state: PolicyState::NotSelected,
            policy: Some(policy),
            purpose_choice: PurposeChoice::new(),
            cookie_accessor_choice: AccessorChoice::new(),
            cookies: None,
            reset_choices: false,
        })
    }

    /// The user's submitted choice. Identity fields of `choice` are ignored.
    pub fn submitted(source_url: impl Into<String>, policy: Option<ServerPolicy>, choice: PolicyChoice) -> Self {
        PolicyUpdate::Resolved(ResolvedUpdate {
            source_url: source_url.into(),
            state: PolicyState::Selected,
            policy,
            purpose_choice: choice.purpose_choice,
            cookie_accessor_choice: choice.cookie_accessor_choice,
            cookies: None,
            reset_choices: false,
        })
    }

    /// Withdraws any decision: the item goes back to not-selected with default choices.
    pub fn revoked(source_url: impl Into<String>) -> Self {
        PolicyUpdate::Resolved(ResolvedUpdate {
            source_url: source_url.into(),
            state: PolicyState::NotSelected,
            policy: None,
            purpose_choice: PurposeChoice::new(),
            cookie_accessor_choice: AccessorChoice::new(),
            cookies: None,
            reset_choices: true,
        })
    }

    pub fn unsupported(source_url: impl Into<String>, accept_anyway: bool) -> Self {
        PolicyUpdate::Unsupported(UnsupportedPolicy {
            source_url: source_url.into(),
            accept_anyway,
        })
    }

    pub fn source_url(&self) -> &str {
        match self {
            PolicyUpdate::Unsupported(u) => &u.source_url,
            PolicyUpdate::Resolved(r) => &r.source_url,
        }
    }
}

/// Default choice for `policy`: everything off, a fresh visitor id and the current time.
pub fn generate_defaults(policy: &ServerPolicy) -> PolicyChoice {
    PolicyChoice {
        visitor_id: uuid::Uuid::new_v4(),
        consent_timestamp: now_millis(),
        purpose_choice: policy.purposes.iter().map(|p| (p.id, false)).collect(),
        cookie_accessor_choice: policy.cookie_accessors.iter().map(|a| (a.id, false)).collect(),
    }
}

/// Merges `incoming` into the `old` stored item.
///
/// Returns [`PolicyError::PolicyNotFound`] when the update carries no server policy and
/// there is no resolved item to take it from.
pub fn merge_policy(old: Option<&CookiePolicyItem>, incoming: PolicyUpdate) -> Result<CookiePolicyItem, PolicyError> {
    let update = match incoming {
        PolicyUpdate::Unsupported(u) => return Ok(CookiePolicyItem::Unsupported(u)),
        PolicyUpdate::Resolved(r) => r,
    };

    let old = old.and_then(CookiePolicyItem::as_resolved);

    let policy = match (update.policy, old) {
        (Some(policy), _) => policy,
        (None, Some(old)) => old.policy.clone(),
        (None, None) => {
            return Err(PolicyError::PolicyNotFound {
                origin: origin_of(&update.source_url),
            })
        }
    };

    let mut choice = generate_defaults(&policy);
    let mut cookies = CookieLog::new();

    if let Some(old) = old {
        choice.visitor_id = old.choice.visitor_id;
        choice.consent_timestamp = old.choice.consent_timestamp;
        cookies = old.cookies.clone();

        if !update.reset_choices {
            layer(&mut choice.purpose_choice, &old.choice.purpose_choice);
            layer(&mut choice.cookie_accessor_choice, &old.choice.cookie_accessor_choice);
        }
    }

    layer(&mut choice.purpose_choice, &update.purpose_choice);
    layer(&mut choice.cookie_accessor_choice, &update.cookie_accessor_choice);

    // Accessors follow the purposes this update touched, unless set explicitly.
    for accessor in &policy.cookie_accessors {
        if update.cookie_accessor_choice.contains_key(&accessor.id) {
            continue;
        }
        if accessor.purposes.iter().any(|p| update.purpose_choice.contains_key(p)) {
            let derived = all_granted(&choice.purpose_choice, &accessor.purposes);
            choice.cookie_accessor_choice.insert(accessor.id, derived);
        }
    }

    if let Some(log) = update.cookies {
        cookies = log;
    }

    Ok(CookiePolicyItem::Resolved(ResolvedPolicy {
        source_url: update.source_url,
        state: update.state,
        policy,
        choice,
        cookies,
    }))
}

/// Copies entries of `over` into `base`, but only for keys `base` already knows.
///
/// `base` always starts out as the defaults of the current server policy, so this
/// drops choices for ids the policy no longer declares.
fn layer<K: Ord + Copy>(base: &mut std::collections::BTreeMap<K, bool>, over: &std::collections::BTreeMap<K, bool>) {
    for (id, value) in over {
        if let Some(slot) = base.get_mut(id) {
            *slot = *value;
        }
    }
}

fn all_granted(purpose_choice: &PurposeChoice, purposes: &[PurposeId]) -> bool {
    purposes.iter().all(|p| purpose_choice.get(p).copied().unwrap_or(false))
}

fn origin_of(source_url: &str) -> String {
    Url::parse(source_url)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| source_url.to_string())
}

/// Sets purpose `id` and recomputes every accessor that depends on it.
pub fn toggle_purpose(policy: &ServerPolicy, choice: &mut PolicyChoice, id: PurposeId, value: bool) {
    choice.purpose_choice.insert(id, value);

    for accessor in policy.cookie_accessors.iter().filter(|a| a.depends_on(id)) {
        let derived = all_granted(&choice.purpose_choice, &accessor.purposes);
        choice.cookie_accessor_choice.insert(accessor.id, derived);
    }
}

/// Sets a single accessor. Purposes are left untouched.
pub fn toggle_accessor(choice: &mut PolicyChoice, id: AccessorId, value: bool) {
    choice.cookie_accessor_choice.insert(id, value);
}

/// Grants every purpose some accessor depends on, cascading to the accessors.
/// Accessors without any purpose are switched on as well.
pub fn accept_all(policy: &ServerPolicy, choice: &mut PolicyChoice) {
    for id in policy.depended_purposes() {
        toggle_purpose(policy, choice, id, true);
    }

    for accessor in policy.cookie_accessors.iter().filter(|a| a.purposes.is_empty()) {
        choice.cookie_accessor_choice.insert(accessor.id, true);
    }
}
