//! Cookie policies: value types, scope matching, merging and negotiation.

mod merge;
mod negotiator;
mod scope;
mod types;

pub use types::{
    now_millis, AccessorChoice, AccessorId, CookieAccessor, CookieLog, CookieLogEntry,
    CookiePolicyItem, EnforcementValue, PolicyChoice, PolicyState, Purpose, PurposeChoice,
    PurposeId, ResolvedPolicy, ServerPolicy, UnsupportedPolicy, VisitorId, ENFORCEMENT_COOKIE_NAME,
};

pub use scope::{check_url, domain_matches, is_web_url, matches_scope, origin_key};

pub use merge::{accept_all, generate_defaults, merge_policy, toggle_accessor, toggle_purpose, PolicyUpdate, ResolvedUpdate};

pub use negotiator::{Negotiation, Negotiator};
