//! Policy negotiation.
//!
//! Decides, for a visited page, whether the consent banner has to be shown. Stored items
//! are consulted first. Only origins without any stored item reach out to the policy
//! service, and whatever comes back (or fails to) is persisted.

use std::sync::Arc;

use serde_json::json;
use url::Url;

use crate::engine::config::PolicyConfig;
use crate::engine::cookies::{Cookie, CookieDetails, CookieFilter, CookieJarHandle};
use crate::engine::errors::{CookieError, PolicyError};
use crate::engine::net::TransportHandle;
use crate::engine::policy::{
    check_url, domain_matches, is_web_url, matches_scope, merge_policy, origin_key, CookiePolicyItem, PolicyState,
    PolicyUpdate, ResolvedPolicy, ServerPolicy, ENFORCEMENT_COOKIE_NAME,
};
use crate::engine::storage::PolicyStore;

/// Result of a successful negotiation.
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation {
    /// Nothing to ask the user.
    NoBannerNeeded,
    /// The user has to choose. Carries the stored, not yet selected, item.
    BannerNeeded(ResolvedPolicy),
}

#[derive(Clone)]
pub struct Negotiator {
    config: Arc<PolicyConfig>,
    store: Arc<PolicyStore>,
    jar: CookieJarHandle,
    transport: TransportHandle,
}

impl Negotiator {
    pub fn new(config: Arc<PolicyConfig>, store: Arc<PolicyStore>, jar: CookieJarHandle, transport: TransportHandle) -> Self {
        Self { config, store, jar, transport }
    }

    /// Negotiates the policy for `visited`.
    ///
    /// Errors are part of the normal flow: [`PolicyError::PolicyNotSet`] asks the caller
    /// to reload once, [`PolicyError::PolicyServiceNotProvided`] classifies the site as
    /// unsupported.
    pub async fn negotiate(&self, visited: &Url) -> Result<Negotiation, PolicyError> {
        if !is_web_url(visited) {
            return Ok(Negotiation::NoBannerNeeded);
        }

        let host = visited.host_str().unwrap_or_default();
        if self.config.is_exempt(host) {
            log::trace!("{host} is exempt from cookie policies");
            return Ok(Negotiation::NoBannerNeeded);
        }

        let origin = origin_key(visited);

        match self.store.find_by_origin(&origin) {
            Some(CookiePolicyItem::Resolved(item)) => {
                if self.has_enforcement_cookie(visited) {
                    return Ok(match item.state {
                        PolicyState::Selected => Negotiation::NoBannerNeeded,
                        PolicyState::NotSelected => Negotiation::BannerNeeded(item),
                    });
                }

                if let Err(e) = self.write_enforcement_cookie(visited, &item) {
                    log::warn!("could not restore enforcement cookie for {origin}: {e}");
                }
                Err(PolicyError::PolicyNotSet { origin })
            }
            Some(CookiePolicyItem::Unsupported(item)) => {
                if item.accept_anyway {
                    Ok(Negotiation::NoBannerNeeded)
                } else {
                    Err(PolicyError::PolicyServiceNotProvided {
                        origin,
                        reason: "site was classified as unsupported".to_string(),
                    })
                }
            }
            None => self.fetch(visited, origin).await,
        }
    }

    async fn fetch(&self, visited: &Url, origin: String) -> Result<Negotiation, PolicyError> {
        let policy = match self.request_policy(visited, &origin).await {
            Ok(policy) => policy,
            Err(reason) => {
                log::info!("{origin} does not provide a cookie policy: {reason}");
                self.store.upsert(PolicyUpdate::unsupported(origin.clone(), false));
                return Err(PolicyError::PolicyServiceNotProvided { origin, reason });
            }
        };

        let in_scope = check_url(&policy.scope, visited.scheme() == "https")
            .map(|scope| matches_scope(visited, &scope))
            .unwrap_or(false);

        if !in_scope {
            let err = PolicyError::InvalidScope {
                visited: visited.to_string(),
                scope: policy.scope,
            };
            log::warn!("rejecting policy: {err}");
            return Ok(Negotiation::NoBannerNeeded);
        }

        log::debug!("received policy v{} for scope {} from {origin}", policy.version, policy.scope);

        let update = PolicyUpdate::negotiated(origin.clone(), policy);
        let item = match self.store.upsert(update.clone()) {
            Some(item) => item,
            // Not persisted. Still ask the user, the choice is stored on submit.
            None => merge_policy(None, update)?,
        };

        match item {
            CookiePolicyItem::Resolved(item) => {
                if let Err(e) = self.write_enforcement_cookie(visited, &item) {
                    log::warn!("could not write enforcement cookie for {origin}: {e}");
                }
                Ok(Negotiation::BannerNeeded(item))
            }
            CookiePolicyItem::Unsupported(_) => Ok(Negotiation::NoBannerNeeded),
        }
    }

    async fn request_policy(&self, visited: &Url, origin: &str) -> Result<ServerPolicy, String> {
        let url = self.config.service_url(origin).map_err(|e| e.to_string())?;
        let body = json!({
            "version": self.config.protocol_version,
            "visitedSite": visited.as_str(),
        });

        let value = self.transport.post_json(url, body).await.map_err(|e| e.to_string())?;
        serde_json::from_value(value).map_err(|e| format!("malformed policy: {e}"))
    }

    /// Returns true when the enforcement cookie would be sent to `visited`.
    pub fn has_enforcement_cookie(&self, visited: &Url) -> bool {
        let filter = CookieFilter {
            url: Some(visited.clone()),
            name: Some(ENFORCEMENT_COOKIE_NAME.to_string()),
            domain: None,
        };
        !self.jar.get(&filter).is_empty()
    }

    /// Writes the enforcement cookie for `item`, scoped to the policy scope when it covers
    /// `visited`, otherwise to the visited host only.
    pub fn write_enforcement_cookie(&self, visited: &Url, item: &ResolvedPolicy) -> Result<Cookie, CookieError> {
        let host = visited.host_str().ok_or_else(|| CookieError::NoHost(visited.to_string()))?;
        let mut details = CookieDetails::new(visited.clone(), ENFORCEMENT_COOKIE_NAME, item.enforcement_value().to_cookie_value())
            .path("/");

        if let Some(scope_host) = check_url(&item.policy.scope, false).and_then(|u| u.host_str().map(str::to_string)) {
            if domain_matches(host, &scope_host) {
                details = details.domain(scope_host);
            }
        }

        self.jar.set(details)
    }

    /// Sends the user's choice back to the policy service. Best effort.
    pub async fn transmit_choice(&self, item: &ResolvedPolicy) {
        if !self.config.transmit_choices {
            return;
        }

        let url = match self.config.service_url(&item.source_url) {
            Ok(url) => url,
            Err(e) => {
                log::warn!("cannot transmit choice for {}: {e}", item.source_url);
                return;
            }
        };

        let body = match serde_json::to_value(item.enforcement_value()) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("cannot encode choice for {}: {e}", item.source_url);
                return;
            }
        };

        match self.transport.post_json(url, body).await {
            Ok(_) => log::debug!("transmitted cookie policy choice to {}", item.source_url),
            Err(e) => log::warn!("failed to transmit cookie policy choice to {}: {e}", item.source_url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cookies::{CookieJar, DefaultCookieJar};
    use crate::engine::net::testing::{Reply, ScriptedTransport};
    use crate::engine::policy::fixtures::policy;
    use crate::engine::policy::{generate_defaults, PolicyChoice};

    struct Fixture {
        negotiator: Negotiator,
        store: Arc<PolicyStore>,
        jar: Arc<DefaultCookieJar>,
        transport: Arc<ScriptedTransport>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(PolicyStore::in_memory());
        let jar = Arc::new(DefaultCookieJar::new());
        let transport = ScriptedTransport::new();
        let negotiator = Negotiator::new(
            Arc::new(PolicyConfig::default()),
            store.clone(),
            jar.clone(),
            transport.clone(),
        );
        Fixture { negotiator, store, jar, transport }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn exempt_and_non_web_urls_skip_negotiation() {
        let f = fixture();
        assert_eq!(f.negotiator.negotiate(&url("http://localhost:4444/newtab")).await, Ok(Negotiation::NoBannerNeeded));
        assert_eq!(f.negotiator.negotiate(&url("about:blank")).await, Ok(Negotiation::NoBannerNeeded));
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn first_contact_persists_not_selected_item() {
        let f = fixture();
        f.transport.reply("https://www.example.com", Reply::Json(serde_json::to_value(policy()).unwrap()));

        let visited = url("https://www.example.com/shop?item=1");
        let Negotiation::BannerNeeded(item) = f.negotiator.negotiate(&visited).await.unwrap() else {
            panic!("banner expected");
        };
        assert_eq!(item.source_url, "https://www.example.com");
        assert_eq!(item.state, PolicyState::NotSelected);

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.as_str(), "https://www.example.com/CookiePolicyManager");
        assert_eq!(requests[0].1, json!({"version": 0, "visitedSite": "https://www.example.com/shop?item=1"}));

        assert!(!f.store.find_by_url(&visited).unwrap().is_selected());
        assert!(f.negotiator.has_enforcement_cookie(&visited));

        // Second visit is answered from the store.
        assert!(matches!(f.negotiator.negotiate(&visited).await, Ok(Negotiation::BannerNeeded(_))));
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn failure_classifies_site_as_unsupported() {
        let f = fixture();
        f.transport.reply("https://nopolicy.test", Reply::Status(404));
        let visited = url("https://nopolicy.test/");

        let err = f.negotiator.negotiate(&visited).await.unwrap_err();
        assert!(matches!(err, PolicyError::PolicyServiceNotProvided { ref origin, .. } if origin == "https://nopolicy.test"));
        assert!(matches!(f.store.find_by_url(&visited), Some(CookiePolicyItem::Unsupported(_))));

        // Classified once, no further network traffic.
        let err = f.negotiator.negotiate(&visited).await.unwrap_err();
        assert!(matches!(err, PolicyError::PolicyServiceNotProvided { .. }));
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn empty_response_is_not_a_policy() {
        let f = fixture();
        f.transport.reply("https://empty.test", Reply::Json(json!({})));
        assert!(f.negotiator.negotiate(&url("https://empty.test/")).await.is_err());
    }

    #[tokio::test]
    async fn out_of_scope_policy_is_ignored() {
        let f = fixture();
        let mut p = policy();
        p.scope = "other.com".into();
        f.transport.reply("https://example.com", Reply::Json(serde_json::to_value(p).unwrap()));

        assert_eq!(f.negotiator.negotiate(&url("https://example.com/")).await, Ok(Negotiation::NoBannerNeeded));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn missing_enforcement_cookie_is_restored_without_network() {
        let f = fixture();
        let visited = url("https://www.example.com/");
        f.store.upsert(PolicyUpdate::negotiated("https://www.example.com", policy())).unwrap();

        assert_eq!(
            f.negotiator.negotiate(&visited).await,
            Err(PolicyError::PolicyNotSet { origin: "https://www.example.com".into() })
        );

        let cookies = f.jar.get(&CookieFilter::for_url(visited.clone()));
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].domain, "example.com");
        let value: serde_json::Value = serde_json::from_str(&cookies[0].value).unwrap();
        assert_eq!(value["version"], 1);

        // Cookie present now, still not selected.
        assert!(matches!(f.negotiator.negotiate(&visited).await, Ok(Negotiation::BannerNeeded(_))));

        let choice: PolicyChoice = generate_defaults(&policy());
        f.store.upsert(PolicyUpdate::submitted("https://www.example.com", None, choice)).unwrap();
        assert_eq!(f.negotiator.negotiate(&visited).await, Ok(Negotiation::NoBannerNeeded));
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn accepted_anyway_needs_no_banner() {
        let f = fixture();
        f.store.upsert(PolicyUpdate::unsupported("https://nopolicy.test", true)).unwrap();
        assert_eq!(f.negotiator.negotiate(&url("https://nopolicy.test/x")).await, Ok(Negotiation::NoBannerNeeded));
    }

    #[tokio::test]
    async fn choice_is_transmitted_in_submission_format() {
        let f = fixture();
        f.transport.reply("https://www.example.com", Reply::Json(json!({})));
        let item = f.store.upsert(PolicyUpdate::negotiated("https://www.example.com", policy())).unwrap();

        f.negotiator.transmit_choice(item.as_resolved().unwrap()).await;

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        let body = &requests[0].1;
        assert!(body.get("visitorId").is_some());
        assert!(body.get("purposeChoice").is_some());
        assert!(body.get("cookies").is_none());
    }
}
