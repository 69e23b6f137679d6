use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::config::PolicyConfig;
use crate::engine::consent::{BannerEndpoint, ConsentCommand, ConsentMultiplexer};
use crate::engine::cookies::{CookieJarHandle, DefaultCookieJar};
use crate::engine::errors::{EngineError, TransportError};
use crate::engine::events::PolicyEvent;
use crate::engine::net::{HttpTransport, TransportHandle};
use crate::engine::policy::Negotiator;
use crate::engine::session::{SessionContext, SessionHandle, SessionWorker};
use crate::engine::storage::PolicyStore;

/// External collaborators of the engine.
#[derive(Clone)]
pub struct PolicyServices {
    /// Where policy items are kept
    pub store: Arc<PolicyStore>,
    /// The browser's cookie store, shared by all sessions
    pub jar: CookieJarHandle,
    /// Transport to the sites' policy services
    pub transport: TransportHandle,
}

impl PolicyServices {
    /// Nothing persisted: an in-memory store, an in-memory jar and the HTTP transport.
    pub fn ephemeral(config: &PolicyConfig) -> Result<Self, TransportError> {
        Ok(Self {
            store: Arc::new(PolicyStore::in_memory()),
            jar: Arc::new(DefaultCookieJar::new()),
            transport: Arc::new(HttpTransport::new(config)?),
        })
    }
}

/// The cookie policy engine.
///
/// Owns the consent multiplexer and spawns one worker per browsing session. All of them
/// share the store, the cookie jar and the event bus.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use gosub_cookie_policy::config::PolicyConfig;
/// use gosub_cookie_policy::{PolicyEngine, PolicyServices};
///
/// let config = PolicyConfig::default();
/// let services = PolicyServices::ephemeral(&config)?;
/// let mut engine = PolicyEngine::new(config, services)?;
/// let mut banner = engine.start()?;
///
/// let session = engine.open_session(true)?;
/// session.load_started("https://example.com/".parse()?).await?;
/// session.load_finished("https://example.com/".parse()?).await?;
///
/// while let Some(msg) = banner.recv().await {
///     println!("{msg:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct PolicyEngine {
    config: Arc<PolicyConfig>,
    services: PolicyServices,
    /// Event bus towards the host
    event_tx: broadcast::Sender<PolicyEvent>,
    consent_tx: mpsc::Sender<ConsentCommand>,
    /// Taken when the multiplexer is started
    consent_rx: Option<mpsc::Receiver<ConsentCommand>>,
    shutdown: CancellationToken,
    /// Join handle of the consent multiplexer
    join_handle: Option<JoinHandle<()>>,
}

impl PolicyEngine {
    /// Creates a new engine. Nothing runs until [`start`](Self::start) is called.
    pub fn new(config: PolicyConfig, services: PolicyServices) -> Result<Self, EngineError> {
        config.validate()?;

        let (event_tx, _first_rx) = broadcast::channel(config.channel_capacity);
        let (consent_tx, consent_rx) = mpsc::channel(config.channel_capacity);

        Ok(Self {
            config: Arc::new(config),
            services,
            event_tx,
            consent_tx,
            consent_rx: Some(consent_rx),
            shutdown: CancellationToken::new(),
            join_handle: None,
        })
    }

    /// Starts the consent multiplexer and returns the host's end of the consent UI channel.
    pub fn start(&mut self) -> Result<BannerEndpoint, EngineError> {
        let Some(consent_rx) = self.consent_rx.take() else {
            return Err(EngineError::AlreadyRunning);
        };

        let (ui_tx, ui_rx) = mpsc::channel(self.config.channel_capacity);
        let (action_tx, action_rx) = mpsc::channel(self.config.channel_capacity);

        let multiplexer = ConsentMultiplexer::new(
            self.config.clone(),
            self.services.store.clone(),
            self.event_tx.clone(),
            consent_rx,
            action_rx,
            ui_tx,
            self.shutdown.child_token(),
        );
        self.join_handle = Some(tokio::spawn(multiplexer.run()));

        log::info!("cookie policy engine started ({} stored policies)", self.services.store.len());
        Ok(BannerEndpoint::new(ui_rx, action_tx))
    }

    pub fn is_running(&self) -> bool {
        self.join_handle.is_some() && !self.shutdown.is_cancelled()
    }

    /// Opens a browsing session and spawns its worker.
    pub fn open_session(&self, active: bool) -> Result<SessionHandle, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let ctx = Arc::new(SessionContext {
            config: self.config.clone(),
            store: self.services.store.clone(),
            jar: self.services.jar.clone(),
            negotiator: Negotiator::new(
                self.config.clone(),
                self.services.store.clone(),
                self.services.jar.clone(),
                self.services.transport.clone(),
            ),
            event_tx: self.event_tx.clone(),
            consent_tx: self.consent_tx.clone(),
            shutdown: self.shutdown.child_token(),
        });

        let (worker, handle) = SessionWorker::new(ctx, active);
        tokio::spawn(worker.run());

        Ok(handle)
    }

    /// Subscribes to engine events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PolicyEvent> {
        self.event_tx.subscribe()
    }

    /// Tells the multiplexer the window hosting the consent UI lost focus.
    pub async fn focus_lost(&self) -> Result<(), EngineError> {
        self.consent_tx
            .send(ConsentCommand::FocusLost)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Removes every stored policy item.
    pub fn clear_policy_storage(&self) -> bool {
        let cleared = self.services.store.clear();
        if cleared {
            let _ = self.event_tx.send(PolicyEvent::PolicyStorageCleared);
        }
        cleared
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.services.store
    }

    pub fn cookie_jar(&self) -> &CookieJarHandle {
        &self.services.jar
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Stops every session and the multiplexer.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let Some(join_handle) = self.join_handle.take() else {
            return Err(EngineError::NotRunning);
        };

        self.shutdown.cancel();
        if let Err(e) = join_handle.await {
            log::warn!("consent multiplexer ended abnormally: {e}");
        }

        log::info!("cookie policy engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::engine::consent::{BannerMode, UiAction, UiMessage};
    use crate::engine::cookies::{CookieDetails, CookieFilter, CookieJar};
    use crate::engine::events::{NegotiationOutcome, SessionCommand};
    use crate::engine::net::testing::{Reply, ScriptedTransport};
    use crate::engine::policy::fixtures::policy;
    use crate::engine::policy::{AccessorId, CookiePolicyItem, PolicyState, PurposeId, ENFORCEMENT_COOKIE_NAME};

    struct Harness {
        engine: PolicyEngine,
        banner: BannerEndpoint,
        events: broadcast::Receiver<PolicyEvent>,
        jar: Arc<DefaultCookieJar>,
        transport: Arc<ScriptedTransport>,
    }

    fn harness() -> Harness {
        let jar = Arc::new(DefaultCookieJar::new());
        let transport = ScriptedTransport::new();
        transport.reply("https://www.example.com", Reply::Json(serde_json::to_value(policy()).unwrap()));

        let services = PolicyServices {
            store: Arc::new(PolicyStore::in_memory()),
            jar: jar.clone(),
            transport: transport.clone(),
        };
        let mut engine = PolicyEngine::new(PolicyConfig::default(), services).unwrap();
        let banner = engine.start().unwrap();
        let events = engine.subscribe_events();

        Harness { engine, banner, events, jar, transport }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn next_ui(banner: &mut BannerEndpoint) -> UiMessage {
        tokio::time::timeout(Duration::from_secs(5), banner.recv())
            .await
            .expect("ui message timed out")
            .expect("ui channel closed")
    }

    /// Waits for the first event matching `pred`.
    async fn wait_for(events: &mut broadcast::Receiver<PolicyEvent>, pred: impl Fn(&PolicyEvent) -> bool) -> PolicyEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("event timed out")
    }

    async fn visit(session: &SessionHandle, page: &Url) {
        session.load_started(page.clone()).await.unwrap();
        session.load_finished(page.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let config = PolicyConfig::default();
        let services = PolicyServices {
            store: Arc::new(PolicyStore::in_memory()),
            jar: Arc::new(DefaultCookieJar::new()),
            transport: ScriptedTransport::new(),
        };
        let mut engine = PolicyEngine::new(config, services).unwrap();

        assert!(matches!(engine.open_session(true), Err(EngineError::NotRunning)));
        let _banner = engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
        assert!(engine.open_session(true).is_ok());

        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());
        assert!(matches!(engine.shutdown().await, Err(EngineError::NotRunning)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = PolicyConfig::default();
        config.channel_capacity = 0;
        let services = PolicyServices {
            store: Arc::new(PolicyStore::in_memory()),
            jar: Arc::new(DefaultCookieJar::new()),
            transport: ScriptedTransport::new(),
        };
        assert!(matches!(PolicyEngine::new(config, services), Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn first_visit_shows_banner_and_submission_enforces_choice() {
        let mut h = harness();
        let session = h.engine.open_session(true).unwrap();
        let page = url("https://www.example.com/");

        visit(&session, &page).await;

        let UiMessage::Show(show) = next_ui(&mut h.banner).await else {
            panic!("show expected");
        };
        assert_eq!(show.issuer, session.id());
        assert_eq!(show.mode, BannerMode::Policy);
        let item = show.policy.expect("policy payload");
        assert_eq!(item.state, PolicyState::NotSelected);

        // Nothing is allowed before a choice was made.
        h.jar
            .set(CookieDetails::new(url("https://tracker.test/"), "t", "1").path("/"))
            .unwrap();
        let removed = wait_for(&mut h.events, |e| matches!(e, PolicyEvent::CookieRemoved { .. })).await;
        let PolicyEvent::CookieRemoved { cookie, .. } = removed else { unreachable!() };
        assert_eq!(cookie.name, "t");

        let mut choice = item.choice.clone();
        choice.purpose_choice.insert(PurposeId(1), true);
        choice.cookie_accessor_choice.insert(AccessorId(10), true);
        h.banner
            .send(UiAction::Submit {
                issuer: session.id(),
                source_url: item.source_url.clone(),
                policy: choice,
            })
            .await
            .unwrap();

        assert_eq!(next_ui(&mut h.banner).await, UiMessage::Destroy);
        wait_for(&mut h.events, |e| matches!(e, PolicyEvent::Reload { session_id } if *session_id == session.id())).await;

        assert!(h.engine.store().find_by_url(&page).unwrap().is_selected());
        let enforcement = h.jar.get(&CookieFilter {
            url: Some(page.clone()),
            name: Some(ENFORCEMENT_COOKIE_NAME.into()),
            domain: None,
        });
        assert_eq!(enforcement.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&enforcement[0].value).unwrap();
        assert_eq!(value["purposeChoice"]["1"], true);

        // Ads are allowed now and end up in the cookie log.
        h.jar
            .set(CookieDetails::new(url("https://ads.example.com/"), "ad", "1").path("/"))
            .unwrap();
        let logged = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let item = h.engine.store().find_by_url(&page).unwrap();
                if !item.as_resolved().unwrap().cookies.is_empty() {
                    return item;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(logged.as_resolved().unwrap().cookies.iter().next().unwrap().name, "ad");
        assert_eq!(h.jar.get(&CookieFilter::for_domain("ads.example.com")).len(), 1);
    }

    #[tokio::test]
    async fn unsupported_site_stops_loading_and_can_be_accepted_anyway() {
        let mut h = harness();
        let session = h.engine.open_session(true).unwrap();
        let page = url("https://nopolicy.test/");

        visit(&session, &page).await;

        wait_for(&mut h.events, |e| matches!(e, PolicyEvent::StopLoading { .. })).await;
        let UiMessage::Show(show) = next_ui(&mut h.banner).await else {
            panic!("show expected");
        };
        assert_eq!(show.mode, BannerMode::Message);
        assert_eq!(show.source_url.as_deref(), Some("https://nopolicy.test"));
        assert!(show.headline.is_some());

        h.banner.send(UiAction::AcceptAnyway { issuer: session.id() }).await.unwrap();
        assert_eq!(next_ui(&mut h.banner).await, UiMessage::Destroy);
        wait_for(&mut h.events, |e| matches!(e, PolicyEvent::Reload { .. })).await;

        assert!(matches!(
            h.engine.store().find_by_url(&page),
            Some(CookiePolicyItem::Unsupported(u)) if u.accept_anyway
        ));

        // The reload negotiates again, this time without banner or network.
        visit(&session, &page).await;
        let finished = wait_for(&mut h.events, |e| matches!(e, PolicyEvent::NegotiationFinished { .. })).await;
        assert!(matches!(
            finished,
            PolicyEvent::NegotiationFinished { outcome: NegotiationOutcome::NoBannerNeeded, .. }
        ));
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn missing_enforcement_cookie_reloads_once() {
        let mut h = harness();
        let session = h.engine.open_session(true).unwrap();
        let page = url("https://www.example.com/");

        visit(&session, &page).await;
        let _ = next_ui(&mut h.banner).await;
        h.banner.send(UiAction::Close { issuer: session.id() }).await.unwrap();
        assert_eq!(next_ui(&mut h.banner).await, UiMessage::Destroy);

        // Browser data cleared.
        h.jar.clear();
        visit(&session, &page).await;

        wait_for(&mut h.events, |e| matches!(e, PolicyEvent::Reload { .. })).await;
        wait_for(&mut h.events, |e| {
            matches!(e, PolicyEvent::NegotiationFinished { outcome: NegotiationOutcome::Reload, .. })
        })
        .await;

        // After the reload the cookie is back and the banner shows again.
        visit(&session, &page).await;
        let UiMessage::Show(show) = next_ui(&mut h.banner).await else {
            panic!("show expected");
        };
        assert_eq!(show.mode, BannerMode::Policy);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn navigating_away_discards_the_pending_negotiation() {
        let mut h = harness();
        let slow = Reply::Delayed(Duration::from_millis(300), Box::new(Reply::Json(serde_json::to_value(policy()).unwrap())));
        h.transport.reply("https://www.example.com", slow);
        let session = h.engine.open_session(true).unwrap();

        visit(&session, &url("https://www.example.com/")).await;
        visit(&session, &url("https://nopolicy.test/")).await;

        let discarded = wait_for(&mut h.events, |e| matches!(e, PolicyEvent::NegotiationFinished { .. })).await;
        assert_eq!(
            discarded,
            PolicyEvent::NegotiationFinished {
                session_id: session.id(),
                origin: "https://www.example.com".into(),
                outcome: NegotiationOutcome::Discarded,
            }
        );

        let UiMessage::Show(show) = next_ui(&mut h.banner).await else {
            panic!("show expected");
        };
        assert_eq!(show.mode, BannerMode::Message);
        assert_eq!(show.source_url.as_deref(), Some("https://nopolicy.test"));

        // Well past the slow reply: nothing shows up for the page that was left.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.banner.try_recv().is_none());
        assert!(h.engine.store().find_by_origin("https://www.example.com").is_none());
        while let Ok(event) = h.events.try_recv() {
            if let PolicyEvent::NegotiationFinished { origin, outcome, .. } = event {
                assert!(origin != "https://www.example.com" || outcome == NegotiationOutcome::Discarded);
            }
        }
    }

    #[tokio::test]
    async fn background_session_defers_banner_until_activated() {
        let mut h = harness();
        let session = h.engine.open_session(false).unwrap();

        visit(&session, &url("https://www.example.com/")).await;
        wait_for(&mut h.events, |e| {
            matches!(e, PolicyEvent::NegotiationFinished { outcome: NegotiationOutcome::BannerNeeded, .. })
        })
        .await;
        assert!(h.banner.try_recv().is_none());

        session.set_active(true).await.unwrap();
        let UiMessage::Show(show) = next_ui(&mut h.banner).await else {
            panic!("show expected");
        };
        assert_eq!(show.issuer, session.id());
    }

    #[tokio::test]
    async fn go_back_uses_history_or_default_page() {
        let mut h = harness();
        let session = h.engine.open_session(true).unwrap();

        session.send(SessionCommand::GoBack).await.unwrap();
        let event = wait_for(&mut h.events, |e| matches!(e, PolicyEvent::Navigate { .. })).await;
        assert!(matches!(event, PolicyEvent::Navigate { url, .. } if url.as_str() == "about:blank"));

        session.load_started(url("http://localhost/a")).await.unwrap();
        session.load_started(url("http://localhost/b")).await.unwrap();
        session.send(SessionCommand::GoBack).await.unwrap();
        wait_for(&mut h.events, |e| matches!(e, PolicyEvent::NavigateBack { .. })).await;
    }

    #[tokio::test]
    async fn closing_a_session_tears_down_its_banner() {
        let mut h = harness();
        let session = h.engine.open_session(true).unwrap();

        visit(&session, &url("https://www.example.com/")).await;
        let _ = next_ui(&mut h.banner).await;

        session.close().await.unwrap();
        assert_eq!(next_ui(&mut h.banner).await, UiMessage::Destroy);
        wait_for(&mut h.events, |e| matches!(e, PolicyEvent::SessionClosed { .. })).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(session.show_banner().await, Err(EngineError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn clear_policy_storage_empties_the_store() {
        let mut h = harness();
        let session = h.engine.open_session(true).unwrap();
        visit(&session, &url("https://www.example.com/")).await;
        let _ = next_ui(&mut h.banner).await;

        assert_eq!(h.engine.store().len(), 1);
        assert!(h.engine.clear_policy_storage());
        assert!(h.engine.store().is_empty());
        wait_for(&mut h.events, |e| *e == PolicyEvent::PolicyStorageCleared).await;
    }
}
