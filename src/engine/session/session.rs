use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::engine::config::PolicyConfig;
use crate::engine::consent::{BannerRequest, ConsentCommand};
use crate::engine::cookies::{Cookie, CookieChange, CookieJarHandle};
use crate::engine::errors::PolicyError;
use crate::engine::events::{NegotiationOutcome, PolicyEvent, SessionCommand};
use crate::engine::policy::{is_web_url, origin_key, CookiePolicyItem, Negotiation, Negotiator};
use crate::engine::session::{CookieMonitor, SessionHandle, Verdict};
use crate::engine::storage::PolicyStore;

/// A unique identifier for a browsing session (tab or view).
///
/// Also used as the `issuer` of consent UI messages. Treat it as an opaque handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a session shares with the engine and the other sessions.
pub(crate) struct SessionContext {
    pub config: Arc<PolicyConfig>,
    pub store: Arc<PolicyStore>,
    pub jar: CookieJarHandle,
    pub negotiator: Negotiator,
    pub event_tx: broadcast::Sender<PolicyEvent>,
    pub consent_tx: mpsc::Sender<ConsentCommand>,
    /// Cancelled when the engine shuts down
    pub shutdown: CancellationToken,
}

/// A negotiation running for the page the session is showing. Replaced (and cancelled)
/// when the session navigates.
struct InflightNegotiation {
    origin: String,
    cancel: CancellationToken,
    rx: oneshot::Receiver<Result<Negotiation, PolicyError>>,
}

/// Resolves with the result of the in-flight negotiation. Never resolves without one.
async fn negotiation_result(
    inflight: &mut Option<InflightNegotiation>,
) -> Result<Result<Negotiation, PolicyError>, oneshot::error::RecvError> {
    match inflight {
        Some(n) => (&mut n.rx).await,
        None => futures::future::pending().await,
    }
}

/// Worker driving a single browsing session.
///
/// Commands are handled one at a time in the order they were queued. Cookie changes and
/// negotiation results are interleaved with them on the same task.
pub(crate) struct SessionWorker {
    id: SessionId,
    ctx: Arc<SessionContext>,

    cmd_rx: mpsc::Receiver<SessionCommand>,
    /// Weak, so the queue closes once every external handle is gone
    cmd_tx: mpsc::WeakSender<SessionCommand>,
    cookie_rx: broadcast::Receiver<CookieChange>,

    monitor: CookieMonitor,
    inflight: Option<InflightNegotiation>,

    /// Is this the selected session
    active: bool,
    /// Page shown (or being loaded)
    current_url: Option<Url>,
    /// Previously visited pages, oldest first
    history: Vec<Url>,
    /// Set while the host navigates back on our request
    navigating_back: bool,
    /// Origin for which a reload was already requested after rewriting the enforcement cookie
    reloaded_for: Option<String>,
    /// Banner that could not be shown because the session was in the background
    deferred_banner: Option<BannerRequest>,
}

impl SessionWorker {
    /// Creates a session and its command queue. Does NOT spawn the worker.
    pub(crate) fn new(ctx: Arc<SessionContext>, active: bool) -> (Self, SessionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(ctx.config.channel_capacity);
        let id = SessionId::new();

        let worker = Self {
            id,
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            cookie_rx: ctx.jar.subscribe(),
            monitor: CookieMonitor::new(ctx.store.clone(), ctx.jar.clone()),
            inflight: None,
            active,
            current_url: None,
            history: Vec::new(),
            navigating_back: false,
            reloaded_for: None,
            deferred_banner: None,
            ctx,
        };

        (worker, SessionHandle::new(id, cmd_tx))
    }

    /// Main session loop.
    pub(crate) async fn run(mut self) {
        log::debug!("session {} started", self.id);
        self.emit(PolicyEvent::SessionOpened { session_id: self.id });

        let shutdown = self.ctx.shutdown.clone();
        let mut cookies_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                msg = self.cmd_rx.recv() => {
                    let Some(cmd) = msg else {
                        // Every handle dropped
                        break;
                    };

                    if cmd == SessionCommand::Close {
                        break;
                    }
                    self.handle_command(cmd).await;
                }

                change = self.cookie_rx.recv(), if cookies_open => {
                    match change {
                        Ok(change) => self.handle_cookie_change(&change),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("session {} missed {skipped} cookie change(s)", self.id);
                            self.emit(PolicyEvent::CookiesLagged { session_id: self.id, skipped });
                        }
                        Err(broadcast::error::RecvError::Closed) => cookies_open = false,
                    }
                }

                res = negotiation_result(&mut self.inflight) => {
                    let Some(negotiation) = self.inflight.take() else {
                        continue;
                    };
                    match res {
                        Ok(result) => self.handle_negotiation(negotiation.origin, result).await,
                        // Cancelled
                        Err(_) => log::trace!("session {} negotiation for {} dropped", self.id, negotiation.origin),
                    }
                }
            }
        }

        if let Some(n) = self.inflight.take() {
            n.cancel.cancel();
        }
        let _ = self.ctx.consent_tx.send(ConsentCommand::SessionClosed { issuer: self.id }).await;
        self.emit(PolicyEvent::SessionClosed { session_id: self.id });
        log::debug!("session {} exiting", self.id);
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        log::trace!("session {} command: {cmd:?}", self.id);

        match cmd {
            SessionCommand::LoadStarted { url } => self.load_started(url),
            SessionCommand::LoadFinished { url } => self.load_finished(url),
            SessionCommand::SetActive(active) => {
                self.active = active;
                if active {
                    self.activated().await;
                }
            }
            SessionCommand::PolicySubmitted { source_url } => self.policy_submitted(&source_url),
            SessionCommand::SweepCookieLog => self.sweep_cookie_log(),
            SessionCommand::ShowBanner => self.show_banner().await,
            SessionCommand::GoBack => self.go_back(),
            SessionCommand::Reload => self.emit(PolicyEvent::Reload { session_id: self.id }),
            SessionCommand::Close => {}
        }
    }

    fn load_started(&mut self, url: Url) {
        self.cancel_negotiation();
        self.monitor.start_loading();
        self.deferred_banner = None;

        if let Some(previous) = self.current_url.take() {
            if origin_key(&previous) != origin_key(&url) {
                self.reloaded_for = None;
            }
            if previous != url && !self.navigating_back {
                self.history.push(previous);
            }
        }
        self.navigating_back = false;
        self.current_url = Some(url);
    }

    fn load_finished(&mut self, url: Url) {
        self.current_url = Some(url.clone());

        let removed = self.monitor.finished_loading();
        self.report_removed(removed);

        if !self.active {
            if let Some(url) = self.enforced_url() {
                let removed = self.monitor.sweep_jar(&url);
                self.report_removed(removed);
            }
        }

        self.start_negotiation(url);
    }

    async fn activated(&mut self) {
        if self.monitor.is_loading() {
            return;
        }

        if let Some(url) = self.enforced_url() {
            let removed = self.monitor.sweep_jar(&url);
            self.report_removed(removed);
        }

        if let Some(request) = self.deferred_banner.take() {
            self.request_banner(request).await;
        }
    }

    /// The user made a choice for `source_url`: rewrite the enforcement cookie, retract
    /// logged cookies that lost their permission and reload.
    fn policy_submitted(&mut self, source_url: &str) {
        let Some(url) = self.current_url.clone() else {
            return;
        };
        if origin_key(&url) != source_url {
            log::warn!("session {} got a choice for {source_url} while showing {url}", self.id);
        }

        match self.ctx.store.find_by_origin(source_url) {
            Some(CookiePolicyItem::Resolved(item)) => {
                if let Err(e) = self.ctx.negotiator.write_enforcement_cookie(&url, &item) {
                    log::warn!("session {} could not write enforcement cookie: {e}", self.id);
                }

                let removed = self.monitor.sweep_cookie_log(&url);
                self.report_removed(removed);

                let negotiator = self.ctx.negotiator.clone();
                tokio::spawn(async move { negotiator.transmit_choice(&item).await });
            }
            _ => log::warn!("session {} has no resolved policy for {source_url}", self.id),
        }

        self.emit(PolicyEvent::Reload { session_id: self.id });
    }

    fn sweep_cookie_log(&mut self) {
        let Some(url) = self.current_url.clone() else {
            return;
        };

        if let Some(CookiePolicyItem::Resolved(item)) = self.ctx.store.find_by_url(&url) {
            if let Err(e) = self.ctx.negotiator.write_enforcement_cookie(&url, &item) {
                log::warn!("session {} could not write enforcement cookie: {e}", self.id);
            }
        }

        let removed = self.monitor.sweep_cookie_log(&url);
        self.report_removed(removed);
    }

    async fn show_banner(&mut self) {
        let Some(url) = self.enforced_url() else {
            return;
        };

        match self.ctx.store.find_by_url(&url) {
            Some(CookiePolicyItem::Resolved(item)) => self.request_banner(BannerRequest::Policy { item }).await,
            Some(CookiePolicyItem::Unsupported(item)) => {
                self.request_banner(BannerRequest::Message { source_url: item.source_url }).await
            }
            None => self.start_negotiation(url),
        }
    }

    fn go_back(&mut self) {
        match self.history.pop() {
            Some(previous) => {
                log::debug!("session {} going back to {previous}", self.id);
                self.navigating_back = true;
                self.emit(PolicyEvent::NavigateBack { session_id: self.id });
            }
            None => self.emit(PolicyEvent::Navigate {
                session_id: self.id,
                url: self.ctx.config.default_page.clone(),
            }),
        }
    }

    fn start_negotiation(&mut self, url: Url) {
        self.cancel_negotiation();

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let negotiator = self.ctx.negotiator.clone();
        let token = cancel.clone();
        let origin = origin_key(&url);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                res = negotiator.negotiate(&url) => {
                    let _ = tx.send(res);
                }
            }
        });

        self.inflight = Some(InflightNegotiation { origin, cancel, rx });
    }

    /// Cancels the running negotiation. Its receiver is dropped with it, so a result
    /// that is already on its way can no longer be delivered.
    fn cancel_negotiation(&mut self) {
        if let Some(n) = self.inflight.take() {
            n.cancel.cancel();
            log::debug!("session {} discarding negotiation for {}", self.id, n.origin);
            self.negotiation_finished(n.origin, NegotiationOutcome::Discarded);
        }
    }

    async fn handle_negotiation(&mut self, origin: String, result: Result<Negotiation, PolicyError>) {
        let outcome = match result {
            Ok(Negotiation::NoBannerNeeded) => NegotiationOutcome::NoBannerNeeded,
            Ok(Negotiation::BannerNeeded(item)) => {
                self.request_banner(BannerRequest::Policy { item }).await;
                NegotiationOutcome::BannerNeeded
            }
            Err(PolicyError::PolicyNotSet { .. }) => {
                if self.reloaded_for.as_deref() == Some(origin.as_str()) {
                    log::warn!("session {}: enforcement cookie for {origin} still missing after reload", self.id);
                    NegotiationOutcome::NoBannerNeeded
                } else {
                    self.reloaded_for = Some(origin.clone());
                    self.emit(PolicyEvent::Reload { session_id: self.id });
                    NegotiationOutcome::Reload
                }
            }
            Err(PolicyError::PolicyServiceNotProvided { reason, .. }) => {
                log::info!("session {}: {origin} is unsupported ({reason})", self.id);
                self.emit(PolicyEvent::StopLoading { session_id: self.id });
                self.request_banner(BannerRequest::Message { source_url: origin.clone() }).await;
                NegotiationOutcome::Unsupported
            }
            Err(e @ (PolicyError::PolicyNotFound { .. } | PolicyError::InvalidScope { .. })) => {
                log::warn!("session {}: {e}", self.id);
                NegotiationOutcome::NoBannerNeeded
            }
        };

        log::debug!("session {} negotiated {origin}: {outcome}", self.id);
        self.negotiation_finished(origin, outcome);
    }

    fn negotiation_finished(&self, origin: String, outcome: NegotiationOutcome) {
        self.emit(PolicyEvent::NegotiationFinished {
            session_id: self.id,
            origin,
            outcome,
        });
    }

    async fn request_banner(&mut self, request: BannerRequest) {
        if !self.active {
            self.deferred_banner = Some(request);
            return;
        }

        let Some(session) = self.handle() else {
            return;
        };
        let cmd = ConsentCommand::Request {
            issuer: self.id,
            session,
            request,
        };
        if self.ctx.consent_tx.send(cmd).await.is_err() {
            log::warn!("session {}: consent multiplexer is gone", self.id);
        }
    }

    fn handle_cookie_change(&mut self, change: &CookieChange) {
        let url = self.enforced_url();
        if let Verdict::Removed(cookie) = self.monitor.on_cookie_changed(change, url.as_ref(), self.active) {
            self.report_removed(vec![cookie]);
        }
    }

    /// The current page, when cookies set on it are subject to enforcement.
    fn enforced_url(&self) -> Option<Url> {
        let url = self.current_url.as_ref()?;
        if !is_web_url(url) || self.ctx.config.is_exempt(url.host_str().unwrap_or_default()) {
            return None;
        }
        Some(url.clone())
    }

    fn handle(&self) -> Option<SessionHandle> {
        self.cmd_tx.upgrade().map(|tx| SessionHandle::new(self.id, tx))
    }

    fn report_removed(&self, removed: Vec<Cookie>) {
        for cookie in removed {
            self.emit(PolicyEvent::CookieRemoved {
                session_id: self.id,
                cookie,
            });
        }
    }

    fn emit(&self, event: PolicyEvent) {
        // Fails only when nobody subscribed.
        let _ = self.ctx.event_tx.send(event);
    }
}
