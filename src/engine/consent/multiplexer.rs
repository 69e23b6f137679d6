//! The consent session multiplexer.
//!
//! There is exactly one consent UI, shared by every browsing session. The multiplexer
//! owns it: sessions ask for it with a [`ConsentCommand::Request`], the UI answers with
//! [`UiAction`]s that carry the issuing session's id. Actions from any other issuer than
//! the one currently shown are dropped.
//!
//! ```text
//! Closed --request--> Opening --show--> Policy | Message --submit/close/...--> Closed
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::engine::config::PolicyConfig;
use crate::engine::consent::{BannerMode, ShowBanner, UiAction, UiMessage};
use crate::engine::events::{PolicyEvent, SessionCommand};
use crate::engine::policy::{accept_all, origin_key, PolicyChoice, PolicyUpdate, ResolvedPolicy};
use crate::engine::session::{SessionHandle, SessionId};
use crate::engine::storage::PolicyStore;

/// What a session wants the UI to show.
#[derive(Debug, Clone, PartialEq)]
pub enum BannerRequest {
    /// Ask for a choice on a resolved, not yet selected policy.
    Policy { item: ResolvedPolicy },
    /// Tell the user the site has no policy service.
    Message { source_url: String },
}

impl BannerRequest {
    pub fn mode(&self) -> BannerMode {
        match self {
            BannerRequest::Policy { .. } => BannerMode::Policy,
            BannerRequest::Message { .. } => BannerMode::Message,
        }
    }
}

/// Commands for the multiplexer.
#[derive(Debug)]
pub enum ConsentCommand {
    /// Show the UI for `issuer`, replacing whatever is shown.
    Request {
        issuer: SessionId,
        session: SessionHandle,
        request: BannerRequest,
    },
    /// The window hosting the UI lost focus.
    FocusLost,
    /// A session went away.
    SessionClosed { issuer: SessionId },
}

/// Display state of the shared UI.
#[derive(Debug, Default)]
enum BannerState {
    #[default]
    Closed,
    Opening {
        issuer: SessionId,
    },
    Policy {
        issuer: SessionId,
        session: SessionHandle,
        item: ResolvedPolicy,
    },
    Message {
        issuer: SessionId,
        session: SessionHandle,
        source_url: String,
    },
}

impl BannerState {
    fn issuer(&self) -> Option<SessionId> {
        match self {
            BannerState::Closed => None,
            BannerState::Opening { issuer }
            | BannerState::Policy { issuer, .. }
            | BannerState::Message { issuer, .. } => Some(*issuer),
        }
    }

    fn session(&self) -> Option<&SessionHandle> {
        match self {
            BannerState::Policy { session, .. } | BannerState::Message { session, .. } => Some(session),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            BannerState::Closed => "closed",
            BannerState::Opening { .. } => "opening",
            BannerState::Policy { .. } => "policy",
            BannerState::Message { .. } => "message",
        }
    }
}

pub(crate) struct ConsentMultiplexer {
    config: Arc<PolicyConfig>,
    store: Arc<PolicyStore>,
    event_tx: broadcast::Sender<PolicyEvent>,

    cmd_rx: mpsc::Receiver<ConsentCommand>,
    action_rx: mpsc::Receiver<UiAction>,
    ui_tx: mpsc::Sender<UiMessage>,

    state: BannerState,
    shutdown: CancellationToken,
}

impl ConsentMultiplexer {
    pub(crate) fn new(
        config: Arc<PolicyConfig>,
        store: Arc<PolicyStore>,
        event_tx: broadcast::Sender<PolicyEvent>,
        cmd_rx: mpsc::Receiver<ConsentCommand>,
        action_rx: mpsc::Receiver<UiAction>,
        ui_tx: mpsc::Sender<UiMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            event_tx,
            cmd_rx,
            action_rx,
            ui_tx,
            state: BannerState::Closed,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        log::debug!("consent multiplexer started");
        let mut actions_open = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    self.handle_command(cmd).await;
                }

                action = self.action_rx.recv(), if actions_open => {
                    match action {
                        Some(action) => self.handle_action(action).await,
                        None => {
                            log::debug!("consent UI endpoint dropped");
                            actions_open = false;
                        }
                    }
                }
            }
        }

        self.close().await;
        log::debug!("consent multiplexer exiting");
    }

    async fn handle_command(&mut self, cmd: ConsentCommand) {
        match cmd {
            ConsentCommand::Request { issuer, session, request } => self.open(issuer, session, request).await,
            ConsentCommand::FocusLost => self.close().await,
            ConsentCommand::SessionClosed { issuer } => {
                if self.state.issuer() == Some(issuer) {
                    self.close().await;
                }
            }
        }
    }

    async fn open(&mut self, issuer: SessionId, session: SessionHandle, request: BannerRequest) {
        // Never reuse the UI, not even for the same issuer.
        self.close().await;
        self.transition(BannerState::Opening { issuer });

        let mode = request.mode();
        let (show, next) = match request {
            BannerRequest::Policy { item } => (
                ShowBanner {
                    issuer,
                    mode,
                    source_url: Some(item.source_url.clone()),
                    policy: Some(item.clone()),
                    headline: None,
                    message: None,
                },
                BannerState::Policy { issuer, session, item },
            ),
            BannerRequest::Message { source_url } => (
                ShowBanner {
                    issuer,
                    mode,
                    source_url: Some(source_url.clone()),
                    policy: None,
                    headline: Some(self.config.unsupported_headline.clone()),
                    message: Some(self.config.unsupported_message.clone()),
                },
                BannerState::Message { issuer, session, source_url },
            ),
        };

        if self.ui_tx.send(UiMessage::Show(show)).await.is_err() {
            log::warn!("consent UI is gone, cannot show banner for session {issuer}");
            self.transition(BannerState::Closed);
            return;
        }

        self.transition(next);
        self.emit(PolicyEvent::BannerShown { session_id: issuer, mode });
    }

    async fn close(&mut self) {
        let Some(issuer) = self.state.issuer() else {
            return;
        };

        // The UI may already be gone during shutdown.
        let _ = self.ui_tx.send(UiMessage::Destroy).await;
        self.transition(BannerState::Closed);
        self.emit(PolicyEvent::BannerClosed { session_id: issuer });
    }

    async fn handle_action(&mut self, action: UiAction) {
        let issuer = action.issuer();
        if self.state.issuer() != Some(issuer) || self.state.session().is_none() {
            log::debug!("dropping consent action from session {issuer}, banner is {}", self.state.name());
            return;
        }

        match action {
            UiAction::Submit { source_url, policy, .. } => self.submit(source_url, policy).await,
            UiAction::AcceptAll { .. } => {
                let BannerState::Policy { item, .. } = &self.state else {
                    log::debug!("accept all without a policy on screen");
                    return;
                };
                let mut choice = item.choice.clone();
                accept_all(&item.policy, &mut choice);
                let source_url = item.source_url.clone();
                self.submit(source_url, choice).await;
            }
            UiAction::Revoke { .. } => {
                let BannerState::Policy { item, .. } = &self.state else {
                    log::debug!("revoke without a policy on screen");
                    return;
                };
                let source_url = item.source_url.clone();
                let stored = self.store.upsert(PolicyUpdate::revoked(source_url.clone()));
                self.stored(&source_url, stored.is_some());
                self.finish(Some(SessionCommand::SweepCookieLog)).await;
            }
            UiAction::Clear { .. } => {
                if self.store.clear() {
                    self.emit(PolicyEvent::PolicyStorageCleared);
                }
                self.finish(None).await;
            }
            UiAction::Close { .. } => self.finish(None).await,
            UiAction::GoBack { .. } => self.finish(Some(SessionCommand::GoBack)).await,
            UiAction::AcceptAnyway { .. } => {
                let BannerState::Message { source_url, .. } = &self.state else {
                    log::debug!("accept anyway without a message on screen");
                    return;
                };
                let source_url = source_url.clone();
                let stored = self.store.upsert(PolicyUpdate::unsupported(source_url.clone(), true));
                self.stored(&source_url, stored.is_some());
                self.finish(Some(SessionCommand::Reload)).await;
            }
        }
    }

    /// Merges and stores the user's choice, closes the UI and tells the session.
    ///
    /// Only a choice for the origin on screen is accepted; anything else is dropped and
    /// the UI stays up.
    async fn submit(&mut self, source_url: String, choice: PolicyChoice) {
        let BannerState::Policy { item, .. } = &self.state else {
            log::debug!("submit without a policy on screen");
            return;
        };

        let submitted = Url::parse(&source_url).map(|u| origin_key(&u)).unwrap_or(source_url);
        if submitted != item.source_url {
            log::warn!("dropping choice for {submitted} submitted on the banner for {}", item.source_url);
            return;
        }
        let source_url = item.source_url.clone();
        let policy = item.policy.clone();

        let stored = self.store.upsert(PolicyUpdate::submitted(source_url.clone(), Some(policy), choice));
        let source_url = stored.as_ref().map(|item| item.source_url().to_string()).unwrap_or(source_url);
        self.stored(&source_url, stored.is_some());

        self.finish(Some(SessionCommand::PolicySubmitted { source_url })).await;
    }

    /// Closes the UI, then forwards `cmd` to the session the UI was shown for.
    ///
    /// The forward runs on its own task: a session with a full queue may itself be
    /// waiting on this multiplexer.
    async fn finish(&mut self, cmd: Option<SessionCommand>) {
        let session = self.state.session().cloned();
        self.close().await;

        if let (Some(session), Some(cmd)) = (session, cmd) {
            tokio::spawn(async move {
                if let Err(e) = session.send(cmd).await {
                    log::debug!("cannot forward consent result: {e}");
                }
            });
        }
    }

    fn stored(&self, source_url: &str, ok: bool) {
        if !ok {
            log::warn!("consent for {source_url} was not stored");
            return;
        }

        let state = self
            .store
            .find_by_origin(source_url)
            .and_then(|item| item.as_resolved().map(|r| r.state));
        self.emit(PolicyEvent::PolicyStored {
            origin: source_url.to_string(),
            state,
        });
    }

    fn transition(&mut self, next: BannerState) {
        log::debug!("consent banner {} -> {}", self.state.name(), next.name());
        self.state = next;
    }

    fn emit(&self, event: PolicyEvent) {
        let _ = self.event_tx.send(event);
    }
}
