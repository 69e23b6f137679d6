use tokio::sync::mpsc;
use url::Url;

use crate::engine::errors::EngineError;
use crate::engine::events::SessionCommand;
use crate::engine::session::SessionId;

/// Handle to a running browsing session. Cheap to clone; the session stops once every
/// handle is dropped or [`close`](SessionHandle::close) is called.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, cmd_tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { id, cmd_tx }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queues a command. Commands of one session are processed in the order they are sent.
    pub async fn send(&self, cmd: SessionCommand) -> Result<(), EngineError> {
        self.cmd_tx.send(cmd).await.map_err(|_| EngineError::SessionNotFound(self.id))
    }

    pub async fn load_started(&self, url: Url) -> Result<(), EngineError> {
        self.send(SessionCommand::LoadStarted { url }).await
    }

    pub async fn load_finished(&self, url: Url) -> Result<(), EngineError> {
        self.send(SessionCommand::LoadFinished { url }).await
    }

    pub async fn set_active(&self, active: bool) -> Result<(), EngineError> {
        self.send(SessionCommand::SetActive(active)).await
    }

    pub async fn show_banner(&self) -> Result<(), EngineError> {
        self.send(SessionCommand::ShowBanner).await
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.send(SessionCommand::Close).await
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}
