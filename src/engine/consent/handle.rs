use tokio::sync::mpsc;

use crate::engine::consent::{UiAction, UiMessage};
use crate::engine::errors::EngineError;

/// The host's end of the consent UI channel.
///
/// The host renders whatever arrives from [`recv`](BannerEndpoint::recv) and forwards the
/// user's actions with [`send`](BannerEndpoint::send).
#[derive(Debug)]
pub struct BannerEndpoint {
    ui_rx: mpsc::Receiver<UiMessage>,
    action_tx: mpsc::Sender<UiAction>,
}

impl BannerEndpoint {
    pub(crate) fn new(ui_rx: mpsc::Receiver<UiMessage>, action_tx: mpsc::Sender<UiAction>) -> Self {
        Self { ui_rx, action_tx }
    }

    /// Next message for the UI. `None` once the engine shut down.
    pub async fn recv(&mut self) -> Option<UiMessage> {
        self.ui_rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<UiMessage> {
        self.ui_rx.try_recv().ok()
    }

    pub async fn send(&self, action: UiAction) -> Result<(), EngineError> {
        self.action_tx.send(action).await.map_err(|_| EngineError::ChannelClosed)
    }

    /// A sender for UI actions, for hosts that read and write from different tasks.
    pub fn actions(&self) -> mpsc::Sender<UiAction> {
        self.action_tx.clone()
    }
}
