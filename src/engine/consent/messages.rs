//! Messages exchanged with the consent UI.
//!
//! Both directions are plain serde types so a host can forward them over whatever IPC it
//! uses between the browser process and the UI (JSON in the reference host).

use serde::{Deserialize, Serialize};

use crate::engine::policy::{PolicyChoice, ResolvedPolicy};
use crate::engine::session::SessionId;

/// What the consent UI displays.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BannerMode {
    /// The policy screen, with purposes and accessors to choose from.
    Policy,
    /// A notice for sites without a policy service.
    Message,
}

/// Payload of [`UiMessage::Show`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowBanner {
    pub issuer: SessionId,
    pub mode: BannerMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ResolvedPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Engine to UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum UiMessage {
    /// Create the UI fresh and show it.
    Show(ShowBanner),
    /// Tear the UI down.
    Destroy,
}

/// UI to engine. Every action names the session it was shown for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum UiAction {
    Submit {
        issuer: SessionId,
        #[serde(rename = "sourceUrl")]
        source_url: String,
        policy: PolicyChoice,
    },
    AcceptAll { issuer: SessionId },
    Revoke { issuer: SessionId },
    Clear { issuer: SessionId },
    Close { issuer: SessionId },
    GoBack { issuer: SessionId },
    AcceptAnyway { issuer: SessionId },
}

impl UiAction {
    pub fn issuer(&self) -> SessionId {
        match self {
            UiAction::Submit { issuer, .. }
            | UiAction::AcceptAll { issuer }
            | UiAction::Revoke { issuer }
            | UiAction::Clear { issuer }
            | UiAction::Close { issuer }
            | UiAction::GoBack { issuer }
            | UiAction::AcceptAnyway { issuer } => *issuer,
        }
    }
}
