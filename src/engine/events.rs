//! Session commands and engine events.
//!
//! This module defines the messages exchanged between the host (browser chrome), the
//! browsing sessions and the consent multiplexer.
//!
//! # Main Types
//!
//! - [`SessionCommand`]: Commands processed, in order, by one browsing session.
//! - [`PolicyEvent`]: Events broadcast by the engine for the host to act on.
//! - [`NegotiationOutcome`]: How a negotiation for a session ended.

use std::fmt::{Debug, Display};

use url::Url;

use crate::engine::consent::BannerMode;
use crate::engine::cookies::Cookie;
use crate::engine::policy::PolicyState;
use crate::engine::session::SessionId;

/// Commands that can be sent to a specific browsing session
#[derive(Clone, Debug, PartialEq)]
pub enum SessionCommand {
    // ****************************************
    // ** Navigation / lifecycle
    /// The session started loading `url`
    LoadStarted { url: Url },
    /// The session finished loading `url`
    LoadFinished { url: Url },
    /// The session became the active (selected) one, or went to the background
    SetActive(bool),
    /// Close the session
    Close,

    // ****************************************
    // ** Consent
    /// The user submitted a choice for `source_url`
    PolicySubmitted { source_url: String },
    /// Choices were withdrawn; retract logged cookies that are no longer allowed
    SweepCookieLog,
    /// Show the consent banner again for the current page
    ShowBanner,
    /// Navigate back, or to the default page when there is no history
    GoBack,
    /// Reload the current page
    Reload,
}

/// How a negotiation for a session ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    NoBannerNeeded,
    BannerNeeded,
    /// The enforcement cookie was rewritten and the page reloads.
    Reload,
    /// The site does not provide a policy service.
    Unsupported,
    /// The session navigated elsewhere before the result arrived.
    Discarded,
}

impl Display for NegotiationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationOutcome::NoBannerNeeded => write!(f, "no banner needed"),
            NegotiationOutcome::BannerNeeded => write!(f, "banner needed"),
            NegotiationOutcome::Reload => write!(f, "reload"),
            NegotiationOutcome::Unsupported => write!(f, "unsupported"),
            NegotiationOutcome::Discarded => write!(f, "discarded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    // ****************************************
    // ** Session lifecycle
    /// Session opened
    SessionOpened { session_id: SessionId },
    /// Session closed
    SessionClosed { session_id: SessionId },

    // ****************************************
    // ** Navigation requests for the host
    /// Reload the page of the session
    Reload { session_id: SessionId },
    /// Navigate the session back in its history
    NavigateBack { session_id: SessionId },
    /// Navigate the session to `url`
    Navigate { session_id: SessionId, url: Url },
    /// Stop loading the current page of the session
    StopLoading { session_id: SessionId },

    // ****************************************
    // ** Consent
    /// Negotiation for the session's page finished
    NegotiationFinished { session_id: SessionId, origin: String, outcome: NegotiationOutcome },
    /// The consent banner was shown for the session
    BannerShown { session_id: SessionId, mode: BannerMode },
    /// The consent banner of the session was destroyed
    BannerClosed { session_id: SessionId },
    /// A policy item was stored
    PolicyStored { origin: String, state: Option<PolicyState> },
    /// All policy items were removed
    PolicyStorageCleared,

    // ****************************************
    // ** Enforcement
    /// A disallowed cookie was removed from the jar
    CookieRemoved { session_id: SessionId, cookie: Cookie },
    /// Cookie change notifications were dropped because the session fell behind
    CookiesLagged { session_id: SessionId, skipped: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_display() {
        assert_eq!(NegotiationOutcome::BannerNeeded.to_string(), "banner needed");
        assert_eq!(NegotiationOutcome::Discarded.to_string(), "discarded");
    }

    #[test]
    fn session_command_equality_and_debug() {
        let a = SessionCommand::LoadStarted { url: Url::parse("https://example.com/").unwrap() };
        let b = a.clone();
        assert_eq!(a, b);
        assert!(format!("{a:?}").contains("LoadStarted"));
    }
}
