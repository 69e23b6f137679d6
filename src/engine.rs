//! Cookie policy engine.
//!
//! For every site a user visits, the engine negotiates a cookie policy with the site's
//! policy service, keeps the user's consent in a [`PolicyStore`](storage::PolicyStore),
//! removes cookies the consent does not cover and drives the single consent UI shared by
//! all browsing sessions.
//!
//! # Main Types
//!
//! - [`PolicyEngine`]: wires everything together and spawns session workers.
//! - [`SessionHandle`](session::SessionHandle): feeds page loads of one tab or view.
//! - [`BannerEndpoint`](consent::BannerEndpoint): the host's end of the consent UI.
//! - [`PolicyEvent`](events::PolicyEvent): what the host has to act on (reloads, navigation).

pub mod config;
pub mod consent;
pub mod cookies;
pub mod errors;
pub mod events;
pub mod net;
pub mod policy;
pub mod session;
pub mod storage;

mod engine;

pub use engine::{PolicyEngine, PolicyServices};

/// Default capacity of the command queues and the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;
