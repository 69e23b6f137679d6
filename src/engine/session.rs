//! Browsing sessions: [`SessionHandle`], [`SessionId`] and cookie enforcement.
//!

mod handle;
mod monitor;
mod session;

pub use handle::SessionHandle;
pub use monitor::{CookieMonitor, Verdict};
pub use session::SessionId;

pub(crate) use session::{SessionContext, SessionWorker};
