//! The shared consent UI.
//!
//! [`BannerEndpoint`] is what the host gets to drive the UI; the multiplexer behind it
//! decides which session the UI currently belongs to.

mod handle;
mod messages;
mod multiplexer;

pub use handle::BannerEndpoint;
pub use messages::{BannerMode, ShowBanner, UiAction, UiMessage};
pub use multiplexer::{BannerRequest, ConsentCommand};

pub(crate) use multiplexer::ConsentMultiplexer;
