// src/engine/cookies.rs
//! Cookies: the [`CookieJar`] collaborator interface and an in-memory jar.

mod cookies;
mod cookie_jar;

pub use cookies::Cookie;
pub use cookies::CookieChange;
pub use cookies::CookieChangeCause;
pub use cookies::CookieDetails;
pub use cookies::CookieFilter;
pub use cookies::CookieJarHandle;

pub use cookie_jar::parse_set_cookie;
pub use cookie_jar::CookieJar;
pub use cookie_jar::DefaultCookieJar;
