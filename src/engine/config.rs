//! Policy engine configuration.
//!
//! `PolicyConfig` controls how the engine talks to a site's policy service and what
//! the consent UI shows for sites without one. It provides defaults via [`Default`]
//! and a fluent [`PolicyConfig::builder()`] with validation.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use gosub_cookie_policy::config::PolicyConfig;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = PolicyConfig::builder()
//!     .exempt_host("intranet.test")
//!     .request_timeout(Duration::from_secs(3))
//!     .transmit_choices(false)
//!     .build()?; // returns Result<PolicyConfig, ConfigError>
//! assert!(cfg.is_exempt("localhost"));
//! # Ok(()) }
//! ```
//!
//! # Fields (summary)
//! - `service_path`: Path of the policy endpoint on each origin (default `/CookiePolicyManager`).
//! - `protocol_version`: Version sent on first contact (default `0`).
//! - `exempt_hosts`: Hosts that never get a banner (default `["localhost"]`).
//! - `default_page`: Where "go back" lands when a session has no history.
//! - `request_timeout`: Timeout for each policy service request.
//! - `user_agent`: User agent sent to policy services.
//! - `transmit_choices`: Send the user's choice back to the policy service.
//! - `unsupported_headline` / `unsupported_message`: Text of the message-mode UI.
//! - `channel_capacity`: Capacity of command and event channels.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::engine::DEFAULT_CHANNEL_CAPACITY;

const DEFAULT_USER_AGENT: &str = "Gosub/1.0 (X11; Linux x86_64) Gecko/20250802 GosubBrowser/1.0";
const DEFAULT_SERVICE_PATH: &str = "/CookiePolicyManager";
const DEFAULT_HEADLINE: &str = "This site does not provide a cookie policy";
const DEFAULT_MESSAGE: &str = "Cookies set by this site will be blocked. You can go back or continue without a policy.";

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub service_path: String,
    pub protocol_version: u32,
    pub exempt_hosts: Vec<String>,
    pub default_page: Url,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub transmit_choices: bool,
    pub unsupported_headline: String,
    pub unsupported_message: String,
    pub channel_capacity: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            service_path: DEFAULT_SERVICE_PATH.to_string(),
            protocol_version: 0,
            exempt_hosts: vec!["localhost".to_string()],
            default_page: Url::parse("about:blank").expect("about:blank is a valid url"),
            request_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            transmit_choices: true,
            unsupported_headline: DEFAULT_HEADLINE.to_string(),
            unsupported_message: DEFAULT_MESSAGE.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl PolicyConfig {
    pub fn builder() -> PolicyConfigBuilder {
        PolicyConfigBuilder::default()
    }

    /// Returns true when `host` never gets a consent banner.
    pub fn is_exempt(&self, host: &str) -> bool {
        self.exempt_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }

    /// Policy service endpoint for `origin` (an ascii-serialized origin without trailing slash).
    pub fn service_url(&self, origin: &str) -> Result<Url, url::ParseError> {
        Url::parse(&format!("{}{}", origin.trim_end_matches('/'), self.service_path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate(self)
    }
}

/// Builder for [`PolicyConfig`].
#[derive(Debug, Clone, Default)]
pub struct PolicyConfigBuilder {
    inner: PolicyConfig,
}

impl PolicyConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut PolicyConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn service_path<S: Into<String>>(self, path: S) -> Self { self.map(|c| c.service_path = path.into()) }
    pub fn protocol_version(self, v: u32) -> Self { self.map(|c| c.protocol_version = v) }
    pub fn exempt_host<S: Into<String>>(self, host: S) -> Self { self.map(|c| c.exempt_hosts.push(host.into())) }
    pub fn exempt_hosts(self, hosts: Vec<String>) -> Self { self.map(|c| c.exempt_hosts = hosts) }
    pub fn default_page(self, url: Url) -> Self { self.map(|c| c.default_page = url) }
    pub fn request_timeout(self, t: Duration) -> Self { self.map(|c| c.request_timeout = t) }
    pub fn user_agent<S: Into<String>>(self, ua: S) -> Self { self.map(|c| c.user_agent = ua.into()) }
    pub fn transmit_choices(self, on: bool) -> Self { self.map(|c| c.transmit_choices = on) }
    pub fn unsupported_headline<S: Into<String>>(self, s: S) -> Self { self.map(|c| c.unsupported_headline = s.into()) }
    pub fn unsupported_message<S: Into<String>>(self, s: S) -> Self { self.map(|c| c.unsupported_message = s.into()) }
    pub fn channel_capacity(self, n: usize) -> Self { self.map(|c| c.channel_capacity = n) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut PolicyConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<PolicyConfig, ConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    EmptyServicePath,
    RelativeServicePath(String),
    ZeroTimeout,
    ZeroChannelCapacity,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyServicePath =>
                write!(f, "service_path must not be empty"),
            ConfigError::RelativeServicePath(p) =>
                write!(f, "service_path {p:?} must start with '/'"),
            ConfigError::ZeroTimeout =>
                write!(f, "request_timeout must be larger than zero"),
            ConfigError::ZeroChannelCapacity =>
                write!(f, "channel_capacity must be at least 1"),
        }
    }
}
impl std::error::Error for ConfigError {}

fn validate(c: &PolicyConfig) -> Result<(), ConfigError> {
    if c.service_path.is_empty() {
        return Err(ConfigError::EmptyServicePath);
    }
    if !c.service_path.starts_with('/') {
        return Err(ConfigError::RelativeServicePath(c.service_path.clone()));
    }
    if c.request_timeout.is_zero() {
        return Err(ConfigError::ZeroTimeout);
    }
    if c.channel_capacity == 0 {
        return Err(ConfigError::ZeroChannelCapacity);
    }
    Ok(())
}
