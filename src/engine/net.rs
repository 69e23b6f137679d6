//! Transport to a site's policy service.
//!
//! The engine only ever POSTs JSON to the policy endpoint and reads JSON back, so the
//! seam is a single method. [`HttpTransport`] implements it with `reqwest`.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use url::Url;

use crate::engine::config::PolicyConfig;
use crate::engine::errors::TransportError;

/// A handle to a policy transport.
pub type TransportHandle = Arc<dyn PolicyTransport>;

/// Posts a JSON body to `url` and returns the parsed JSON response.
///
/// A response with status `>= 300` or a body that is not JSON is an error. An empty
/// body is an empty object.
pub trait PolicyTransport: Send + Sync {
    fn post_json(&self, url: Url, body: Value) -> BoxFuture<'static, Result<Value, TransportError>>;
}

/// `reqwest` based transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &PolicyConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client })
    }
}

impl PolicyTransport for HttpTransport {
    fn post_json(&self, url: Url, body: Value) -> BoxFuture<'static, Result<Value, TransportError>> {
        let client = self.client.clone();

        async move {
            let res = client.post(url).json(&body).send().await?;

            let status = res.status().as_u16();
            if status >= 300 {
                return Err(TransportError::Status(status));
            }

            // Note: does not deal with streaming
            let bytes = res.bytes().await?;
            parse_body(&bytes)
        }
        .boxed()
    }
}

/// Parses a policy service response body.
pub fn parse_body(bytes: &[u8]) -> Result<Value, TransportError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }

    serde_json::from_slice(bytes).map_err(|e| TransportError::InvalidBody(e.to_string()))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport used by tests instead of the network.

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        Json(Value),
        Status(u16),
        /// Answers with the inner reply after a delay.
        Delayed(Duration, Box<Reply>),
    }

    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        replies: Mutex<HashMap<String, Reply>>,
        pub(crate) requests: Mutex<Vec<(Url, Value)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Replies to POSTs on the origin of `url` with `reply`. Unscripted origins fail.
        pub(crate) fn reply(&self, url: &str, reply: Reply) {
            let origin = Url::parse(url).unwrap().origin().ascii_serialization();
            self.replies.lock().unwrap().insert(origin, reply);
        }

        pub(crate) fn requests(&self) -> Vec<(Url, Value)> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl PolicyTransport for ScriptedTransport {
        fn post_json(&self, url: Url, body: Value) -> BoxFuture<'static, Result<Value, TransportError>> {
            self.requests.lock().unwrap().push((url.clone(), body));
            let reply = self.replies.lock().unwrap().get(&url.origin().ascii_serialization()).cloned();

            async move {
                let mut reply = reply;
                loop {
                    return match reply {
                        Some(Reply::Delayed(delay, inner)) => {
                            tokio::time::sleep(delay).await;
                            reply = Some(*inner);
                            continue;
                        }
                        Some(Reply::Json(v)) => Ok(v),
                        Some(Reply::Status(s)) => Err(TransportError::Status(s)),
                        None => Err(TransportError::Request(format!("connection refused: {url}"))),
                    };
                }
            }
            .boxed()
        }
    }
}
