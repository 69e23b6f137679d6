use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use gosub_cookie_policy::config::PolicyConfig;
use gosub_cookie_policy::consent::{UiAction, UiMessage};
use gosub_cookie_policy::cookies::{CookieDetails, CookieFilter, CookieJar, DefaultCookieJar};
use gosub_cookie_policy::errors::TransportError;
use gosub_cookie_policy::events::PolicyEvent;
use gosub_cookie_policy::net::PolicyTransport;
use gosub_cookie_policy::storage::{JsonPolicyBackend, PolicyStore};
use gosub_cookie_policy::{PolicyEngine, PolicyServices};
use serde_json::{json, Value};
use url::Url;

/// Serves one policy for `shop.demo.test` and refuses every other origin, so the
/// walkthrough runs without a network.
struct DemoTransport;

impl PolicyTransport for DemoTransport {
    fn post_json(&self, url: Url, body: Value) -> BoxFuture<'static, Result<Value, TransportError>> {
        async move {
            println!("  -> POST {url} {body}");
            if url.host_str() != Some("shop.demo.test") {
                return Err(TransportError::Status(404));
            }
            if body.get("visitorId").is_some() {
                // Choice submission
                return Ok(json!({}));
            }

            Ok(json!({
                "scope": "demo.test",
                "version": 1,
                "purposes": [
                    {"id": 1, "name": "Analytics", "description": "Visitor statistics"},
                    {"id": 2, "name": "Advertising", "description": "Personalised ads"}
                ],
                "cookieAccessors": [
                    {"id": 10, "name": "Stats", "scope": "stats.demo.test", "purposes": [1]},
                    {"id": 11, "name": "Ads", "scope": "ads.example.net", "purposes": [2]},
                    {"id": 12, "name": "Shop", "scope": "shop.demo.test", "purposes": []}
                ]
            }))
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = PolicyConfig::builder()
        .request_timeout(Duration::from_secs(2))
        .build()?;

    // Policies are kept in a JSON file next to the other temp files.
    let path = std::env::temp_dir().join("gosub-cookie-policy-walkthrough.json");
    let store = Arc::new(PolicyStore::open(Arc::new(JsonPolicyBackend::new(path.clone())?))?);
    store.clear();

    let jar = Arc::new(DefaultCookieJar::new());
    let services = PolicyServices {
        store,
        jar: jar.clone(),
        transport: Arc::new(DemoTransport),
    };

    let mut engine = PolicyEngine::new(config, services)?;
    let mut banner = engine.start()?;
    let mut events = engine.subscribe_events();

    // Print what the engine asks the host to do.
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PolicyEvent::CookieRemoved { cookie, .. } => println!("  [event] removed cookie {} ({})", cookie.name, cookie.domain),
                PolicyEvent::NegotiationFinished { origin, outcome, .. } => println!("  [event] {origin}: {outcome}"),
                other => println!("  [event] {other:?}"),
            }
        }
    });

    let session = engine.open_session(true)?;
    let page = Url::parse("https://shop.demo.test/")?;

    println!("visiting {page}");
    session.load_started(page.clone()).await?;
    jar.set(CookieDetails::new(Url::parse("https://ads.example.net/")?, "uid", "42").path("/"))?;
    session.load_finished(page.clone()).await?;

    // Play the consent UI: accept analytics only.
    let Some(UiMessage::Show(show)) = banner.recv().await else {
        anyhow::bail!("expected the consent banner");
    };
    let item = show.policy.ok_or_else(|| anyhow::anyhow!("banner without a policy"))?;
    println!("banner for {} with {} purposes", item.source_url, item.policy.purposes.len());

    let mut choice = item.choice.clone();
    for purpose in &item.policy.purposes {
        choice.purpose_choice.insert(purpose.id, purpose.name == "Analytics");
    }
    banner
        .send(UiAction::Submit {
            issuer: show.issuer,
            source_url: item.source_url.clone(),
            policy: choice,
        })
        .await?;
    if let Some(msg) = banner.recv().await {
        println!("ui: {msg:?}");
    }

    // After the reload the page sets its cookies again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.load_started(page.clone()).await?;
    session.load_finished(page.clone()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    jar.set(CookieDetails::new(Url::parse("https://stats.demo.test/")?, "visit", "1").path("/"))?;
    jar.set(CookieDetails::new(Url::parse("https://ads.example.net/")?, "uid", "42").path("/"))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("cookies left in the jar:");
    for cookie in jar.get(&CookieFilter::all()) {
        println!("  {}={} ({})", cookie.name, cookie.value, cookie.domain);
    }

    // A site without a policy service.
    let other = Url::parse("https://blog.example.org/")?;
    println!("visiting {other}");
    session.load_started(other.clone()).await?;
    session.load_finished(other).await?;
    if let Some(UiMessage::Show(show)) = banner.recv().await {
        println!("message banner: {:?} / {:?}", show.headline, show.message);
        banner.send(UiAction::GoBack { issuer: show.issuer }).await?;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    session.close().await?;
    engine.shutdown().await?;
    println!("policies stored in {}", path.display());

    Ok(())
}
