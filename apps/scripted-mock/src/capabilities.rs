use std::{collections::BTreeMap, sync::Arc, time::Duration};

use base64::Engine as _;
use chrono::Utc;
use rhai::{Dynamic, Engine, EvalAltResult, INT, Map};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::spec::RouteKey;

/// A pre-registered facility a route script can request by id in its `imports`.
pub trait Capability: Send + Sync {
    fn id(&self) -> &'static str;

    /// Registers the facility's functions on the engine compiled for `route`.
    fn install(&self, engine: &mut Engine, route: &RouteKey);
}

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_builtins(http_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LogCapability));
        registry.register(Arc::new(JsonCapability));
        registry.register(Arc::new(TimeCapability));
        registry.register(Arc::new(UuidCapability));
        registry.register(Arc::new(Base64Capability));
        registry.register(Arc::new(HexCapability));
        registry.register(Arc::new(Sha256Capability));
        registry.register(Arc::new(HttpCapability::new(http_timeout)));
        registry
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.id().to_string(), capability);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }
}

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

pub(crate) fn json_to_dynamic(value: &Value) -> ScriptResult<Dynamic> {
    rhai::serde::to_dynamic(value)
}

pub(crate) fn dynamic_to_json(value: &Dynamic) -> ScriptResult<Value> {
    rhai::serde::from_dynamic::<Value>(value)
}

struct LogCapability;

impl Capability for LogCapability {
    fn id(&self) -> &'static str {
        "log"
    }

    fn install(&self, engine: &mut Engine, route: &RouteKey) {
        let route = route.to_string();

        let debug_route = route.clone();
        engine.register_fn("log_debug", move |message: &str| {
            tracing::debug!(route = %debug_route, "{message}");
        });
        let info_route = route.clone();
        engine.register_fn("log_info", move |message: &str| {
            tracing::info!(route = %info_route, "{message}");
        });
        let warn_route = route.clone();
        engine.register_fn("log_warn", move |message: &str| {
            tracing::warn!(route = %warn_route, "{message}");
        });
        engine.register_fn("log_error", move |message: &str| {
            tracing::error!(route = %route, "{message}");
        });
    }
}

struct JsonCapability;

impl Capability for JsonCapability {
    fn id(&self) -> &'static str {
        "json"
    }

    fn install(&self, engine: &mut Engine, _route: &RouteKey) {
        engine.register_fn("json_encode", |value: Dynamic| -> ScriptResult<String> {
            let value = dynamic_to_json(&value)?;
            serde_json::to_string(&value)
                .map_err(|error| format!("unable to encode json: {error}").into())
        });
        engine.register_fn("json_decode", |text: &str| -> ScriptResult<Dynamic> {
            let value = serde_json::from_str::<Value>(text)
                .map_err(|error| format!("unable to decode json: {error}"))?;
            json_to_dynamic(&value)
        });
    }
}

struct TimeCapability;

impl Capability for TimeCapability {
    fn id(&self) -> &'static str {
        "time"
    }

    fn install(&self, engine: &mut Engine, _route: &RouteKey) {
        engine.register_fn("now_rfc3339", || Utc::now().to_rfc3339());
        engine.register_fn("now_unix_ms", || -> INT { Utc::now().timestamp_millis() });
    }
}

struct UuidCapability;

impl Capability for UuidCapability {
    fn id(&self) -> &'static str {
        "uuid"
    }

    fn install(&self, engine: &mut Engine, _route: &RouteKey) {
        engine.register_fn("uuid_v4", || uuid::Uuid::new_v4().to_string());
        engine.register_fn("uuid_v7", || uuid::Uuid::now_v7().to_string());
    }
}

struct Base64Capability;

impl Capability for Base64Capability {
    fn id(&self) -> &'static str {
        "base64"
    }

    fn install(&self, engine: &mut Engine, _route: &RouteKey) {
        engine.register_fn("base64_encode", |text: &str| {
            base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
        });
        engine.register_fn("base64_decode", |text: &str| -> ScriptResult<String> {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|error| format!("unable to decode base64: {error}"))?;
            String::from_utf8(bytes)
                .map_err(|error| format!("decoded base64 is not utf-8: {error}").into())
        });
    }
}

struct HexCapability;

impl Capability for HexCapability {
    fn id(&self) -> &'static str {
        "hex"
    }

    fn install(&self, engine: &mut Engine, _route: &RouteKey) {
        engine.register_fn("hex_encode", |text: &str| hex::encode(text.as_bytes()));
        engine.register_fn("hex_decode", |text: &str| -> ScriptResult<String> {
            let bytes =
                hex::decode(text.trim()).map_err(|error| format!("unable to decode hex: {error}"))?;
            String::from_utf8(bytes)
                .map_err(|error| format!("decoded hex is not utf-8: {error}").into())
        });
    }
}

struct Sha256Capability;

impl Capability for Sha256Capability {
    fn id(&self) -> &'static str {
        "sha256"
    }

    fn install(&self, engine: &mut Engine, _route: &RouteKey) {
        engine.register_fn("sha256_hex", |text: &str| {
            hex::encode(Sha256::digest(text.as_bytes()))
        });
    }
}

/// Outbound HTTP for scripts. Scripts run on blocking workers, so requests are driven
/// to completion on the service runtime through its handle.
struct HttpCapability {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCapability {
    fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Capability for HttpCapability {
    fn id(&self) -> &'static str {
        "http"
    }

    fn install(&self, engine: &mut Engine, _route: &RouteKey) {
        let client = self.client.clone();
        let timeout = self.timeout;
        engine.register_fn("http_get", move |url: &str| -> ScriptResult<Map> {
            execute_http(client.get(url).timeout(timeout))
        });

        let client = self.client.clone();
        engine.register_fn(
            "http_post",
            move |url: &str, body: Dynamic| -> ScriptResult<Map> {
                let request = client.post(url).timeout(timeout);
                let request = if body.is_string() {
                    request.body(body.into_string().unwrap_or_default())
                } else {
                    let payload = serde_json::to_string(&dynamic_to_json(&body)?)
                        .map_err(|error| format!("unable to encode request body: {error}"))?;
                    request
                        .header(reqwest::header::CONTENT_TYPE, "application/json")
                        .body(payload)
                };
                execute_http(request)
            },
        );
    }
}

fn execute_http(request: reqwest::RequestBuilder) -> ScriptResult<Map> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|_| "http capability is only available while serving requests")?;

    let result: Result<Map, String> = handle.block_on(async move {
        let response = request
            .send()
            .await
            .map_err(|error| format!("http request failed: {error}"))?;
        let status = INT::from(response.status().as_u16());
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.as_str().into(),
                Dynamic::from(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            );
        }
        let body = response
            .text()
            .await
            .map_err(|error| format!("unable to read http response: {error}"))?;

        let mut out = Map::new();
        out.insert("status".into(), Dynamic::from(status));
        out.insert("headers".into(), Dynamic::from(headers));
        out.insert("body".into(), Dynamic::from(body));
        Ok(out)
    });
    result.map_err(Into::into)
}
