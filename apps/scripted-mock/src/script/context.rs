use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::{body::Bytes, http::StatusCode};
use rhai::{Dynamic, EvalAltResult, INT, Map};
use serde_json::Value;

use crate::{
    capabilities::json_to_dynamic,
    state::{TestConfig, TestStateStore},
};

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// The parts of an inbound request a route script can observe.
#[derive(Clone, Debug, Default)]
pub struct ScriptRequest {
    pub method: String,
    pub path: String,
    /// Header names are lower-case.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub body: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyShape {
    Json,
    Object,
    Array,
    String,
    Number,
    Bool,
    Text,
}

impl BodyShape {
    fn parse(raw: &str) -> ScriptResult<Self> {
        match raw {
            "json" | "any" => Ok(Self::Json),
            "object" | "map" => Ok(Self::Object),
            "array" => Ok(Self::Array),
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "bool" => Ok(Self::Bool),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown body shape '{other}'").into()),
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Json | Self::Text => true,
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Text => "text",
        }
    }
}

/// Records the inbound call for one invocation, at most once.
struct BodyBinding {
    route: String,
    store: Arc<TestStateStore>,
    recorded: AtomicBool,
}

impl BodyBinding {
    fn record(&self, body: Option<String>) {
        if !self.recorded.swap(true, Ordering::AcqRel) {
            self.store.record_call(self.route.clone(), body);
        }
    }
}

struct ContextInner {
    route: String,
    request: ScriptRequest,
    config: Option<Arc<TestConfig>>,
    binding: BodyBinding,
}

/// Per-invocation execution context, bound into scripts as `ctx`.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("route", &self.inner.route)
            .field("path", &self.inner.request.path)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    pub(crate) fn new(
        route: String,
        request: ScriptRequest,
        config: Option<Arc<TestConfig>>,
        store: Arc<TestStateStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                binding: BodyBinding {
                    route: route.clone(),
                    store,
                    recorded: AtomicBool::new(false),
                },
                route,
                request,
                config,
            }),
        }
    }

    /// Reads the request body: the call is recorded first (null body when empty, raw
    /// text otherwise), then the text is decoded into `shape`. A decode failure is
    /// raised to the script after the record exists.
    pub(crate) fn bind_body(&self, shape: BodyShape) -> ScriptResult<Dynamic> {
        let body = &self.inner.request.body;
        if body.is_empty() {
            tracing::debug!(route = %self.inner.route, "request with empty body");
            self.inner.binding.record(None);
            return Ok(Dynamic::UNIT);
        }

        let raw = String::from_utf8_lossy(body).into_owned();
        tracing::debug!(route = %self.inner.route, body = %raw, "request with body");
        self.inner.binding.record(Some(raw.clone()));

        if shape == BodyShape::Text {
            return Ok(Dynamic::from(raw));
        }
        let text = std::str::from_utf8(body)
            .map_err(|error| format!("unable to parse body: {error}"))?;
        let value = serde_json::from_str::<Value>(text)
            .map_err(|error| format!("unable to parse body: {error}"))?;
        if !shape.accepts(&value) {
            return Err(format!("unable to parse body: expected {}", shape.as_str()).into());
        }
        json_to_dynamic(&value)
    }

    /// Records the call without decoding if the script never bound the body.
    pub(crate) fn ensure_recorded(&self) {
        let body = &self.inner.request.body;
        if body.is_empty() {
            self.inner.binding.record(None);
        } else {
            self.inner
                .binding
                .record(Some(String::from_utf8_lossy(body).into_owned()));
        }
    }

    fn method(&mut self) -> String {
        self.inner.request.method.clone()
    }

    fn path(&mut self) -> String {
        self.inner.request.path.clone()
    }

    fn route(&mut self) -> String {
        self.inner.route.clone()
    }

    fn headers(&mut self) -> Map {
        to_script_map(&self.inner.request.headers)
    }

    fn query_map(&mut self) -> Map {
        to_script_map(&self.inner.request.query)
    }

    fn params(&mut self) -> Map {
        to_script_map(&self.inner.request.params)
    }

    fn header(&mut self, name: &str) -> Dynamic {
        lookup(&self.inner.request.headers, &name.to_ascii_lowercase())
    }

    fn query_value(&mut self, name: &str) -> Dynamic {
        lookup(&self.inner.request.query, name)
    }

    fn param(&mut self, name: &str) -> Dynamic {
        lookup(&self.inner.request.params, name)
    }

    fn config_value(&mut self, key: &str) -> ScriptResult<Dynamic> {
        match self
            .inner
            .config
            .as_ref()
            .and_then(|config| config.get(key))
        {
            Some(value) => json_to_dynamic(value),
            None => Ok(Dynamic::UNIT),
        }
    }
}

fn to_script_map(values: &BTreeMap<String, String>) -> Map {
    values
        .iter()
        .map(|(key, value)| (key.as_str().into(), Dynamic::from(value.clone())))
        .collect()
}

fn lookup(values: &BTreeMap<String, String>, key: &str) -> Dynamic {
    values
        .get(key)
        .map_or(Dynamic::UNIT, |value| Dynamic::from(value.clone()))
}

/// Explicit status and headers chosen by a script through `respond(...)`.
#[derive(Clone, Debug)]
pub struct ScriptResponse {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Dynamic,
}

impl ScriptResponse {
    fn new(status: INT, body: Dynamic, headers: Map) -> ScriptResult<Self> {
        let status = u16::try_from(status)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| format!("invalid response status {status}"))?;
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Ok(Self {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

pub(crate) fn register_context_api(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<RequestContext>("RequestContext")
        .register_get("method", RequestContext::method)
        .register_get("path", RequestContext::path)
        .register_get("route", RequestContext::route)
        .register_get("headers", RequestContext::headers)
        .register_get("query", RequestContext::query_map)
        .register_get("params", RequestContext::params)
        .register_fn("header", RequestContext::header)
        .register_fn("query", RequestContext::query_value)
        .register_fn("param", RequestContext::param)
        .register_fn("config", RequestContext::config_value)
        .register_fn("bind_body", |ctx: &mut RequestContext| {
            ctx.bind_body(BodyShape::Json)
        })
        .register_fn("bind_body", |ctx: &mut RequestContext, shape: &str| {
            ctx.bind_body(BodyShape::parse(shape)?)
        });

    engine
        .register_type_with_name::<ScriptResponse>("Response")
        .register_fn("respond", |status: INT, body: Dynamic| {
            ScriptResponse::new(status, body, Map::new())
        })
        .register_fn("respond", |status: INT, body: Dynamic, headers: Map| {
            ScriptResponse::new(status, body, headers)
        });
}
