//! Route scripts: compiled once at startup into [`CompiledHandler`]s, evaluated once
//! per matching request.
//!
//! Every script runs with these bindings:
//!
//! | Name | Meaning |
//! |---|---|
//! | `ctx` | request accessor: `method`, `path`, `route`, `headers`, `query`, `params`, `header(name)`, `query(name)`, `param(name)` |
//! | `ctx.bind_body()` / `ctx.bind_body(shape)` | records the call, then decodes the body (`json`, `object`, `array`, `string`, `number`, `bool`, `text`) |
//! | `config` | test config snapshot taken at dispatch (`()` when no override is set) |
//! | `ctx.config(key)` | one value from the snapshot, `()` when missing |
//! | `respond(status, body[, headers])` | explicit status and headers for the response |
//!
//! plus the functions of every capability listed in the route's `imports`.

use std::sync::Arc;

use rhai::{AST, Dynamic, Engine, Scope};
use serde_json::Value;
use thiserror::Error;

use crate::{
    capabilities::{CapabilityRegistry, dynamic_to_json, json_to_dynamic},
    spec::{RouteKey, RouteSpec},
    state::{TestConfig, TestStateStore},
};

mod context;

pub use context::{RequestContext, ScriptRequest, ScriptResponse};

const CONTEXT_BINDING: &str = "ctx";
const CONFIG_BINDING: &str = "config";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("route {route} imports unknown capability '{capability}'")]
    UnknownCapability { route: String, capability: String },
    #[error("unable to build processor for {route}: {message}")]
    Build { route: String, message: String },
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("unable to run processor: {0}")]
    Execution(String),
    #[error("unable to encode processor result: {0}")]
    Encode(String),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptLimits {
    /// Operation budget per invocation; 0 disables the cap.
    pub max_operations: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

pub struct RouteCompiler {
    capabilities: CapabilityRegistry,
    limits: ScriptLimits,
}

impl RouteCompiler {
    #[must_use]
    pub fn new(capabilities: CapabilityRegistry, limits: ScriptLimits) -> Self {
        Self {
            capabilities,
            limits,
        }
    }

    pub fn compile(&self, route: &RouteSpec) -> Result<CompiledHandler, CompileError> {
        let label = route.key.to_string();

        let mut engine = Engine::new();
        engine.set_strict_variables(true);
        if self.limits.max_operations > 0 {
            engine.set_max_operations(self.limits.max_operations);
        }

        let print_route = label.clone();
        engine.on_print(move |text| {
            tracing::info!(route = %print_route, "{text}");
        });
        let debug_route = label.clone();
        engine.on_debug(move |text, _source, position| {
            tracing::debug!(route = %debug_route, %position, "{text}");
        });

        context::register_context_api(&mut engine);
        for id in &route.imports {
            let capability =
                self.capabilities
                    .get(id)
                    .ok_or_else(|| CompileError::UnknownCapability {
                        route: label.clone(),
                        capability: id.clone(),
                    })?;
            capability.install(&mut engine, &route.key);
        }

        // Placeholders only declare the bindings for strict-variable checking; they are
        // plain variables so the optimizer cannot fold their values into the AST.
        let mut scope = Scope::new();
        scope.push_dynamic(CONTEXT_BINDING, Dynamic::UNIT);
        scope.push_dynamic(CONFIG_BINDING, Dynamic::UNIT);
        let ast = engine
            .compile_with_scope(&scope, &route.code)
            .map_err(|error| CompileError::Build {
                route: label.clone(),
                message: error.to_string(),
            })?;

        Ok(CompiledHandler {
            route: route.key.clone(),
            label,
            engine,
            ast,
        })
    }
}

/// One route's script, bound to its route key for the life of the process.
pub struct CompiledHandler {
    route: RouteKey,
    label: String,
    engine: Engine,
    ast: AST,
}

impl CompiledHandler {
    #[must_use]
    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    /// Runs the script once. The call is recorded exactly once per invocation, even
    /// when the script never binds the body or fails part way.
    pub fn invoke(
        &self,
        request: ScriptRequest,
        config: Option<Arc<TestConfig>>,
        store: Arc<TestStateStore>,
    ) -> Result<HandlerResponse, ScriptError> {
        let config_value = match config.as_deref() {
            Some(config) => json_to_dynamic(&Value::Object(config.clone()))
                .map_err(|error| ScriptError::Execution(error.to_string()))?,
            None => Dynamic::UNIT,
        };

        let context = RequestContext::new(self.label.clone(), request, config, store);
        let mut scope = Scope::new();
        scope.push(CONTEXT_BINDING, context.clone());
        scope.push_constant_dynamic(CONFIG_BINDING, config_value);

        let outcome = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast);
        context.ensure_recorded();

        let value = outcome.map_err(|error| ScriptError::Execution(error.to_string()))?;
        let response = into_handler_response(value)?;
        tracing::debug!(
            route = %self.label,
            status = response.status,
            body = %response.body,
            "processor response"
        );
        Ok(response)
    }
}

fn into_handler_response(value: Dynamic) -> Result<HandlerResponse, ScriptError> {
    if value.is::<ScriptResponse>() {
        let Some(response) = value.try_cast::<ScriptResponse>() else {
            return Err(ScriptError::Encode("unexpected response value".to_string()));
        };
        let body = dynamic_to_json(&response.body)
            .map_err(|error| ScriptError::Encode(error.to_string()))?;
        return Ok(HandlerResponse {
            status: response.status,
            headers: response.headers,
            body,
        });
    }

    let body = dynamic_to_json(&value).map_err(|error| ScriptError::Encode(error.to_string()))?;
    Ok(HandlerResponse {
        status: 200,
        headers: Vec::new(),
        body,
    })
}
