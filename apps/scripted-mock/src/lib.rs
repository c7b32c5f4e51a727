#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    capabilities::CapabilityRegistry,
    config::Config,
    script::{CompileError, CompiledHandler, RouteCompiler},
    server::{AppState, build_router},
    spec::ServiceSpec,
    state::TestStateStore,
};

pub mod capabilities;
pub mod config;
pub mod script;
pub mod server;
pub mod spec;
pub mod state;

/// Compiles every route once. The first failure aborts startup.
pub fn compile_routes(
    spec: &ServiceSpec,
    compiler: &RouteCompiler,
) -> Result<Vec<Arc<CompiledHandler>>, CompileError> {
    spec.routes
        .iter()
        .map(|route| compiler.compile(route).map(Arc::new))
        .collect()
}

#[must_use]
pub fn route_compiler(config: &Config) -> RouteCompiler {
    RouteCompiler::new(
        CapabilityRegistry::with_builtins(config.http_timeout),
        config.script_limits(),
    )
}

pub fn build_app(
    config: &Config,
    spec: &ServiceSpec,
    store: Arc<TestStateStore>,
) -> Result<axum::Router> {
    let handlers = compile_routes(spec, &route_compiler(config))?;
    for handler in &handlers {
        info!(service = %spec.service_name, route = %handler.route(), "route compiled");
    }
    let state = AppState::new(
        spec.service_name.clone(),
        store,
        config.max_body_bytes,
        handlers.len(),
    );
    Ok(build_router(state, &handlers))
}

pub async fn serve(config: Config, spec: ServiceSpec) -> Result<()> {
    let app = build_app(&config, &spec, TestStateStore::shared())?;
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("unable to bind {}", config.bind_addr))?;
    info!(
        service = %spec.service_name,
        bind_addr = %config.bind_addr,
        routes = spec.routes.len(),
        "scripted mock service listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
