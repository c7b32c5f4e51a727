use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use scripted_mock_service::{
    build_app,
    config::{Config, LogFormat},
    serve,
    spec::ServiceSpec,
    state::TestStateStore,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Serves scripted mock routes described by a JSON service spec")]
struct Args {
    /// Service spec file; overrides MOCK_SPEC_PATH.
    #[arg(long)]
    spec: Option<PathBuf>,
    /// Load the spec and build the full router, then exit without serving.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env().context("invalid environment configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    if let Some(path) = args.spec {
        config.spec_path = path;
    }

    let spec = ServiceSpec::load(&config.spec_path)
        .with_context(|| format!("unable to load service spec {}", config.spec_path.display()))?;

    if args.check {
        build_app(&config, &spec, TestStateStore::shared())?;
        info!(
            service = %spec.service_name,
            routes = spec.routes.len(),
            "service spec is valid"
        );
        return Ok(());
    }

    serve(config, spec).await
}
