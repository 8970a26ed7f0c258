//! OpenCompiler server - HTTP front end for sandboxed code execution.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use opencompiler::artifact::ArtifactStore;
use opencompiler::config::{
    apply_env_overrides, load_config, load_config_from_path, validate_config, Config, LogFormat,
};
use opencompiler::gateway::{build_router, AppState};
use opencompiler::orchestrator::Orchestrator;
use opencompiler::registry::LanguageRegistry;
use opencompiler::sandbox::{prefetch_images, ContainerRuntime, DockerRuntime};

#[derive(Parser)]
#[command(name = "opencompiler", about = "Run code in Docker sandboxes over HTTP")]
#[command(version)]
struct Args {
    /// Configuration file (JSON5 or TOML)
    #[arg(long, short, env = "OPENCOMPILER_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Port
    #[arg(long, short)]
    port: Option<u16>,

    /// Language registry file
    #[arg(long)]
    languages: Option<PathBuf>,

    /// Skip pulling registry images at startup
    #[arg(long)]
    no_prefetch: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = load_config_from_path(path)?;
                apply_env_overrides(&mut config);
                config
            }
            None => load_config()?,
        };

        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(languages) = &self.languages {
            config.registry.path = languages.clone();
        }
        if self.no_prefetch {
            config.docker.prefetch_images = false;
        }
        Ok(config)
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log.level.as_str().into());

    match config.log.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    init_tracing(&config);
    info!("Starting {} v{}", opencompiler::NAME, opencompiler::VERSION);

    let validation = validate_config(&config);
    for issue in validation.warnings() {
        warn!("Config: {}", issue);
    }
    if !validation.is_valid() {
        for issue in validation.errors() {
            error!("Config: {}", issue);
        }
        anyhow::bail!("invalid configuration");
    }

    let registry = LanguageRegistry::load(&config.registry.path)
        .with_context(|| format!("loading {}", config.registry.path.display()))?;
    info!("Loaded {} languages", registry.len());

    let store = ArtifactStore::open(&config.staging.root).await?;
    info!("Staging artifacts under {}", store.root().display());

    let runtime = DockerRuntime::connect_with_backoff(
        config.docker.connect_attempts,
        config.docker.connect_interval,
    )
    .await?;

    if config.docker.prefetch_images {
        let report = prefetch_images(&runtime, &registry).await;
        for (image, reason) in &report.failed {
            warn!("Image {} unavailable: {}", image, reason);
        }
    }

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
    let orchestrator = Orchestrator::new(Arc::new(registry), store, runtime)
        .with_timeout(config.execution.timeout);
    let state = AppState::new(orchestrator).with_output_buffer(config.execution.output_buffer);
    let app = build_router(state);

    let addr = config.server.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
