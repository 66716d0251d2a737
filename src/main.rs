use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use persisto::api::{self, AppState};
use persisto::config::{Config, LoggingConfig};
use persisto::error::{Error, Result};
use persisto::executor::Executor;
use persisto::registry::Registry;
use persisto::stage::StageManager;
use persisto::storage::{self, client::ObjectStore, Stages};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_logging(&config.logging)?;

    // Backends first: every later step opens connections through them.
    storage::memory::register().map_err(|source| Error::VfsRegister {
        name: "memory",
        source,
    })?;
    let local_dir = storage::local::prepare_directory(&config.storage.local.directory_path)
        .map_err(|source| Error::Io {
            path: config.storage.local.directory_path.clone(),
            source,
        })?;
    storage::local::register().map_err(|source| Error::VfsRegister {
        name: "disk",
        source,
    })?;

    // The remote store is fatal when unreachable at startup.
    let store = storage::client::init(&config.storage.remote).await?;
    storage::remote::register(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        config.storage.remote.max_cache_bytes,
    )
    .map_err(|source| Error::VfsRegister {
        name: "r2",
        source,
    })?;

    let stages = Stages::new(&config.storage, local_dir)?;
    let registry = Arc::new(Registry::new(stages.clone()));
    let manager = Arc::new(StageManager::new(
        stages,
        config.settings.clone(),
        Some(Arc::clone(&store) as Arc<dyn ObjectStore>),
    ));

    hydrate_from_remote(&registry, &manager, Arc::clone(&store) as Arc<dyn ObjectStore>).await;

    let _monitor = persisto::monitor::spawn(Arc::clone(&registry), Arc::clone(&manager));

    let executor = Arc::new(Executor::new(
        Arc::clone(&registry),
        Arc::clone(&manager),
    ));
    let app = api::router(AppState {
        registry,
        manager,
        executor,
        server: config.server.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Server { source })?;
    tracing::info!(
        %addr,
        name = %config.server.name,
        version = %config.server.version,
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|source| Error::Server { source })?;

    Ok(())
}

/// Databases already present on the remote tier become records at the
/// persistence stage, so restarts pick up where the last run left off.
async fn hydrate_from_remote(
    registry: &Arc<Registry>,
    manager: &Arc<StageManager>,
    store: Arc<dyn ObjectStore>,
) {
    let listing =
        tokio::task::spawn_blocking(move || storage::client::list_databases(store.as_ref())).await;
    let names = match listing {
        Ok(Ok(names)) => names,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "could not list remote databases");
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, "remote listing task failed");
            return;
        }
    };

    let stage = manager.persistence_stage();
    for name in names {
        match registry.adopt(&name, stage).await {
            Ok(Some(_)) => tracing::info!(%name, stage, "adopted remote database"),
            Ok(None) => {}
            Err(err) => tracing::warn!(%name, error = %err, "skipping remote database"),
        }
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
