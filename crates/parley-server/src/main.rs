use std::sync::Arc;

use tracing::info;

use parley_gateway::Gateway;
use parley_gateway::presence::{MemoryPresenceStore, PresenceStore};
use parley_gateway::presence_redis::RedisPresenceStore;
use parley_server::config::Config;
use parley_server::{AppState, router};

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "parley=debug,parley_server=debug,parley_gateway=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    // Store calls run on the blocking pool; its size caps concurrent store I/O
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.blocking_threads)
        .build()?
        .block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let db = parley_db::Database::open(&config.db_path)?;

    let store: Arc<dyn PresenceStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisPresenceStore::connect(url)?),
        None => {
            info!("No PARLEY_REDIS_URL, keeping presence in process");
            Arc::new(MemoryPresenceStore::new())
        }
    };

    let gateway = Gateway::new(Arc::new(db), store);
    let app = router(AppState::new(gateway, &config));

    let addr = config.addr()?;
    info!("Parley listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}
