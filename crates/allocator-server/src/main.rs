use std::sync::Arc;

use allocator_core::collaborators::noop::{NoopBmp, NoopQuota, NoopSessions};
use allocator_core::store::{HistoricalStore, Store};
use allocator_core::store_memory::MemoryStore;
use allocator_core::{AllocatorConfig, Engine};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = AllocatorConfig::from_env();
    let database_url = parse_database_url();

    let store: Arc<dyn Store> = match database_url.as_deref() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(url).await?;
            let pg = allocator_core::store_postgres::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "DATABASE_URL/--database-url set but the postgres feature is not enabled, using MemoryStore"
            );
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let historical: Option<Arc<dyn HistoricalStore>> = None;

    // No BMP/quota/session backends are wired in this binary — spec.md §1
    // scopes the BMP wire protocol, quota arithmetic, and session plumbing
    // out. A real deployment swaps these no-ops for its own implementations.
    let engine = Arc::new(Engine::new(
        store,
        historical,
        Arc::new(NoopBmp),
        Arc::new(NoopQuota),
        Arc::new(NoopSessions),
        config,
    ));

    engine.start();
    tracing::info!("allocator engine started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, exiting");

    Ok(())
}

/// `--database-url <url>` CLI arg takes precedence over `DATABASE_URL`.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}
