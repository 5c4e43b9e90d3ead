use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod deployments;

pub type Db = SqlitePool;

pub use deployments::{DeploymentRecord, NewDeployment};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open the deployment store and bring its schema up to date.
pub async fn init_store(database_url: &str) -> Result<Db, sqlx::Error> {
    let pool = init_pool(database_url).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

async fn init_pool(database_url: &str) -> Result<Db, sqlx::Error> {
    let is_memory = database_url.starts_with("sqlite::memory");

    ensure_db_dir(database_url)?;

    let mut opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // Each connection to an in-memory SQLite URL normally gets its own private
    // database, so a multi-connection pool would scatter queries across
    // databases. Shared cache plus a single connection keeps tests coherent.
    let pool_opts = if is_memory {
        opts = opts.shared_cache(true);
        SqlitePoolOptions::new().max_connections(1)
    } else {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new().max_connections(5)
    };

    pool_opts
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await
}

fn ensure_db_dir(database_url: &str) -> Result<(), sqlx::Error> {
    if database_url.starts_with("sqlite::memory") {
        return Ok(());
    }
    if let Some(rest) = database_url.strip_prefix("sqlite://") {
        let path_str = rest.split('?').next().unwrap_or(rest);
        if let Some(parent) = Path::new(path_str).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }
    }
    Ok(())
}
