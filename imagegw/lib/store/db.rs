use std::{path::Path, time::Duration};

use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use tokio::fs;

use crate::GatewayResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the image record database
pub static IMAGES_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/store/migrations");

/// Connections kept open per database.
pub const MAX_DB_CONNECTIONS: u32 = 5;

/// How long a writer waits on a lock held by another orchestrator.
pub const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Opens the SQLite database at `db_path`, creating the file and its parent directories when
/// missing, and brings the schema up to date with `migrator`.
///
/// The database runs in WAL mode so several orchestrator processes can share one file.
pub async fn get_or_create_db_pool(
    db_path: impl AsRef<Path>,
    migrator: &Migrator,
) -> GatewayResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(DB_BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_DB_CONNECTIONS)
        .connect_with(options)
        .await?;

    migrator.run(&pool).await?;
    tracing::debug!(path = %db_path.display(), "image database ready");

    Ok(pool)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
