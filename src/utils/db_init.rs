#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite};
use std::str::FromStr;

use log::{error, info};

use crate::utils::errors::Errors;
use crate::utils::sbs_utils::get_absolute_path;

// Database constants.
const SQLITE_PROTOCOL: &str = "sqlite://";
const POOL_MIN_CONNECTIONS: u32 = 2;
const POOL_MAX_CONNECTIONS: u32 = 8;

// ---------------------------------------------------------------------------
// init_db:
// ---------------------------------------------------------------------------
/** Create the database file if needed, open the connection pool and run the
 * embedded migrations.  See the migrations directory for the schema.
 */
pub async fn init_db(database_url: &str) -> Result<Pool<Sqlite>> {
    // Expand ~ and relative segments in file-backed urls.
    let url = expand_database_url(database_url);

    if !Sqlite::database_exists(&url).await.unwrap_or(false) {
        info!("Creating database {}", &url);

        // Make sure the parent directory exists for file-backed databases.
        if let Some(path) = url.strip_prefix(SQLITE_PROTOCOL) {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if let Err(e) = Sqlite::create_database(&url).await {
            let msg = Errors::SBSError(format!("database {} create error: {}", url, e));
            error!("{}", msg);
            return Err(anyhow!("{}", msg));
        }
    } else {
        info!("Database already exists");
    }

    // WAL for concurrent readers; foreign keys enforced on every connection.
    let options = SqliteConnectOptions::from_str(&url)
        .map_err(|e| anyhow!("Unable to create db connection options: {}", e))?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    // Create the database connection pool.
    let db = SqlitePoolOptions::new()
        .min_connections(POOL_MIN_CONNECTIONS)
        .max_connections(POOL_MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|e| anyhow!("Unable to create db connection pool: {}", e))?;

    // Run the embedded migrations.
    run_migrations(&db).await?;
    info!("Migration success");
    Ok(db)
}

// ---------------------------------------------------------------------------
// run_migrations:
// ---------------------------------------------------------------------------
/** Apply the migrations compiled into the binary.  Also used by tests to
 * bring up in-memory databases.
 */
pub async fn run_migrations(db: &Pool<Sqlite>) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .map_err(|e| anyhow!("Migration run error: {}", e))
}

// ---------------------------------------------------------------------------
// expand_database_url:
// ---------------------------------------------------------------------------
fn expand_database_url(database_url: &str) -> String {
    match database_url.strip_prefix(SQLITE_PROTOCOL) {
        // Leave special urls such as sqlite::memory: untouched.
        Some(path) if !path.starts_with(':') => {
            SQLITE_PROTOCOL.to_string() + &get_absolute_path(path)
        }
        _ => database_url.to_string(),
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_url_is_untouched() {
        assert_eq!(expand_database_url("sqlite::memory:"), "sqlite::memory:");
    }

    #[test]
    fn file_url_is_absolutized() {
        let url = expand_database_url("sqlite://~/.sbs/sbs.db");
        assert!(url.starts_with(SQLITE_PROTOCOL));
        assert!(!url.contains('~'));
    }
}
