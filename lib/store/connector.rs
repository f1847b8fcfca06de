use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use diesel::Connection;

use super::{StoreConnection, StoreError};

/// Resource acquisition capability: every call hands out a scoped connection that is released
/// when the returned box is dropped.
pub trait Connector {
    fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError>;
}

/// Postgres connections checked out of an r2d2 pool.
#[derive(Clone)]
pub struct PgConnector {
    pool: Pool<ConnectionManager<PgConnection>>,
}

impl PgConnector {
    pub fn build(db_url: &str, max_size: u32) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<PgConnection>::new(db_url);
        let pool = Pool::builder().max_size(max_size.max(1)).build(manager)?;
        Ok(Self { pool })
    }
}

impl Connector for PgConnector {
    fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        Ok(Box::new(self.pool.get()?))
    }
}

/// SQLite database file; every acquisition opens a fresh connection.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    database_url: String,
}

impl SqliteConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

impl Connector for SqliteConnector {
    fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let mut conn = SqliteConnection::establish(&self.database_url)?;
        conn.batch_execute("PRAGMA busy_timeout = 5000;")?;
        Ok(Box::new(conn))
    }
}

/// Picks a backend from the URL scheme: `postgres://`/`postgresql://` go to the pool, anything
/// else is treated as a SQLite database path (an optional `sqlite://` prefix is stripped).
pub fn connector_from_url(db_url: &str, pool_size: u32) -> Result<Box<dyn Connector>, StoreError> {
    if db_url.starts_with("postgres://") || db_url.starts_with("postgresql://") {
        return Ok(Box::new(PgConnector::build(db_url, pool_size)?));
    }

    let path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    Ok(Box::new(SqliteConnector::new(path)))
}
