//! SQLite registry for property, custody and document state
//!
//! ## Tables
//!
//! - `users`, `user_connections` - directory and accepted connections
//! - `properties` - equipment rows, unique by serial number
//! - `property_components`, `component_events` - attachment forest and its history
//! - `transfers` - typed custody transactions with a version column
//! - `transfer_offers`, `transfer_offer_recipients` - broadcast offers
//! - `documents` - generated hand receipts per user
//!
//! The ledger lives in its own database (see `crate::ledger`).

pub mod schema;
pub mod models;
pub mod properties;
pub mod transfers;
pub mod offers;
pub mod components;
pub mod connections;
pub mod documents;
pub mod repository;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::HandReceiptError;

pub use models::*;
pub use repository::Repository;

/// SQLite database holding the property registry
pub struct HandReceiptDb {
    conn: Mutex<Connection>,
}

impl HandReceiptDb {
    /// Open or create the registry database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, HandReceiptError> {
        info!("Opening registry database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| HandReceiptError::Internal(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| HandReceiptError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, HandReceiptError> {
        debug!("Opening in-memory registry database");

        let conn = Connection::open_in_memory().map_err(|e| {
            HandReceiptError::Internal(format!("Failed to open in-memory SQLite: {}", e))
        })?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), HandReceiptError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read or single-statement write against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, HandReceiptError>
    where
        F: FnOnce(&Connection) -> Result<T, HandReceiptError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| HandReceiptError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, HandReceiptError>
    where
        F: FnOnce(&mut Connection) -> Result<T, HandReceiptError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| HandReceiptError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, HandReceiptError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, HandReceiptError> {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
            };

            Ok(DbStats {
                user_count: count("SELECT COUNT(*) FROM users")?,
                property_count: count("SELECT COUNT(*) FROM properties")?,
                unverified_count: count("SELECT COUNT(*) FROM properties WHERE verified = 0")?,
                pending_transfer_count: count(
                    "SELECT COUNT(*) FROM transfers WHERE status = 'pending'",
                )?,
                active_offer_count: count(
                    "SELECT COUNT(*) FROM transfer_offers WHERE status = 'active'",
                )?,
                component_link_count: count("SELECT COUNT(*) FROM property_components")?,
                document_count: count("SELECT COUNT(*) FROM documents")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub user_count: u64,
    pub property_count: u64,
    pub unverified_count: u64,
    pub pending_transfer_count: u64,
    pub active_offer_count: u64,
    pub component_link_count: u64,
    pub document_count: u64,
}

/// True when a statement failed on a UNIQUE constraint
pub(crate) fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file_and_reports_empty_stats() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.db");
        let db = HandReceiptDb::open(&path).unwrap();
        assert!(path.exists());

        let stats = db.stats().unwrap();
        assert_eq!(stats.property_count, 0);
        assert_eq!(stats.pending_transfer_count, 0);
    }
}
