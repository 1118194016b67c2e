//! Registry database schema

use rusqlite::Connection;
use tracing::info;

use crate::error::HandReceiptError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), HandReceiptError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| HandReceiptError::Internal(format!("Failed to enable foreign keys: {}", e)))?;

    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new registry schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating registry schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Registry schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, HandReceiptError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| {
        HandReceiptError::Internal(format!("Failed to create schema_version table: {}", e))
    })?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), HandReceiptError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| HandReceiptError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| HandReceiptError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), HandReceiptError> {
    conn.execute_batch(USERS_SCHEMA)
        .map_err(|e| HandReceiptError::Internal(format!("Failed to create user tables: {}", e)))?;

    conn.execute_batch(PROPERTY_SCHEMA)
        .map_err(|e| {
            HandReceiptError::Internal(format!("Failed to create property tables: {}", e))
        })?;

    conn.execute_batch(TRANSFER_SCHEMA)
        .map_err(|e| {
            HandReceiptError::Internal(format!("Failed to create transfer tables: {}", e))
        })?;

    conn.execute_batch(DOCUMENT_SCHEMA)
        .map_err(|e| {
            HandReceiptError::Internal(format!("Failed to create document tables: {}", e))
        })?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| HandReceiptError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), HandReceiptError> {
    if from_version < 2 {
        info!("Adding version column to properties");
        conn.execute_batch("ALTER TABLE properties ADD COLUMN version INTEGER NOT NULL DEFAULT 1;")
            .map_err(|e| {
                HandReceiptError::Internal(format!("Failed to migrate properties: {}", e))
            })?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

const USERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    rank TEXT,
    unit TEXT,
    email TEXT,
    phone TEXT,
    created_at TEXT NOT NULL
);

-- Directed request; accepted rows connect both users
CREATE TABLE IF NOT EXISTS user_connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    requester_id INTEGER NOT NULL REFERENCES users(id),
    addressee_id INTEGER NOT NULL REFERENCES users(id),
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (requester_id != addressee_id),
    UNIQUE (requester_id, addressee_id)
);
"#;

const PROPERTY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    serial_number TEXT NOT NULL UNIQUE,
    description TEXT,
    nsn TEXT,
    lin TEXT,
    quantity INTEGER NOT NULL DEFAULT 1,
    current_status TEXT NOT NULL DEFAULT 'Active',
    condition TEXT,
    location TEXT,
    assigned_to_user_id INTEGER REFERENCES users(id),

    -- Provenance
    verified INTEGER NOT NULL DEFAULT 0,
    verified_at TEXT,
    verified_by INTEGER,
    source_type TEXT,
    source_ref TEXT,
    source_document_url TEXT,
    import_metadata TEXT,

    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- A component has at most one parent (UNIQUE component_property_id)
CREATE TABLE IF NOT EXISTS property_components (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_property_id INTEGER NOT NULL REFERENCES properties(id),
    component_property_id INTEGER NOT NULL UNIQUE REFERENCES properties(id),
    attached_by_user_id INTEGER NOT NULL,
    position TEXT,
    notes TEXT,
    attached_at TEXT NOT NULL,
    CHECK (parent_property_id != component_property_id)
);

CREATE TABLE IF NOT EXISTS component_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    parent_property_id INTEGER NOT NULL,
    component_property_id INTEGER NOT NULL,
    attaching_user_id INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    position TEXT,
    notes TEXT,
    timestamp TEXT NOT NULL
);
"#;

const TRANSFER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    property_id INTEGER NOT NULL REFERENCES properties(id),
    from_user_id INTEGER NOT NULL,
    to_user_id INTEGER NOT NULL,
    initiator_id INTEGER NOT NULL,
    transfer_type TEXT NOT NULL DEFAULT 'legacy',
    status TEXT NOT NULL DEFAULT 'pending',
    include_components INTEGER NOT NULL DEFAULT 0,
    requested_serial_number TEXT,
    notes TEXT,
    request_date TEXT NOT NULL,
    resolved_date TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL,
    CHECK (from_user_id != to_user_id)
);

CREATE TABLE IF NOT EXISTS transfer_offers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    property_id INTEGER NOT NULL REFERENCES properties(id),
    offering_user_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    include_components INTEGER NOT NULL DEFAULT 0,
    notes TEXT,
    expires_at TEXT,
    accepted_by_user_id INTEGER,
    accepted_at TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transfer_offer_recipients (
    offer_id INTEGER NOT NULL REFERENCES transfer_offers(id) ON DELETE CASCADE,
    recipient_user_id INTEGER NOT NULL,
    viewed_at TEXT,
    notified_at TEXT,
    PRIMARY KEY (offer_id, recipient_user_id)
);
"#;

const DOCUMENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    counterpart_user_id INTEGER,
    direction TEXT NOT NULL,
    document_type TEXT NOT NULL,
    subtype TEXT,
    title TEXT NOT NULL,
    property_id INTEGER,
    transfer_id INTEGER,
    form_number TEXT,
    storage_key TEXT,
    file_url TEXT,
    created_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_properties_assigned ON properties(assigned_to_user_id);
CREATE INDEX IF NOT EXISTS idx_properties_verified ON properties(verified);
CREATE INDEX IF NOT EXISTS idx_components_parent ON property_components(parent_property_id);
CREATE INDEX IF NOT EXISTS idx_component_events_parent ON component_events(parent_property_id);
CREATE INDEX IF NOT EXISTS idx_component_events_component
    ON component_events(component_property_id);
CREATE INDEX IF NOT EXISTS idx_transfers_property ON transfers(property_id);
CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(from_user_id);
CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(to_user_id);
CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status);
CREATE INDEX IF NOT EXISTS idx_offers_status ON transfer_offers(status);
CREATE INDEX IF NOT EXISTS idx_offer_recipients_user
    ON transfer_offer_recipients(recipient_user_id);
CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(user_id);
CREATE INDEX IF NOT EXISTS idx_documents_storage_key ON documents(storage_key);
"#;
