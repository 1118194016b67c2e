//! User directory and connection operations

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::HandReceiptError;

use super::models::{ConnectionStatus, NewUser, User, UserConnection, UserId};

fn user_from_row(row: &Row) -> Result<User, rusqlite::Error> {
    Ok(User {
        id: row.get("id")?,
        name: row.get("name")?,
        rank: row.get("rank")?,
        unit: row.get("unit")?,
        email: row.get("email")?,
        phone: row.get("phone")?,
        created_at: row.get("created_at")?,
    })
}

fn connection_from_row(row: &Row) -> Result<UserConnection, rusqlite::Error> {
    Ok(UserConnection {
        id: row.get("id")?,
        requester_id: row.get("requester_id")?,
        addressee_id: row.get("addressee_id")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Insert a user
pub fn create_user(conn: &Connection, input: &NewUser) -> Result<User, HandReceiptError> {
    conn.execute(
        "INSERT INTO users (name, rank, unit, email, phone, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        params![input.name, input.rank, input.unit, input.email, input.phone, Utc::now()],
    )
    .map_err(|e| HandReceiptError::Internal(format!("Insert user failed: {}", e)))?;

    let id = conn.last_insert_rowid();
    get_user(conn, id)?
        .ok_or_else(|| HandReceiptError::Internal(format!("User {} missing after insert", id)))
}

/// Get user by ID
pub fn get_user(conn: &Connection, id: UserId) -> Result<Option<User>, HandReceiptError> {
    conn.query_row("SELECT * FROM users WHERE id = ?", params![id], user_from_row)
        .optional()
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// Insert a pending connection request
pub fn create_connection(
    conn: &Connection,
    requester_id: UserId,
    addressee_id: UserId,
) -> Result<UserConnection, HandReceiptError> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO user_connections (requester_id, addressee_id, status, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
        params![requester_id, addressee_id, ConnectionStatus::Pending, now, now],
    )
    .map_err(|e| {
        if super::is_unique_violation(&e) {
            HandReceiptError::Conflict("Connection request already exists".into())
        } else {
            HandReceiptError::Internal(format!("Insert connection failed: {}", e))
        }
    })?;

    let id = conn.last_insert_rowid();
    get_connection(conn, id)?.ok_or_else(|| {
        HandReceiptError::Internal(format!("Connection {} missing after insert", id))
    })
}

pub fn get_connection(
    conn: &Connection,
    id: i64,
) -> Result<Option<UserConnection>, HandReceiptError> {
    conn.query_row(
        "SELECT * FROM user_connections WHERE id = ?",
        params![id],
        connection_from_row,
    )
    .optional()
    .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// Find the connection between two users in either direction
pub fn find_connection_between(
    conn: &Connection,
    user_a: UserId,
    user_b: UserId,
) -> Result<Option<UserConnection>, HandReceiptError> {
    conn.query_row(
        "SELECT * FROM user_connections
         WHERE (requester_id = ?1 AND addressee_id = ?2)
            OR (requester_id = ?2 AND addressee_id = ?1)
         ORDER BY id DESC LIMIT 1",
        params![user_a, user_b],
        connection_from_row,
    )
    .optional()
    .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

pub fn update_connection_status(
    conn: &Connection,
    id: i64,
    status: ConnectionStatus,
) -> Result<bool, HandReceiptError> {
    let changed = conn
        .execute(
            "UPDATE user_connections SET status = ?, updated_at = ? WHERE id = ?",
            params![status, Utc::now(), id],
        )
        .map_err(|e| HandReceiptError::Internal(format!("Update connection failed: {}", e)))?;
    Ok(changed > 0)
}

/// Whether two users share an accepted connection (either direction)
pub fn are_users_connected(
    conn: &Connection,
    user_a: UserId,
    user_b: UserId,
) -> Result<bool, HandReceiptError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM user_connections
             WHERE status = 'accepted'
               AND ((requester_id = ?1 AND addressee_id = ?2)
                 OR (requester_id = ?2 AND addressee_id = ?1))",
            params![user_a, user_b],
            |row| row.get(0),
        )
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?;
    Ok(count > 0)
}

/// All connections (any status) that involve the user
pub fn get_user_connections(
    conn: &Connection,
    user_id: UserId,
) -> Result<Vec<UserConnection>, HandReceiptError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM user_connections
             WHERE requester_id = ?1 OR addressee_id = ?1
             ORDER BY updated_at DESC",
        )
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params![user_id], connection_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}
