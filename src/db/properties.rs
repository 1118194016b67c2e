//! Property CRUD operations

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::HandReceiptError;

use super::models::{
    ImportMetadata, NewProperty, Property, PropertyId, UserId, DEFAULT_PROPERTY_STATUS,
};

fn property_from_row(row: &Row) -> Result<Property, rusqlite::Error> {
    let metadata_json: Option<String> = row.get("import_metadata")?;
    let import_metadata = metadata_json
        .as_deref()
        .map(decode_metadata)
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Property {
        id: row.get("id")?,
        name: row.get("name")?,
        serial_number: row.get("serial_number")?,
        description: row.get("description")?,
        nsn: row.get("nsn")?,
        lin: row.get("lin")?,
        quantity: row.get("quantity")?,
        current_status: row.get("current_status")?,
        condition: row.get("condition")?,
        location: row.get("location")?,
        assigned_to_user_id: row.get("assigned_to_user_id")?,
        verified: row.get("verified")?,
        verified_at: row.get("verified_at")?,
        verified_by: row.get("verified_by")?,
        source_type: row.get("source_type")?,
        source_ref: row.get("source_ref")?,
        source_document_url: row.get("source_document_url")?,
        import_metadata,
        version: row.get("version")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn decode_metadata(json: &str) -> Result<ImportMetadata, serde_json::Error> {
    serde_json::from_str(json)
}

fn encode_metadata(metadata: Option<&ImportMetadata>) -> Result<Option<String>, HandReceiptError> {
    metadata
        .map(serde_json::to_string)
        .transpose()
        .map_err(HandReceiptError::from)
}

fn query_properties(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Property>, HandReceiptError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params, property_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}

/// Get property by ID
pub fn get_property(
    conn: &Connection,
    id: PropertyId,
) -> Result<Option<Property>, HandReceiptError> {
    conn.query_row("SELECT * FROM properties WHERE id = ?", params![id], property_from_row)
        .optional()
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// Get property by its (unique) serial number
pub fn get_property_by_serial(
    conn: &Connection,
    serial_number: &str,
) -> Result<Option<Property>, HandReceiptError> {
    conn.query_row(
        "SELECT * FROM properties WHERE serial_number = ?",
        params![serial_number],
        property_from_row,
    )
    .optional()
    .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// Insert a property.
///
/// A serial number collision surfaces as `DuplicateSerial` so callers can
/// tell it apart from other insert failures.
pub fn create_property(
    conn: &Connection,
    input: &NewProperty,
) -> Result<Property, HandReceiptError> {
    let now = Utc::now();
    let metadata = encode_metadata(input.import_metadata.as_ref())?;
    let status = input
        .current_status
        .clone()
        .unwrap_or_else(|| DEFAULT_PROPERTY_STATUS.to_string());
    let verified_at = input.verified.then_some(now);

    conn.execute(
        r#"
        INSERT INTO properties (
            name, serial_number, description, nsn, lin, quantity, current_status,
            condition, location, assigned_to_user_id, verified, verified_at, verified_by,
            source_type, source_ref, source_document_url, import_metadata,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            input.name,
            input.serial_number,
            input.description,
            input.nsn,
            input.lin,
            input.quantity,
            status,
            input.condition,
            input.location,
            input.assigned_to_user_id,
            input.verified,
            verified_at,
            input.verified_by,
            input.source_type,
            input.source_ref,
            input.source_document_url,
            metadata,
            now,
            now,
        ],
    )
    .map_err(|e| {
        if super::is_unique_violation(&e) {
            HandReceiptError::DuplicateSerial(input.serial_number.clone())
        } else {
            HandReceiptError::Internal(format!("Insert property failed: {}", e))
        }
    })?;

    let id = conn.last_insert_rowid();
    debug!(id, serial = %input.serial_number, "Inserted property");

    get_property(conn, id)?
        .ok_or_else(|| HandReceiptError::Internal(format!("Property {} missing after insert", id)))
}

/// Write every mutable column if the row is still at `expected_version`.
///
/// Returns `Conflict` when another writer got there first and `NotFound`
/// when the row is gone.
pub fn update_property(
    conn: &Connection,
    property: &Property,
    expected_version: i64,
) -> Result<Property, HandReceiptError> {
    let metadata = encode_metadata(property.import_metadata.as_ref())?;

    let changed = conn
        .execute(
            r#"
            UPDATE properties SET
                name = ?, serial_number = ?, description = ?, nsn = ?, lin = ?, quantity = ?,
                current_status = ?, condition = ?, location = ?, assigned_to_user_id = ?,
                verified = ?, verified_at = ?, verified_by = ?, source_type = ?, source_ref = ?,
                source_document_url = ?, import_metadata = ?,
                version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
            params![
                property.name,
                property.serial_number,
                property.description,
                property.nsn,
                property.lin,
                property.quantity,
                property.current_status,
                property.condition,
                property.location,
                property.assigned_to_user_id,
                property.verified,
                property.verified_at,
                property.verified_by,
                property.source_type,
                property.source_ref,
                property.source_document_url,
                metadata,
                Utc::now(),
                property.id,
                expected_version,
            ],
        )
        .map_err(|e| {
            if super::is_unique_violation(&e) {
                HandReceiptError::DuplicateSerial(property.serial_number.clone())
            } else {
                HandReceiptError::Internal(format!("Update property failed: {}", e))
            }
        })?;

    if changed == 0 {
        return match get_property(conn, property.id)? {
            Some(current) => Err(HandReceiptError::Conflict(format!(
                "Property {} was modified concurrently (now at version {})",
                current.serial_number, current.version
            ))),
            None => Err(HandReceiptError::NotFound(format!("Property {} not found", property.id))),
        };
    }

    get_property(conn, property.id)?
        .ok_or_else(|| HandReceiptError::NotFound(format!("Property {} not found", property.id)))
}

/// Move custody from `from_holder` to `to_user_id`.
///
/// Only the holder column is written, and only while `from_holder` still
/// holds the item, so of two moves out of the same holder exactly one lands.
/// The loser gets `Conflict`.
pub fn reassign_property(
    conn: &Connection,
    id: PropertyId,
    from_holder: Option<UserId>,
    to_user_id: UserId,
) -> Result<Property, HandReceiptError> {
    let changed = conn
        .execute(
            r#"
            UPDATE properties SET
                assigned_to_user_id = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND assigned_to_user_id IS ?
            "#,
            params![to_user_id, Utc::now(), id, from_holder],
        )
        .map_err(|e| HandReceiptError::Internal(format!("Reassign property failed: {}", e)))?;

    if changed == 0 {
        return match get_property(conn, id)? {
            Some(current) => Err(HandReceiptError::Conflict(format!(
                "Property {} is no longer held by {:?} (now {:?})",
                current.serial_number, from_holder, current.assigned_to_user_id
            ))),
            None => Err(HandReceiptError::NotFound(format!("Property {} not found", id))),
        };
    }

    debug!(id, from = ?from_holder, to = to_user_id, "Reassigned property");

    get_property(conn, id)?
        .ok_or_else(|| HandReceiptError::NotFound(format!("Property {} not found", id)))
}

/// Properties currently held by a user
pub fn list_properties_by_user(
    conn: &Connection,
    user_id: UserId,
) -> Result<Vec<Property>, HandReceiptError> {
    query_properties(
        conn,
        "SELECT * FROM properties WHERE assigned_to_user_id = ? ORDER BY name, id",
        &[&user_id],
    )
}

/// Properties held by a user that still await verification
pub fn list_unverified_properties(
    conn: &Connection,
    user_id: UserId,
) -> Result<Vec<Property>, HandReceiptError> {
    query_properties(
        conn,
        "SELECT * FROM properties
         WHERE assigned_to_user_id = ? AND verified = 0
         ORDER BY created_at, id",
        &[&user_id],
    )
}

/// Properties held by `user_id` that are not attached anywhere, excluding `parent_id`
pub fn list_available_components(
    conn: &Connection,
    parent_id: PropertyId,
    user_id: UserId,
) -> Result<Vec<Property>, HandReceiptError> {
    query_properties(
        conn,
        r#"
        SELECT p.* FROM properties p
        WHERE p.assigned_to_user_id = ?
          AND p.id != ?
          AND p.id NOT IN (SELECT component_property_id FROM property_components)
        ORDER BY p.name, p.id
        "#,
        &[&user_id, &parent_id],
    )
}
