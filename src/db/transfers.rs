//! Transfer persistence
//!
//! Status writes are conditional on the row's `version`, so two concurrent
//! writers that read the same transfer cannot both succeed.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::HandReceiptError;

use super::models::{NewTransfer, Transfer, TransferId, TransferQuery};

fn transfer_from_row(row: &Row) -> Result<Transfer, rusqlite::Error> {
    Ok(Transfer {
        id: row.get("id")?,
        property_id: row.get("property_id")?,
        from_user_id: row.get("from_user_id")?,
        to_user_id: row.get("to_user_id")?,
        initiator_id: row.get("initiator_id")?,
        transfer_type: row.get("transfer_type")?,
        status: row.get("status")?,
        include_components: row.get("include_components")?,
        requested_serial_number: row.get("requested_serial_number")?,
        notes: row.get("notes")?,
        request_date: row.get("request_date")?,
        resolved_date: row.get("resolved_date")?,
        version: row.get("version")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Insert a transfer. `resolved_date` is set only when created in a terminal status.
pub fn create_transfer(
    conn: &Connection,
    input: &NewTransfer,
) -> Result<Transfer, HandReceiptError> {
    if input.from_user_id == input.to_user_id {
        return Err(HandReceiptError::InvalidInput(
            "Cannot transfer property to the same user".into(),
        ));
    }

    let now = Utc::now();
    let resolved_date = input.status.is_terminal().then_some(now);

    conn.execute(
        r#"
        INSERT INTO transfers (
            property_id, from_user_id, to_user_id, initiator_id, transfer_type, status,
            include_components, requested_serial_number, notes, request_date, resolved_date,
            version, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
        "#,
        params![
            input.property_id,
            input.from_user_id,
            input.to_user_id,
            input.initiator_id,
            input.transfer_type,
            input.status,
            input.include_components,
            input.requested_serial_number,
            input.notes,
            now,
            resolved_date,
            now,
        ],
    )
    .map_err(|e| HandReceiptError::Internal(format!("Insert transfer failed: {}", e)))?;

    let id = conn.last_insert_rowid();
    debug!(id, property_id = input.property_id, "Inserted transfer");

    get_transfer(conn, id)?
        .ok_or_else(|| HandReceiptError::Internal(format!("Transfer {} missing after insert", id)))
}

/// Get transfer by ID
pub fn get_transfer(
    conn: &Connection,
    id: TransferId,
) -> Result<Option<Transfer>, HandReceiptError> {
    conn.query_row("SELECT * FROM transfers WHERE id = ?", params![id], transfer_from_row)
        .optional()
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// Write status, notes and resolved date if the row is still at `expected_version`.
///
/// Returns `Conflict` when another writer got there first and `NotFound`
/// when the row is gone.
pub fn update_transfer(
    conn: &Connection,
    transfer: &Transfer,
    expected_version: i64,
) -> Result<Transfer, HandReceiptError> {
    let changed = conn
        .execute(
            r#"
            UPDATE transfers SET
                status = ?, notes = ?, resolved_date = ?, include_components = ?,
                version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
            params![
                transfer.status,
                transfer.notes,
                transfer.resolved_date,
                transfer.include_components,
                Utc::now(),
                transfer.id,
                expected_version,
            ],
        )
        .map_err(|e| HandReceiptError::Internal(format!("Update transfer failed: {}", e)))?;

    if changed == 0 {
        return match get_transfer(conn, transfer.id)? {
            Some(current) => Err(HandReceiptError::Conflict(format!(
                "Transfer {} was modified concurrently (now {} at version {})",
                transfer.id, current.status, current.version
            ))),
            None => Err(HandReceiptError::NotFound(format!("Transfer {} not found", transfer.id))),
        };
    }

    get_transfer(conn, transfer.id)?
        .ok_or_else(|| HandReceiptError::NotFound(format!("Transfer {} not found", transfer.id)))
}

/// List transfers with optional filters, newest first
pub fn list_transfers(
    conn: &Connection,
    query: &TransferQuery,
) -> Result<Vec<Transfer>, HandReceiptError> {
    let mut sql = String::from("SELECT * FROM transfers");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(user_id) = query.user_id {
        conditions.push("(from_user_id = ? OR to_user_id = ?)".to_string());
        params.push(Box::new(user_id));
        params.push(Box::new(user_id));
    }

    if let Some(property_id) = query.property_id {
        conditions.push("property_id = ?".to_string());
        params.push(Box::new(property_id));
    }

    if let Some(status) = query.status {
        conditions.push("status = ?".to_string());
        params.push(Box::new(status));
    }

    if let Some(transfer_type) = query.transfer_type {
        conditions.push("transfer_type = ?".to_string());
        params.push(Box::new(transfer_type));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    // A zero limit means "use the default page size"
    let limit = if query.limit == 0 { 100 } else { query.limit };
    sql.push_str(" ORDER BY request_date DESC, id DESC LIMIT ?");
    params.push(Box::new(limit as i64));

    debug!("Executing query: {}", sql);

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), transfer_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connections::create_user;
    use crate::db::models::{NewProperty, NewUser, TransferStatus, TransferType};
    use crate::db::properties::create_property;
    use crate::db::schema::init_schema;

    fn setup() -> (Connection, NewTransfer) {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let a = create_user(&conn, &NewUser { name: "A".into(), ..Default::default() }).unwrap();
        let b = create_user(&conn, &NewUser { name: "B".into(), ..Default::default() }).unwrap();
        let property = create_property(
            &conn,
            &NewProperty {
                name: "Radio".into(),
                serial_number: "RT-1523".into(),
                quantity: 1,
                assigned_to_user_id: Some(a.id),
                ..Default::default()
            },
        )
        .unwrap();

        let input = NewTransfer {
            property_id: property.id,
            from_user_id: a.id,
            to_user_id: b.id,
            initiator_id: a.id,
            transfer_type: TransferType::Offer,
            status: TransferStatus::Pending,
            include_components: false,
            requested_serial_number: None,
            notes: None,
        };
        (conn, input)
    }

    #[test]
    fn test_self_transfer_rejected_before_insert() {
        let (conn, mut input) = setup();
        input.to_user_id = input.from_user_id;

        let err = create_transfer(&conn, &input).unwrap_err();
        assert!(matches!(err, HandReceiptError::InvalidInput(_)));
        assert!(list_transfers(&conn, &TransferQuery { limit: 10, ..Default::default() })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_stale_version_is_conflict() {
        let (conn, input) = setup();
        let transfer = create_transfer(&conn, &input).unwrap();
        assert_eq!(transfer.version, 1);
        assert!(transfer.resolved_date.is_none());

        let mut accepted = transfer.clone();
        accepted.status = TransferStatus::Accepted;
        accepted.resolved_date = Some(Utc::now());
        let stored = update_transfer(&conn, &accepted, transfer.version).unwrap();
        assert_eq!(stored.version, 2);

        let mut rejected = transfer.clone();
        rejected.status = TransferStatus::Rejected;
        let err = update_transfer(&conn, &rejected, transfer.version).unwrap_err();
        assert!(matches!(err, HandReceiptError::Conflict(_)));

        let current = get_transfer(&conn, transfer.id).unwrap().unwrap();
        assert_eq!(current.status, TransferStatus::Accepted);
    }

    #[test]
    fn test_list_filters_by_user_and_status() {
        let (conn, input) = setup();
        create_transfer(&conn, &input).unwrap();
        let second = create_transfer(&conn, &input).unwrap();

        let mut cancelled = second.clone();
        cancelled.status = TransferStatus::Cancelled;
        update_transfer(&conn, &cancelled, second.version).unwrap();

        let pending = list_transfers(
            &conn,
            &TransferQuery {
                user_id: Some(input.to_user_id),
                status: Some(TransferStatus::Pending),
                limit: 10,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, second.id);
    }
}
