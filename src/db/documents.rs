//! Document inbox/outbox rows

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::HandReceiptError;

use super::models::{Document, NewDocument, UserId};

fn document_from_row(row: &Row) -> Result<Document, rusqlite::Error> {
    Ok(Document {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        counterpart_user_id: row.get("counterpart_user_id")?,
        direction: row.get("direction")?,
        document_type: row.get("document_type")?,
        subtype: row.get("subtype")?,
        title: row.get("title")?,
        property_id: row.get("property_id")?,
        transfer_id: row.get("transfer_id")?,
        form_number: row.get("form_number")?,
        storage_key: row.get("storage_key")?,
        file_url: row.get("file_url")?,
        created_at: row.get("created_at")?,
    })
}

pub fn create_document(
    conn: &Connection,
    input: &NewDocument,
) -> Result<Document, HandReceiptError> {
    conn.execute(
        r#"
        INSERT INTO documents (
            user_id, counterpart_user_id, direction, document_type, subtype, title,
            property_id, transfer_id, form_number, storage_key, file_url, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            input.user_id,
            input.counterpart_user_id,
            input.direction,
            input.document_type,
            input.subtype,
            input.title,
            input.property_id,
            input.transfer_id,
            input.form_number,
            input.storage_key,
            input.file_url,
            Utc::now(),
        ],
    )
    .map_err(|e| HandReceiptError::Internal(format!("Insert document failed: {}", e)))?;

    let id = conn.last_insert_rowid();
    get_document(conn, id)?
        .ok_or_else(|| HandReceiptError::Internal(format!("Document {} missing after insert", id)))
}

pub fn get_document(conn: &Connection, id: i64) -> Result<Option<Document>, HandReceiptError> {
    conn.query_row("SELECT * FROM documents WHERE id = ?", params![id], document_from_row)
        .optional()
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

pub fn list_documents_for_user(
    conn: &Connection,
    user_id: UserId,
) -> Result<Vec<Document>, HandReceiptError> {
    let mut stmt = conn
        .prepare("SELECT * FROM documents WHERE user_id = ? ORDER BY created_at DESC, id DESC")
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let docs = stmt
        .query_map(params![user_id], document_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(docs)
}

pub fn delete_document(conn: &Connection, id: i64) -> Result<bool, HandReceiptError> {
    let deleted = conn
        .execute("DELETE FROM documents WHERE id = ?", params![id])
        .map_err(|e| HandReceiptError::Internal(format!("Delete document failed: {}", e)))?;
    Ok(deleted > 0)
}

/// Number of documents still pointing at a stored file
pub fn count_documents_with_storage_key(
    conn: &Connection,
    key: &str,
) -> Result<i64, HandReceiptError> {
    conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE storage_key = ?",
        params![key],
        |row| row.get(0),
    )
    .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}
