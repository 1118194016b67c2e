//! Broadcast offer persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::HandReceiptError;

use super::models::{NewTransferOffer, OfferId, OfferRecipient, OfferStatus, TransferOffer, UserId};

fn offer_from_row(row: &Row) -> Result<TransferOffer, rusqlite::Error> {
    Ok(TransferOffer {
        id: row.get("id")?,
        property_id: row.get("property_id")?,
        offering_user_id: row.get("offering_user_id")?,
        status: row.get("status")?,
        include_components: row.get("include_components")?,
        notes: row.get("notes")?,
        expires_at: row.get("expires_at")?,
        accepted_by_user_id: row.get("accepted_by_user_id")?,
        accepted_at: row.get("accepted_at")?,
        version: row.get("version")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        recipients: vec![], // Loaded separately
    })
}

fn recipient_from_row(row: &Row) -> Result<OfferRecipient, rusqlite::Error> {
    Ok(OfferRecipient {
        offer_id: row.get("offer_id")?,
        recipient_user_id: row.get("recipient_user_id")?,
        viewed_at: row.get("viewed_at")?,
        notified_at: row.get("notified_at")?,
    })
}

fn get_recipients(
    conn: &Connection,
    offer_id: OfferId,
) -> Result<Vec<OfferRecipient>, HandReceiptError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM transfer_offer_recipients WHERE offer_id = ? ORDER BY recipient_user_id",
        )
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let recipients = stmt
        .query_map(params![offer_id], recipient_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(recipients)
}

/// Insert an offer and its recipient rows in one transaction
pub fn create_transfer_offer(
    conn: &mut Connection,
    input: &NewTransferOffer,
) -> Result<TransferOffer, HandReceiptError> {
    let now = Utc::now();
    let tx = conn
        .transaction()
        .map_err(|e| HandReceiptError::Internal(format!("Failed to start transaction: {}", e)))?;

    tx.execute(
        r#"
        INSERT INTO transfer_offers (
            property_id, offering_user_id, status, include_components, notes, expires_at,
            version, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
        params![
            input.property_id,
            input.offering_user_id,
            OfferStatus::Active,
            input.include_components,
            input.notes,
            input.expires_at,
            now,
            now,
        ],
    )
    .map_err(|e| HandReceiptError::Internal(format!("Insert offer failed: {}", e)))?;

    let offer_id = tx.last_insert_rowid();

    for recipient_id in &input.recipient_ids {
        tx.execute(
            "INSERT OR IGNORE INTO transfer_offer_recipients
                (offer_id, recipient_user_id, notified_at)
             VALUES (?, ?, ?)",
            params![offer_id, recipient_id, now],
        )
        .map_err(|e| HandReceiptError::Internal(format!("Insert offer recipient failed: {}", e)))?;
    }

    tx.commit()
        .map_err(|e| HandReceiptError::Internal(format!("Commit failed: {}", e)))?;

    debug!(offer_id, recipients = input.recipient_ids.len(), "Inserted transfer offer");

    get_transfer_offer(conn, offer_id)?
        .ok_or_else(|| {
            HandReceiptError::Internal(format!("Offer {} missing after insert", offer_id))
        })
}

/// Get offer by ID, recipients included
pub fn get_transfer_offer(
    conn: &Connection,
    id: OfferId,
) -> Result<Option<TransferOffer>, HandReceiptError> {
    let offer = conn
        .query_row("SELECT * FROM transfer_offers WHERE id = ?", params![id], offer_from_row)
        .optional()
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?;

    match offer {
        Some(mut offer) => {
            offer.recipients = get_recipients(conn, id)?;
            Ok(Some(offer))
        }
        None => Ok(None),
    }
}

/// Write status and acceptance fields if the row is still at `expected_version`
pub fn update_transfer_offer(
    conn: &Connection,
    offer: &TransferOffer,
    expected_version: i64,
) -> Result<TransferOffer, HandReceiptError> {
    let changed = conn
        .execute(
            r#"
            UPDATE transfer_offers SET
                status = ?, accepted_by_user_id = ?, accepted_at = ?, notes = ?,
                version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
            params![
                offer.status,
                offer.accepted_by_user_id,
                offer.accepted_at,
                offer.notes,
                Utc::now(),
                offer.id,
                expected_version,
            ],
        )
        .map_err(|e| HandReceiptError::Internal(format!("Update offer failed: {}", e)))?;

    if changed == 0 {
        return match get_transfer_offer(conn, offer.id)? {
            Some(current) => Err(HandReceiptError::Conflict(format!(
                "Offer {} was modified concurrently (now {})",
                offer.id, current.status
            ))),
            None => Err(HandReceiptError::NotFound(format!("Offer {} not found", offer.id))),
        };
    }

    get_transfer_offer(conn, offer.id)?
        .ok_or_else(|| HandReceiptError::NotFound(format!("Offer {} not found", offer.id)))
}

/// Active, unexpired offers addressed to a user
pub fn list_active_offers_for_user(
    conn: &Connection,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<Vec<TransferOffer>, HandReceiptError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT o.* FROM transfer_offers o
            INNER JOIN transfer_offer_recipients r ON r.offer_id = o.id
            WHERE r.recipient_user_id = ?
              AND o.status = 'active'
              AND (o.expires_at IS NULL OR o.expires_at > ?)
            ORDER BY o.created_at DESC, o.id DESC
            "#,
        )
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let mut offers = stmt
        .query_map(params![user_id, now], offer_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    for offer in &mut offers {
        offer.recipients = get_recipients(conn, offer.id)?;
    }

    Ok(offers)
}

/// Offers a user has made, any status
pub fn list_offers_by_user(
    conn: &Connection,
    user_id: UserId,
) -> Result<Vec<TransferOffer>, HandReceiptError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM transfer_offers
             WHERE offering_user_id = ?
             ORDER BY created_at DESC, id DESC",
        )
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let mut offers = stmt
        .query_map(params![user_id], offer_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    for offer in &mut offers {
        offer.recipients = get_recipients(conn, offer.id)?;
    }

    Ok(offers)
}

/// Stamp the first view of an offer by a recipient
pub fn mark_offer_viewed(
    conn: &Connection,
    offer_id: OfferId,
    user_id: UserId,
) -> Result<(), HandReceiptError> {
    conn.execute(
        "UPDATE transfer_offer_recipients SET viewed_at = ?
         WHERE offer_id = ? AND recipient_user_id = ? AND viewed_at IS NULL",
        params![Utc::now(), offer_id, user_id],
    )
    .map_err(|e| HandReceiptError::Internal(format!("Mark viewed failed: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connections::create_user;
    use crate::db::models::{NewProperty, NewUser};
    use crate::db::properties::create_property;
    use crate::db::schema::init_schema;
    use chrono::Duration;

    fn setup() -> (Connection, NewTransferOffer) {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let holder = create_user(&conn, &NewUser { name: "Holder".into(), ..Default::default() })
            .unwrap();
        let property = create_property(
            &conn,
            &NewProperty {
                name: "NVG".into(),
                serial_number: "PVS14-001".into(),
                quantity: 1,
                assigned_to_user_id: Some(holder.id),
                ..Default::default()
            },
        )
        .unwrap();

        let input = NewTransferOffer {
            property_id: property.id,
            offering_user_id: holder.id,
            recipient_ids: vec![10, 11],
            include_components: false,
            notes: None,
            expires_at: None,
        };
        (conn, input)
    }

    #[test]
    fn test_offer_created_with_recipients() {
        let (mut conn, input) = setup();
        let offer = create_transfer_offer(&mut conn, &input).unwrap();

        assert_eq!(offer.status, OfferStatus::Active);
        assert_eq!(offer.recipients.len(), 2);
        assert!(offer.has_recipient(11));
        assert!(offer.recipients.iter().all(|r| r.viewed_at.is_none()));
    }

    #[test]
    fn test_expired_offers_hidden_from_active_list() {
        let (mut conn, mut input) = setup();
        input.expires_at = Some(Utc::now() - Duration::hours(1));
        create_transfer_offer(&mut conn, &input).unwrap();

        input.expires_at = Some(Utc::now() + Duration::days(2));
        let live = create_transfer_offer(&mut conn, &input).unwrap();

        let active = list_active_offers_for_user(&conn, 10, Utc::now()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
    }

    #[test]
    fn test_mark_viewed_only_for_that_recipient() {
        let (mut conn, input) = setup();
        let offer = create_transfer_offer(&mut conn, &input).unwrap();

        mark_offer_viewed(&conn, offer.id, 10).unwrap();
        let offer = get_transfer_offer(&conn, offer.id).unwrap().unwrap();
        let viewed: Vec<_> = offer
            .recipients
            .iter()
            .filter(|r| r.viewed_at.is_some())
            .map(|r| r.recipient_user_id)
            .collect();
        assert_eq!(viewed, vec![10]);
    }
}
