//! Component attachment edges and their event history

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::HandReceiptError;

use super::models::{
    ComponentEvent, ComponentEventQuery, NewComponentEvent, NewPropertyComponent,
    PropertyComponent, PropertyId,
};

fn link_from_row(row: &Row) -> Result<PropertyComponent, rusqlite::Error> {
    Ok(PropertyComponent {
        id: row.get("id")?,
        parent_property_id: row.get("parent_property_id")?,
        component_property_id: row.get("component_property_id")?,
        attached_by_user_id: row.get("attached_by_user_id")?,
        position: row.get("position")?,
        notes: row.get("notes")?,
        attached_at: row.get("attached_at")?,
    })
}

fn event_from_row(row: &Row) -> Result<ComponentEvent, rusqlite::Error> {
    Ok(ComponentEvent {
        id: row.get("id")?,
        event_id: row.get("event_id")?,
        parent_property_id: row.get("parent_property_id")?,
        component_property_id: row.get("component_property_id")?,
        attaching_user_id: row.get("attaching_user_id")?,
        event_type: row.get("event_type")?,
        position: row.get("position")?,
        notes: row.get("notes")?,
        timestamp: row.get("timestamp")?,
    })
}

/// Insert an attachment edge.
///
/// The UNIQUE index on `component_property_id` turns a second parent into a
/// `Conflict`, leaving the existing edge untouched.
pub fn create_component_link(
    conn: &Connection,
    input: &NewPropertyComponent,
) -> Result<PropertyComponent, HandReceiptError> {
    conn.execute(
        r#"
        INSERT INTO property_components (
            parent_property_id, component_property_id, attached_by_user_id,
            position, notes, attached_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![
            input.parent_property_id,
            input.component_property_id,
            input.attached_by_user_id,
            input.position,
            input.notes,
            Utc::now(),
        ],
    )
    .map_err(|e| {
        if super::is_unique_violation(&e) {
            HandReceiptError::Conflict(format!(
                "Component {} is already attached to another property",
                input.component_property_id
            ))
        } else {
            HandReceiptError::Internal(format!("Insert component link failed: {}", e))
        }
    })?;

    let id = conn.last_insert_rowid();
    conn.query_row("SELECT * FROM property_components WHERE id = ?", params![id], link_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// The edge that attaches `component_id` to its parent, if any
pub fn get_parent_link(
    conn: &Connection,
    component_id: PropertyId,
) -> Result<Option<PropertyComponent>, HandReceiptError> {
    conn.query_row(
        "SELECT * FROM property_components WHERE component_property_id = ?",
        params![component_id],
        link_from_row,
    )
    .optional()
    .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// Current attachments under a parent
pub fn list_property_components(
    conn: &Connection,
    parent_id: PropertyId,
) -> Result<Vec<PropertyComponent>, HandReceiptError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM property_components
             WHERE parent_property_id = ?
             ORDER BY attached_at, id",
        )
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let links = stmt
        .query_map(params![parent_id], link_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(links)
}

/// The component mounted at `position` under a parent, if any
pub fn find_component_at_position(
    conn: &Connection,
    parent_id: PropertyId,
    position: &str,
) -> Result<Option<PropertyComponent>, HandReceiptError> {
    conn.query_row(
        "SELECT * FROM property_components WHERE parent_property_id = ? AND position = ? LIMIT 1",
        params![parent_id, position],
        link_from_row,
    )
    .optional()
    .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// Remove an edge, returning whether one existed
pub fn delete_component_link(
    conn: &Connection,
    parent_id: PropertyId,
    component_id: PropertyId,
) -> Result<bool, HandReceiptError> {
    let deleted = conn
        .execute(
            "DELETE FROM property_components
             WHERE parent_property_id = ? AND component_property_id = ?",
            params![parent_id, component_id],
        )
        .map_err(|e| HandReceiptError::Internal(format!("Delete component link failed: {}", e)))?;
    Ok(deleted > 0)
}

pub fn update_component_position(
    conn: &Connection,
    parent_id: PropertyId,
    component_id: PropertyId,
    position: Option<&str>,
) -> Result<bool, HandReceiptError> {
    let changed = conn
        .execute(
            "UPDATE property_components SET position = ?
             WHERE parent_property_id = ? AND component_property_id = ?",
            params![position, parent_id, component_id],
        )
        .map_err(|e| HandReceiptError::Internal(format!("Update position failed: {}", e)))?;
    Ok(changed > 0)
}

/// Append an attach/detach record with a fresh event id
pub fn create_component_event(
    conn: &Connection,
    input: &NewComponentEvent,
) -> Result<ComponentEvent, HandReceiptError> {
    let event_id = Uuid::new_v4().to_string();

    conn.execute(
        r#"
        INSERT INTO component_events (
            event_id, parent_property_id, component_property_id, attaching_user_id,
            event_type, position, notes, timestamp
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            event_id,
            input.parent_property_id,
            input.component_property_id,
            input.attaching_user_id,
            input.event_type,
            input.position,
            input.notes,
            Utc::now(),
        ],
    )
    .map_err(|e| HandReceiptError::Internal(format!("Insert component event failed: {}", e)))?;

    let id = conn.last_insert_rowid();
    conn.query_row("SELECT * FROM component_events WHERE id = ?", params![id], event_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))
}

/// Component history, newest first
pub fn list_component_events(
    conn: &Connection,
    query: &ComponentEventQuery,
) -> Result<Vec<ComponentEvent>, HandReceiptError> {
    let mut sql = String::from("SELECT * FROM component_events");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(parent_id) = query.parent_property_id {
        conditions.push("parent_property_id = ?");
        params.push(Box::new(parent_id));
    }
    if let Some(component_id) = query.component_property_id {
        conditions.push("component_property_id = ?");
        params.push(Box::new(component_id));
    }
    if let Some(user_id) = query.user_id {
        conditions.push("attaching_user_id = ?");
        params.push(Box::new(user_id));
    }
    if let Some(event_type) = query.event_type {
        conditions.push("event_type = ?");
        params.push(Box::new(event_type));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    let limit = if query.limit == 0 { 100 } else { query.limit };
    sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
    params.push(Box::new(limit as i64));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandReceiptError::Internal(format!("Prepare failed: {}", e)))?;

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let events = stmt
        .query_map(param_refs.as_slice(), event_from_row)
        .map_err(|e| HandReceiptError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HandReceiptError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connections::create_user;
    use crate::db::models::{ComponentEventType, NewProperty, NewUser};
    use crate::db::properties::create_property;
    use crate::db::schema::init_schema;

    fn setup() -> (Connection, i64, Vec<PropertyId>) {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let user = create_user(&conn, &NewUser { name: "Armorer".into(), ..Default::default() })
            .unwrap();
        let ids = ["RIFLE-1", "RIFLE-2", "OPTIC-1"]
            .iter()
            .map(|serial| {
                create_property(
                    &conn,
                    &NewProperty {
                        name: serial.to_string(),
                        serial_number: serial.to_string(),
                        quantity: 1,
                        assigned_to_user_id: Some(user.id),
                        ..Default::default()
                    },
                )
                .unwrap()
                .id
            })
            .collect();
        (conn, user.id, ids)
    }

    fn link(parent: PropertyId, component: PropertyId, user: i64) -> NewPropertyComponent {
        NewPropertyComponent {
            parent_property_id: parent,
            component_property_id: component,
            attached_by_user_id: user,
            position: Some("top_rail".into()),
            notes: None,
        }
    }

    #[test]
    fn test_second_parent_is_conflict_and_keeps_edge() {
        let (conn, user, ids) = setup();
        create_component_link(&conn, &link(ids[0], ids[2], user)).unwrap();

        let err = create_component_link(&conn, &link(ids[1], ids[2], user)).unwrap_err();
        assert!(matches!(err, HandReceiptError::Conflict(_)));

        let edge = get_parent_link(&conn, ids[2]).unwrap().unwrap();
        assert_eq!(edge.parent_property_id, ids[0]);
    }

    #[test]
    fn test_position_lookup_and_update() {
        let (conn, user, ids) = setup();
        create_component_link(&conn, &link(ids[0], ids[2], user)).unwrap();

        assert!(find_component_at_position(&conn, ids[0], "top_rail").unwrap().is_some());
        assert!(update_component_position(&conn, ids[0], ids[2], Some("side_rail")).unwrap());
        assert!(find_component_at_position(&conn, ids[0], "top_rail").unwrap().is_none());
        assert!(!update_component_position(&conn, ids[1], ids[2], None).unwrap());
    }

    #[test]
    fn test_events_filtered_by_type() {
        let (conn, user, ids) = setup();
        for event_type in [ComponentEventType::Attached, ComponentEventType::Detached] {
            create_component_event(
                &conn,
                &NewComponentEvent {
                    parent_property_id: ids[0],
                    component_property_id: ids[2],
                    attaching_user_id: user,
                    event_type,
                    position: None,
                    notes: None,
                },
            )
            .unwrap();
        }

        let detached = list_component_events(
            &conn,
            &ComponentEventQuery {
                parent_property_id: Some(ids[0]),
                event_type: Some(ComponentEventType::Detached),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].event_type, ComponentEventType::Detached);
        assert_eq!(detached[0].event_id.len(), 36);
    }
}
