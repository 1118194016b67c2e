//! SQLite-backed hash-chained ledger
//!
//! Lives in its own database file so audit writes never share a lock or a
//! transaction with the registry. Triggers abort any UPDATE or DELETE on
//! `ledger_entries`; tampering that bypasses them (editing the file
//! directly) is caught by [`Ledger::verify_chain`].

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::models::{PropertyId, UserId};
use crate::error::{HandReceiptError, Result};

use super::{
    compute_entry_hash, ChainProblem, ChainProblemKind, ChainVerification, CorrectionEvent,
    EntryVerification, Ledger, LedgerEntry, LedgerEvent, GENESIS_HASH,
};

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    sequence INTEGER PRIMARY KEY,
    event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    property_id INTEGER,
    original_event_id TEXT,
    actor_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    prev_hash TEXT NOT NULL,
    hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_property ON ledger_entries(property_id);
CREATE INDEX IF NOT EXISTS idx_ledger_type ON ledger_entries(event_type);
CREATE INDEX IF NOT EXISTS idx_ledger_original ON ledger_entries(original_event_id);

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are immutable');
END;
"#;

/// Row as stored, before the payload and timestamp are parsed.
/// Verification hashes these exact strings.
struct StoredEntry {
    sequence: i64,
    event_id: String,
    event_type: String,
    property_id: Option<PropertyId>,
    actor_id: UserId,
    payload: String,
    created_at: String,
    prev_hash: String,
    hash: String,
}

impl StoredEntry {
    fn from_row(row: &Row) -> std::result::Result<Self, rusqlite::Error> {
        Ok(Self {
            sequence: row.get("sequence")?,
            event_id: row.get("event_id")?,
            event_type: row.get("event_type")?,
            property_id: row.get("property_id")?,
            actor_id: row.get("actor_id")?,
            payload: row.get("payload")?,
            created_at: row.get("created_at")?,
            prev_hash: row.get("prev_hash")?,
            hash: row.get("hash")?,
        })
    }

    fn recomputed_hash(&self) -> String {
        compute_entry_hash(
            self.sequence,
            &self.event_id,
            &self.event_type,
            self.actor_id,
            &self.payload,
            &self.created_at,
            &self.prev_hash,
        )
    }

    fn into_entry(self) -> Result<LedgerEntry> {
        let event: LedgerEvent = serde_json::from_str(&self.payload)?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| {
                HandReceiptError::Ledger(format!("Bad timestamp on entry {}: {}", self.event_id, e))
            })?
            .with_timezone(&Utc);

        Ok(LedgerEntry {
            sequence: self.sequence,
            event_id: self.event_id,
            event_type: self.event_type,
            property_id: self.property_id,
            actor_id: self.actor_id,
            event,
            created_at,
            prev_hash: self.prev_hash,
            hash: self.hash,
        })
    }
}

/// Hash-chained ledger in a dedicated SQLite file
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create the ledger database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening ledger database at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| HandReceiptError::Ledger(format!("Failed to open ledger: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| HandReceiptError::Ledger(format!("Failed to set PRAGMA: {}", e)))?;

        Self::init(conn)
    }

    /// Open an in-memory ledger (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory ledger");

        let conn = Connection::open_in_memory()
            .map_err(|e| HandReceiptError::Ledger(format!("Failed to open ledger: {}", e)))?;

        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(LEDGER_SCHEMA)
            .map_err(|e| {
                HandReceiptError::Ledger(format!("Failed to create ledger schema: {}", e))
            })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| HandReceiptError::Ledger(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    fn query_stored(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<StoredEntry>> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| HandReceiptError::Ledger(format!("Prepare failed: {}", e)))?;

        let rows = stmt
            .query_map(params, StoredEntry::from_row)
            .map_err(|e| HandReceiptError::Ledger(format!("Query failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HandReceiptError::Ledger(format!("Row parse failed: {}", e)))?;

        Ok(rows)
    }

    fn query_entries(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<LedgerEntry>> {
        self.with_conn(|conn| Self::query_stored(conn, sql, params))?
            .into_iter()
            .map(StoredEntry::into_entry)
            .collect()
    }

    fn find_stored(conn: &Connection, event_id: &str) -> Result<Option<StoredEntry>> {
        conn.query_row(
            "SELECT * FROM ledger_entries WHERE event_id = ?",
            params![event_id],
            StoredEntry::from_row,
        )
        .optional()
        .map_err(|e| HandReceiptError::Ledger(format!("Query failed: {}", e)))
    }

    fn corrections(entries: Vec<LedgerEntry>) -> Vec<CorrectionEvent> {
        entries.iter().filter_map(CorrectionEvent::from_entry).collect()
    }
}

impl Ledger for SqliteLedger {
    fn append(&self, event: LedgerEvent, actor_id: UserId) -> Result<LedgerEntry> {
        let payload = serde_json::to_string(&event)?;
        let event_type = event.event_type();
        let property_id = event.property_id();
        let original_event_id = event.original_event_id().map(str::to_string);
        let event_id = Uuid::new_v4().to_string();
        // Stored with microsecond precision, so keep the returned entry identical
        let now = Utc::now().trunc_subsecs(6);
        let created_at = now.to_rfc3339_opts(SecondsFormat::Micros, true);

        let (sequence, prev_hash, hash) = self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| {
                    HandReceiptError::Ledger(format!("Failed to start transaction: {}", e))
                })?;

            let last: Option<(i64, String)> = tx
                .query_row(
                    "SELECT sequence, hash FROM ledger_entries ORDER BY sequence DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| HandReceiptError::Ledger(format!("Query failed: {}", e)))?;

            let (sequence, prev_hash) = match last {
                Some((seq, hash)) => (seq + 1, hash),
                None => (1, GENESIS_HASH.to_string()),
            };

            let hash = compute_entry_hash(
                sequence,
                &event_id,
                event_type,
                actor_id,
                &payload,
                &created_at,
                &prev_hash,
            );

            tx.execute(
                r#"
                INSERT INTO ledger_entries (
                    sequence, event_id, event_type, property_id, original_event_id,
                    actor_id, payload, created_at, prev_hash, hash
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    sequence,
                    event_id,
                    event_type,
                    property_id,
                    original_event_id,
                    actor_id,
                    payload,
                    created_at,
                    prev_hash,
                    hash,
                ],
            )
            .map_err(|e| HandReceiptError::Ledger(format!("Append failed: {}", e)))?;

            tx.commit()
                .map_err(|e| HandReceiptError::Ledger(format!("Commit failed: {}", e)))?;

            Ok((sequence, prev_hash, hash))
        })?;

        debug!(sequence, event_type, event_id = %event_id, "Appended ledger entry");

        Ok(LedgerEntry {
            sequence,
            event_id,
            event_type: event_type.to_string(),
            property_id,
            actor_id,
            event,
            created_at: now,
            prev_hash,
            hash,
        })
    }

    fn get_entry(&self, event_id: &str) -> Result<Option<LedgerEntry>> {
        self.with_conn(|conn| Self::find_stored(conn, event_id))?
            .map(StoredEntry::into_entry)
            .transpose()
    }

    fn get_property_history(&self, property_id: PropertyId) -> Result<Vec<LedgerEntry>> {
        self.query_entries(
            "SELECT * FROM ledger_entries WHERE property_id = ? ORDER BY sequence",
            &[&property_id],
        )
    }

    fn get_general_history(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        self.query_entries(
            "SELECT * FROM ledger_entries ORDER BY sequence DESC LIMIT ?",
            &[&(limit as i64)],
        )
    }

    fn get_all_correction_events(&self) -> Result<Vec<CorrectionEvent>> {
        let entries = self.query_entries(
            "SELECT * FROM ledger_entries WHERE event_type = 'CORRECTION' ORDER BY sequence",
            &[],
        )?;
        Ok(Self::corrections(entries))
    }

    fn get_correction_events_by_original_id(
        &self,
        original_event_id: &str,
    ) -> Result<Vec<CorrectionEvent>> {
        let entries = self.query_entries(
            "SELECT * FROM ledger_entries WHERE original_event_id = ? ORDER BY sequence",
            &[&original_event_id],
        )?;
        Ok(Self::corrections(entries))
    }

    fn get_correction_event_by_id(&self, event_id: &str) -> Result<Option<CorrectionEvent>> {
        Ok(self
            .get_entry(event_id)?
            .as_ref()
            .and_then(CorrectionEvent::from_entry))
    }

    fn verify_entry(&self, event_id: &str) -> Result<EntryVerification> {
        self.with_conn(|conn| {
            let stored = Self::find_stored(conn, event_id)?
                .ok_or_else(|| {
                    HandReceiptError::NotFound(format!("Ledger entry {} not found", event_id))
                })?;

            let predecessor_hash: Option<String> = conn
                .query_row(
                    "SELECT hash FROM ledger_entries WHERE sequence = ?",
                    params![stored.sequence - 1],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| HandReceiptError::Ledger(format!("Query failed: {}", e)))?;

            let link_valid = match predecessor_hash {
                Some(hash) => stored.prev_hash == hash,
                None => stored.sequence == 1 && stored.prev_hash == GENESIS_HASH,
            };

            Ok(EntryVerification {
                event_id: stored.event_id.clone(),
                sequence: stored.sequence,
                hash_valid: stored.recomputed_hash() == stored.hash,
                link_valid,
            })
        })
    }

    fn verify_chain(&self) -> Result<ChainVerification> {
        let stored = self.with_conn(|conn| {
            Self::query_stored(conn, "SELECT * FROM ledger_entries ORDER BY sequence", &[])
        })?;

        let mut problems = Vec::new();
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut expected_sequence = 1;

        for entry in &stored {
            if entry.sequence != expected_sequence {
                problems.push(ChainProblem {
                    sequence: entry.sequence,
                    event_id: entry.event_id.clone(),
                    kind: ChainProblemKind::SequenceGap,
                });
            }
            if entry.prev_hash != expected_prev {
                problems.push(ChainProblem {
                    sequence: entry.sequence,
                    event_id: entry.event_id.clone(),
                    kind: ChainProblemKind::BrokenLink,
                });
            }
            if entry.recomputed_hash() != entry.hash {
                problems.push(ChainProblem {
                    sequence: entry.sequence,
                    event_id: entry.event_id.clone(),
                    kind: ChainProblemKind::HashMismatch,
                });
            }

            expected_prev = entry.hash.clone();
            expected_sequence = entry.sequence + 1;
        }

        if !problems.is_empty() {
            warn!(problems = problems.len(), "Ledger chain verification failed");
        }

        Ok(ChainVerification {
            valid: problems.is_empty(),
            entries_checked: stored.len() as u64,
            head_hash: stored.last().map(|e| e.hash.clone()),
            problems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_change(property_id: PropertyId, new_status: &str) -> LedgerEvent {
        LedgerEvent::StatusChanged {
            property_id,
            serial_number: format!("SN-{}", property_id),
            old_status: "Active".into(),
            new_status: new_status.into(),
        }
    }

    #[test]
    fn test_entries_chain_from_genesis() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let first = ledger.append(status_change(1, "Operational"), 1).unwrap();
        let second = ledger.append(status_change(1, "Under Maintenance"), 1).unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);

        let report = ledger.verify_chain().unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 2);
        assert_eq!(report.head_hash.as_deref(), Some(second.hash.as_str()));
        assert!(ledger.verify_entry(&second.event_id).unwrap().is_valid());
    }

    #[test]
    fn test_triggers_block_update_and_delete() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        ledger.append(status_change(1, "Operational"), 1).unwrap();

        ledger
            .with_conn(|conn| {
                assert!(conn.execute("UPDATE ledger_entries SET actor_id = 99", []).is_err());
                assert!(conn.execute("DELETE FROM ledger_entries", []).is_err());
                Ok(())
            })
            .unwrap();

        assert_eq!(ledger.get_general_history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_tampered_payload_is_detected() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        ledger.append(status_change(1, "Operational"), 1).unwrap();
        let target = ledger.append(status_change(1, "Lost"), 1).unwrap();
        ledger.append(status_change(2, "Operational"), 1).unwrap();

        ledger
            .with_conn(|conn| {
                conn.execute_batch(
                    "DROP TRIGGER ledger_entries_no_update;
                     UPDATE ledger_entries
                     SET payload = replace(payload, 'Lost', 'Found')
                     WHERE sequence = 2;",
                )
                .unwrap();
                Ok(())
            })
            .unwrap();

        let report = ledger.verify_chain().unwrap();
        assert!(!report.valid);
        assert_eq!(report.problems.len(), 1);
        assert_eq!(report.problems[0].kind, ChainProblemKind::HashMismatch);
        assert_eq!(report.problems[0].event_id, target.event_id);
        assert!(!ledger.verify_entry(&target.event_id).unwrap().hash_valid);
    }

    #[test]
    fn test_removed_entry_breaks_chain() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        for status in ["A", "B", "C"] {
            ledger.append(status_change(1, status), 1).unwrap();
        }

        ledger
            .with_conn(|conn| {
                conn.execute_batch(
                    "DROP TRIGGER ledger_entries_no_delete;
                     DELETE FROM ledger_entries WHERE sequence = 2;",
                )
                .unwrap();
                Ok(())
            })
            .unwrap();

        let report = ledger.verify_chain().unwrap();
        let kinds: Vec<_> = report.problems.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![ChainProblemKind::SequenceGap, ChainProblemKind::BrokenLink]);
    }

    #[test]
    fn test_corrections_reference_original() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let original = ledger.append(status_change(5, "Lost"), 3).unwrap();

        let correction = ledger
            .log_correction_event(&original.event_id, "STATUS_CHANGED", "entered on wrong item", 4)
            .unwrap();
        assert_eq!(correction.original_event_id, original.event_id);
        assert_eq!(correction.corrected_by, 4);

        assert_eq!(ledger.get_all_correction_events().unwrap().len(), 1);
        assert_eq!(
            ledger
                .get_correction_events_by_original_id(&original.event_id)
                .unwrap()
                .len(),
            1
        );
        assert!(ledger.get_correction_event_by_id(&correction.event_id).unwrap().is_some());
        assert!(ledger.get_correction_event_by_id(&original.event_id).unwrap().is_none());

        // Original is unchanged
        let history = ledger.get_property_history(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], original);
    }
}
