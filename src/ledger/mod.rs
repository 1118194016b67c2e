//! Append-only audit ledger
//!
//! Every custody or provenance change is recorded as a typed [`LedgerEvent`].
//! Entries are never rewritten; a mistake is answered with a `Correction`
//! event that points at the original entry's `event_id`.
//!
//! Implementations only have to provide `append` plus the read side; the
//! `log_*` helpers build the typed events. Callers in the service layer
//! treat every write as best effort: a failed append is logged and reported
//! as a warning, never rolled into the primary operation's result.

pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::models::{
    Document, Property, PropertyId, Transfer, TransferId, TransferStatus, TransferType, UserId,
};
use crate::error::{HandReceiptError, Result};

pub use sqlite::SqliteLedger;

/// `prev_hash` of the first entry in a chain
pub const GENESIS_HASH: &str = "GENESIS";

/// Audit events, tagged by `event_type` in the stored payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEvent {
    PropertyCreated {
        property_id: PropertyId,
        serial_number: String,
        name: String,
        nsn: Option<String>,
        assigned_to_user_id: Option<UserId>,
    },
    StatusChanged {
        property_id: PropertyId,
        serial_number: String,
        old_status: String,
        new_status: String,
    },
    Transfer {
        transfer_id: TransferId,
        property_id: PropertyId,
        serial_number: String,
        from_user_id: UserId,
        to_user_id: UserId,
        initiator_id: UserId,
        transfer_type: TransferType,
        status: TransferStatus,
        include_components: bool,
    },
    Verification {
        property_id: PropertyId,
        serial_number: String,
        verification_type: String,
    },
    ComponentAttached {
        parent_property_id: PropertyId,
        component_property_id: PropertyId,
        position: Option<String>,
        notes: Option<String>,
    },
    ComponentDetached {
        parent_property_id: PropertyId,
        component_property_id: PropertyId,
        position: Option<String>,
        notes: Option<String>,
    },
    Document {
        document_id: i64,
        action: String,
        document_type: String,
        property_id: Option<PropertyId>,
        transfer_id: Option<TransferId>,
    },
    HandReceiptExport {
        export_type: String,
        form_number: Option<String>,
        transfer_id: Option<TransferId>,
        property_ids: Vec<PropertyId>,
    },
    Correction {
        original_event_id: String,
        original_event_type: String,
        reason: String,
    },
}

impl LedgerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::PropertyCreated { .. } => "PROPERTY_CREATED",
            LedgerEvent::StatusChanged { .. } => "STATUS_CHANGED",
            LedgerEvent::Transfer { .. } => "TRANSFER",
            LedgerEvent::Verification { .. } => "VERIFICATION",
            LedgerEvent::ComponentAttached { .. } => "COMPONENT_ATTACHED",
            LedgerEvent::ComponentDetached { .. } => "COMPONENT_DETACHED",
            LedgerEvent::Document { .. } => "DOCUMENT",
            LedgerEvent::HandReceiptExport { .. } => "HAND_RECEIPT_EXPORT",
            LedgerEvent::Correction { .. } => "CORRECTION",
        }
    }

    /// The property this event is filed under in property history
    pub fn property_id(&self) -> Option<PropertyId> {
        match self {
            LedgerEvent::PropertyCreated { property_id, .. }
            | LedgerEvent::StatusChanged { property_id, .. }
            | LedgerEvent::Transfer { property_id, .. }
            | LedgerEvent::Verification { property_id, .. } => Some(*property_id),
            LedgerEvent::ComponentAttached { parent_property_id, .. }
            | LedgerEvent::ComponentDetached { parent_property_id, .. } => {
                Some(*parent_property_id)
            }
            LedgerEvent::Document { property_id, .. } => *property_id,
            LedgerEvent::HandReceiptExport { .. } | LedgerEvent::Correction { .. } => None,
        }
    }

    pub fn original_event_id(&self) -> Option<&str> {
        match self {
            LedgerEvent::Correction { original_event_id, .. } => Some(original_event_id),
            _ => None,
        }
    }
}

/// A stored, hash-linked ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: i64,
    pub event_id: String,
    pub event_type: String,
    pub property_id: Option<PropertyId>,
    pub actor_id: UserId,
    pub event: LedgerEvent,
    pub created_at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

/// A correction as returned by the correction queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEvent {
    pub event_id: String,
    pub original_event_id: String,
    pub original_event_type: String,
    pub reason: String,
    pub corrected_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl CorrectionEvent {
    pub fn from_entry(entry: &LedgerEntry) -> Option<Self> {
        match &entry.event {
            LedgerEvent::Correction {
                original_event_id,
                original_event_type,
                reason,
            } => Some(Self {
                event_id: entry.event_id.clone(),
                original_event_id: original_event_id.clone(),
                original_event_type: original_event_type.clone(),
                reason: reason.clone(),
                corrected_by: entry.actor_id,
                created_at: entry.created_at,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainProblemKind {
    /// Stored hash does not match the recomputed one
    HashMismatch,
    /// `prev_hash` does not match the predecessor's hash
    BrokenLink,
    /// Sequence numbers skip, so an entry was removed
    SequenceGap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainProblem {
    pub sequence: i64,
    pub event_id: String,
    pub kind: ChainProblemKind,
}

/// Result of a whole-ledger tamper check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_checked: u64,
    pub head_hash: Option<String>,
    pub problems: Vec<ChainProblem>,
}

/// Result of checking one entry and its link to its predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryVerification {
    pub event_id: String,
    pub sequence: i64,
    pub hash_valid: bool,
    pub link_valid: bool,
}

impl EntryVerification {
    pub fn is_valid(&self) -> bool {
        self.hash_valid && self.link_valid
    }
}

/// Hash of one entry over its stored fields and its predecessor's hash
pub fn compute_entry_hash(
    sequence: i64,
    event_id: &str,
    event_type: &str,
    actor_id: UserId,
    payload: &str,
    created_at: &str,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(event_id.as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(actor_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(payload.as_bytes());
    hasher.update(b"|");
    hasher.update(created_at.as_bytes());
    hasher.update(b"|");
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append-only audit sink.
///
/// Writes are synchronous and return an error; the service layer attempts
/// each write exactly once per state change and downgrades failures to
/// warnings.
pub trait Ledger: Send + Sync {
    /// Append one event, returning the stored entry
    fn append(&self, event: LedgerEvent, actor_id: UserId) -> Result<LedgerEntry>;

    fn get_entry(&self, event_id: &str) -> Result<Option<LedgerEntry>>;

    /// Entries filed under a property, oldest first
    fn get_property_history(&self, property_id: PropertyId) -> Result<Vec<LedgerEntry>>;

    /// Most recent entries, newest first
    fn get_general_history(&self, limit: u32) -> Result<Vec<LedgerEntry>>;

    fn get_all_correction_events(&self) -> Result<Vec<CorrectionEvent>>;

    fn get_correction_events_by_original_id(
        &self,
        original_event_id: &str,
    ) -> Result<Vec<CorrectionEvent>>;

    fn get_correction_event_by_id(&self, event_id: &str) -> Result<Option<CorrectionEvent>>;

    fn verify_entry(&self, event_id: &str) -> Result<EntryVerification>;

    /// Recompute every hash and link in the ledger
    fn verify_chain(&self) -> Result<ChainVerification>;

    fn log_property_creation(&self, property: &Property, acting_user_id: UserId) -> Result<()> {
        self.append(
            LedgerEvent::PropertyCreated {
                property_id: property.id,
                serial_number: property.serial_number.clone(),
                name: property.name.clone(),
                nsn: property.nsn.clone(),
                assigned_to_user_id: property.assigned_to_user_id,
            },
            acting_user_id,
        )
        .map(|_| ())
    }

    fn log_status_change(
        &self,
        property_id: PropertyId,
        serial_number: &str,
        old_status: &str,
        new_status: &str,
        acting_user_id: UserId,
    ) -> Result<()> {
        self.append(
            LedgerEvent::StatusChanged {
                property_id,
                serial_number: serial_number.to_string(),
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            },
            acting_user_id,
        )
        .map(|_| ())
    }

    fn log_transfer_event(
        &self,
        transfer: &Transfer,
        serial_number: &str,
        acting_user_id: UserId,
    ) -> Result<()> {
        self.append(
            LedgerEvent::Transfer {
                transfer_id: transfer.id,
                property_id: transfer.property_id,
                serial_number: serial_number.to_string(),
                from_user_id: transfer.from_user_id,
                to_user_id: transfer.to_user_id,
                initiator_id: transfer.initiator_id,
                transfer_type: transfer.transfer_type,
                status: transfer.status,
                include_components: transfer.include_components,
            },
            acting_user_id,
        )
        .map(|_| ())
    }

    fn log_verification_event(
        &self,
        property_id: PropertyId,
        serial_number: &str,
        acting_user_id: UserId,
        verification_type: &str,
    ) -> Result<()> {
        self.append(
            LedgerEvent::Verification {
                property_id,
                serial_number: serial_number.to_string(),
                verification_type: verification_type.to_string(),
            },
            acting_user_id,
        )
        .map(|_| ())
    }

    fn log_component_attached(
        &self,
        parent_property_id: PropertyId,
        component_property_id: PropertyId,
        acting_user_id: UserId,
        position: Option<&str>,
        notes: Option<&str>,
    ) -> Result<()> {
        self.append(
            LedgerEvent::ComponentAttached {
                parent_property_id,
                component_property_id,
                position: position.map(str::to_string),
                notes: notes.map(str::to_string),
            },
            acting_user_id,
        )
        .map(|_| ())
    }

    fn log_component_detached(
        &self,
        parent_property_id: PropertyId,
        component_property_id: PropertyId,
        acting_user_id: UserId,
        position: Option<&str>,
        notes: Option<&str>,
    ) -> Result<()> {
        self.append(
            LedgerEvent::ComponentDetached {
                parent_property_id,
                component_property_id,
                position: position.map(str::to_string),
                notes: notes.map(str::to_string),
            },
            acting_user_id,
        )
        .map(|_| ())
    }

    fn log_document_event(
        &self,
        document: &Document,
        action: &str,
        acting_user_id: UserId,
    ) -> Result<()> {
        self.append(
            LedgerEvent::Document {
                document_id: document.id,
                action: action.to_string(),
                document_type: document.document_type.clone(),
                property_id: document.property_id,
                transfer_id: document.transfer_id,
            },
            acting_user_id,
        )
        .map(|_| ())
    }

    fn log_hand_receipt_export(
        &self,
        export_type: &str,
        form_number: Option<&str>,
        transfer_id: Option<TransferId>,
        property_ids: &[PropertyId],
        acting_user_id: UserId,
    ) -> Result<()> {
        self.append(
            LedgerEvent::HandReceiptExport {
                export_type: export_type.to_string(),
                form_number: form_number.map(str::to_string),
                transfer_id,
                property_ids: property_ids.to_vec(),
            },
            acting_user_id,
        )
        .map(|_| ())
    }

    /// Record a correction as a new event; the original entry is untouched
    fn log_correction_event(
        &self,
        original_event_id: &str,
        original_event_type: &str,
        reason: &str,
        acting_user_id: UserId,
    ) -> Result<CorrectionEvent> {
        let entry = self.append(
            LedgerEvent::Correction {
                original_event_id: original_event_id.to_string(),
                original_event_type: original_event_type.to_string(),
                reason: reason.to_string(),
            },
            acting_user_id,
        )?;

        CorrectionEvent::from_entry(&entry).ok_or_else(|| {
            HandReceiptError::Ledger(format!("Entry {} is not a correction", entry.event_id))
        })
    }
}
