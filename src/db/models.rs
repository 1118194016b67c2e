//! Domain records shared by the repository and service layers
//!
//! Every row type here maps one table. Enumerated columns are stored as
//! lowercase text and converted through `ToSql`/`FromSql` so the state
//! machine never sees raw strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HandReceiptError;

pub type UserId = i64;
pub type PropertyId = i64;
pub type TransferId = i64;
pub type OfferId = i64;

/// Implements text column conversion for an enum with `as_str` and `FromStr`.
macro_rules! text_column {
    ($ty:ty) => {
        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value.as_str()?.parse().map_err(|e: HandReceiptError| {
                    rusqlite::types::FromSqlError::Other(Box::new(e))
                })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// =============================================================================
// Users and connections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub rank: Option<String>,
    pub unit: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    pub name: String,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
    Blocked,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Accepted => "accepted",
            ConnectionStatus::Blocked => "blocked",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = HandReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "accepted" => Ok(ConnectionStatus::Accepted),
            "blocked" => Ok(ConnectionStatus::Blocked),
            other => Err(HandReceiptError::InvalidInput(format!(
                "Unknown connection status: {}",
                other
            ))),
        }
    }
}

text_column!(ConnectionStatus);

/// A directed connection request between two users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConnection {
    pub id: i64,
    pub requester_id: UserId,
    pub addressee_id: UserId,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserConnection {
    /// The user on the other side of this connection from `user_id`
    pub fn other_party(&self, user_id: UserId) -> UserId {
        if self.requester_id == user_id {
            self.addressee_id
        } else {
            self.requester_id
        }
    }
}

// =============================================================================
// Property
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialSource {
    /// Read directly off the form
    Explicit,
    /// Synthesized during import because the form had none
    Generated,
    /// Entered or corrected by a user during verification
    Manual,
}

/// Import lineage for properties created from a scanned hand receipt.
///
/// Persisted as JSON text in `properties.import_metadata`; only the
/// repository layer serializes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_source: Option<SerialSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_index: Option<i64>,
    #[serde(default)]
    pub requires_verification: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_document_url: Option<String>,
}

/// A physical item of equipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub name: String,
    pub serial_number: String,
    pub description: Option<String>,
    pub nsn: Option<String>,
    pub lin: Option<String>,
    pub quantity: i64,
    pub current_status: String,
    pub condition: Option<String>,
    pub location: Option<String>,
    pub assigned_to_user_id: Option<UserId>,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_by: Option<UserId>,
    pub source_type: Option<String>,
    pub source_ref: Option<String>,
    pub source_document_url: Option<String>,
    pub import_metadata: Option<ImportMetadata>,
    /// Bumped on every write; full-row updates are conditional on it
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Property {
    pub fn is_held_by(&self, user_id: UserId) -> bool {
        self.assigned_to_user_id == Some(user_id)
    }
}

/// Input for inserting a property row
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProperty {
    pub name: String,
    pub serial_number: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nsn: Option<String>,
    #[serde(default)]
    pub lin: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub current_status: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub assigned_to_user_id: Option<UserId>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub verified_by: Option<UserId>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub source_document_url: Option<String>,
    #[serde(default)]
    pub import_metadata: Option<ImportMetadata>,
}

fn default_quantity() -> i64 {
    1
}

pub const DEFAULT_PROPERTY_STATUS: &str = "Active";

// =============================================================================
// Transfers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    /// Initiated by the current holder
    Offer,
    /// Initiated by the prospective recipient
    Request,
    /// Untyped transfers from before offers and requests existed
    Legacy,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Offer => "offer",
            TransferType::Request => "request",
            TransferType::Legacy => "legacy",
        }
    }
}

impl FromStr for TransferType {
    type Err = HandReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offer" => Ok(TransferType::Offer),
            "request" => Ok(TransferType::Request),
            "" | "legacy" => Ok(TransferType::Legacy),
            other => Err(HandReceiptError::InvalidInput(format!(
                "Unknown transfer type: {}",
                other
            ))),
        }
    }
}

text_column!(TransferType);

/// Canonical transfer lifecycle.
///
/// The legacy vocabulary (`Requested`, `Approved`, `Completed`) is folded
/// into these variants by `FromStr` and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Accepted => "accepted",
            TransferStatus::Rejected => "rejected",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }
}

impl FromStr for TransferStatus {
    type Err = HandReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "requested" => Ok(TransferStatus::Pending),
            "accepted" | "approved" | "completed" => Ok(TransferStatus::Accepted),
            "rejected" => Ok(TransferStatus::Rejected),
            "cancelled" | "canceled" => Ok(TransferStatus::Cancelled),
            other => Err(HandReceiptError::InvalidInput(format!(
                "Invalid transfer status: {}",
                other
            ))),
        }
    }
}

text_column!(TransferStatus);

/// A custody-change transaction over one property between two users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub property_id: PropertyId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub initiator_id: UserId,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub include_components: bool,
    pub requested_serial_number: Option<String>,
    pub notes: Option<String>,
    pub request_date: DateTime<Utc>,
    pub resolved_date: Option<DateTime<Utc>>,
    /// Bumped on every write; status updates are conditional on it
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn involves(&self, user_id: UserId) -> bool {
        self.from_user_id == user_id || self.to_user_id == user_id
    }

    /// Append a reason to the running notes with a ` | ` separator
    pub fn append_note(&mut self, reason: &str) {
        let reason = reason.trim();
        if reason.is_empty() {
            return;
        }
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{} | {}", existing, reason),
            _ => reason.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub property_id: PropertyId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub initiator_id: UserId,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub include_components: bool,
    pub requested_serial_number: Option<String>,
    pub notes: Option<String>,
}

/// Filters for listing transfers
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferQuery {
    /// Transfers where this user is either party
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub property_id: Option<PropertyId>,
    #[serde(default)]
    pub status: Option<TransferStatus>,
    #[serde(default)]
    pub transfer_type: Option<TransferType>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

// =============================================================================
// Broadcast offers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Active,
    Accepted,
    Expired,
    Cancelled,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferStatus::Active => "active",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Expired => "expired",
            OfferStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for OfferStatus {
    type Err = HandReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(OfferStatus::Active),
            "accepted" => Ok(OfferStatus::Accepted),
            "expired" => Ok(OfferStatus::Expired),
            "cancelled" => Ok(OfferStatus::Cancelled),
            other => Err(HandReceiptError::InvalidInput(format!(
                "Unknown offer status: {}",
                other
            ))),
        }
    }
}

text_column!(OfferStatus);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRecipient {
    pub offer_id: OfferId,
    pub recipient_user_id: UserId,
    pub viewed_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
}

/// One holder offering a property to several connected users at once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub id: OfferId,
    pub property_id: PropertyId,
    pub offering_user_id: UserId,
    pub status: OfferStatus,
    pub include_components: bool,
    pub notes: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub accepted_by_user_id: Option<UserId>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub recipients: Vec<OfferRecipient>,
}

impl TransferOffer {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| expires <= now)
    }

    pub fn has_recipient(&self, user_id: UserId) -> bool {
        self.recipients.iter().any(|r| r.recipient_user_id == user_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewTransferOffer {
    pub property_id: PropertyId,
    pub offering_user_id: UserId,
    pub recipient_ids: Vec<UserId>,
    pub include_components: bool,
    pub notes: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Components
// =============================================================================

/// Attachment edge from a parent property to one of its components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyComponent {
    pub id: i64,
    pub parent_property_id: PropertyId,
    pub component_property_id: PropertyId,
    pub attached_by_user_id: UserId,
    pub position: Option<String>,
    pub notes: Option<String>,
    pub attached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPropertyComponent {
    pub parent_property_id: PropertyId,
    pub component_property_id: PropertyId,
    pub attached_by_user_id: UserId,
    pub position: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComponentEventType {
    Attached,
    Detached,
}

impl ComponentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentEventType::Attached => "ATTACHED",
            ComponentEventType::Detached => "DETACHED",
        }
    }
}

impl FromStr for ComponentEventType {
    type Err = HandReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ATTACHED" => Ok(ComponentEventType::Attached),
            "DETACHED" => Ok(ComponentEventType::Detached),
            other => Err(HandReceiptError::InvalidInput(format!(
                "Unknown component event type: {}",
                other
            ))),
        }
    }
}

text_column!(ComponentEventType);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEvent {
    pub id: i64,
    pub event_id: String,
    pub parent_property_id: PropertyId,
    pub component_property_id: PropertyId,
    pub attaching_user_id: UserId,
    pub event_type: ComponentEventType,
    pub position: Option<String>,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewComponentEvent {
    pub parent_property_id: PropertyId,
    pub component_property_id: PropertyId,
    pub attaching_user_id: UserId,
    pub event_type: ComponentEventType,
    pub position: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComponentEventQuery {
    #[serde(default)]
    pub parent_property_id: Option<PropertyId>,
    #[serde(default)]
    pub component_property_id: Option<PropertyId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub event_type: Option<ComponentEventType>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

// =============================================================================
// Documents
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentDirection {
    Sent,
    Received,
}

impl DocumentDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentDirection::Sent => "sent",
            DocumentDirection::Received => "received",
        }
    }
}

impl FromStr for DocumentDirection {
    type Err = HandReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DocumentDirection::Sent),
            "received" => Ok(DocumentDirection::Received),
            other => Err(HandReceiptError::InvalidInput(format!(
                "Unknown document direction: {}",
                other
            ))),
        }
    }
}

text_column!(DocumentDirection);

pub const DOCUMENT_TYPE_TRANSFER_FORM: &str = "transfer_form";
pub const DOCUMENT_SUBTYPE_HAND_RECEIPT: &str = "hand_receipt";

/// A document in a user's inbox or outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub user_id: UserId,
    pub counterpart_user_id: Option<UserId>,
    pub direction: DocumentDirection,
    pub document_type: String,
    pub subtype: Option<String>,
    pub title: String,
    pub property_id: Option<PropertyId>,
    pub transfer_id: Option<TransferId>,
    pub form_number: Option<String>,
    pub storage_key: Option<String>,
    pub file_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub user_id: UserId,
    pub counterpart_user_id: Option<UserId>,
    pub direction: DocumentDirection,
    pub document_type: String,
    pub subtype: Option<String>,
    pub title: String,
    pub property_id: Option<PropertyId>,
    pub transfer_id: Option<TransferId>,
    pub form_number: Option<String>,
    pub storage_key: Option<String>,
    pub file_url: Option<String>,
}
