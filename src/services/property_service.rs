//! Property service - registry, verification and batch import
//!
//! Wraps the property repository with validation, ledger logging and event
//! emission. Ledger failures never fail a write; they come back as warnings
//! on the outcome.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::models::{
    ImportMetadata, NewProperty, Property, PropertyId, SerialSource, UserId,
    DEFAULT_PROPERTY_STATUS,
};
use crate::db::Repository;
use crate::error::{HandReceiptError, Result};
use crate::ledger::{Ledger, LedgerEntry};

use super::best_effort;
use super::events::{EventBus, HandReceiptEvent};

/// Ledger verification type for items confirmed after a scanned import
pub const IMPORT_VERIFICATION: &str = "DA2062_VERIFICATION";

/// Ledger export type for the batch import summary entry
pub const IMPORT_EXPORT_TYPE: &str = "import";

const NSN_PATTERN: &str = r"^\d{4}-?\d{2}-?\d{3}-?\d{4}$";

fn nsn_regex() -> Result<&'static Regex> {
    static NSN: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = NSN.get() {
        return Ok(re);
    }
    let re = Regex::new(NSN_PATTERN)
        .map_err(|e| HandReceiptError::Internal(format!("Invalid NSN pattern: {}", e)))?;
    Ok(NSN.get_or_init(|| re))
}

/// Check an NSN against `XXXX-XX-XXX-XXXX`, hyphens optional
pub fn is_valid_nsn(nsn: &str) -> Result<bool> {
    Ok(nsn_regex()?.is_match(nsn.trim()))
}

/// A property write plus any best-effort failures along the way
#[derive(Debug, Clone, Serialize)]
pub struct PropertyOutcome {
    pub property: Property,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// =============================================================================
// Batch import types
// =============================================================================

/// One line item extracted from a scanned hand receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportItem {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub nsn: String,
    #[serde(default = "default_import_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub import_metadata: Option<ImportMetadata>,
}

fn default_import_quantity() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchImportRequest {
    pub items: Vec<ImportItem>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_reference: Option<String>,
}

/// Overall result of a batch: all created, some created, or none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Created,
    PartialSuccess,
    Failed,
}

impl BatchStatus {
    fn from_counts(created: usize, failed: usize) -> Self {
        match (created, failed) {
            (0, _) => BatchStatus::Failed,
            (_, 0) => BatchStatus::Created,
            _ => BatchStatus::PartialSuccess,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFailureReason {
    ValidationFailed,
    DuplicateSerial,
    CreationFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailedItem {
    pub item: ImportItem,
    pub error: String,
    pub reason: ImportFailureReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchImportResult {
    pub status: BatchStatus,
    pub items: Vec<Property>,
    pub created_count: usize,
    pub failed_count: usize,
    pub total_attempted: usize,
    pub verified_count: usize,
    pub verification_needed: Vec<Property>,
    pub failed_items: Vec<BatchFailedItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Corrections a holder may make while confirming an imported item
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyImportedRequest {
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub nsn: Option<String>,
}

// =============================================================================
// Service
// =============================================================================

pub struct PropertyService {
    repo: Arc<dyn Repository>,
    ledger: Arc<dyn Ledger>,
    events: Arc<EventBus>,
}

impl PropertyService {
    pub fn new(repo: Arc<dyn Repository>, ledger: Arc<dyn Ledger>, events: Arc<EventBus>) -> Self {
        Self { repo, ledger, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, id: PropertyId) -> Result<Property> {
        self.repo
            .get_property(id)?
            .ok_or_else(|| HandReceiptError::NotFound(format!("Property {} not found", id)))
    }

    pub fn get_by_serial(&self, serial_number: &str) -> Result<Property> {
        self.repo.get_property_by_serial(serial_number.trim())?.ok_or_else(|| {
            HandReceiptError::NotFound(format!(
                "Property with serial number {} not found",
                serial_number
            ))
        })
    }

    pub fn list_by_user(&self, user_id: UserId) -> Result<Vec<Property>> {
        self.repo.list_properties_by_user(user_id)
    }

    /// Imported items still waiting on their holder's confirmation
    pub fn list_unverified(&self, user_id: UserId) -> Result<Vec<Property>> {
        self.repo.list_unverified_properties(user_id)
    }

    /// Ledger history for the property carrying `serial_number`
    pub fn history_by_serial(&self, serial_number: &str) -> Result<Vec<LedgerEntry>> {
        let property = self.get_by_serial(serial_number)?;
        debug!(
            property_id = property.id,
            serial = %property.serial_number,
            "Reading property history"
        );
        self.ledger.get_property_history(property.id)
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Register a single property. Unassigned input is assigned to its creator.
    pub fn create(
        &self,
        mut input: NewProperty,
        acting_user_id: UserId,
    ) -> Result<PropertyOutcome> {
        input.name = input.name.trim().to_string();
        input.serial_number = input.serial_number.trim().to_string();

        if input.name.is_empty() {
            return Err(HandReceiptError::InvalidInput("name is required".into()));
        }
        if input.serial_number.is_empty() {
            return Err(HandReceiptError::InvalidInput("serial_number is required".into()));
        }
        if input.quantity <= 0 {
            return Err(HandReceiptError::InvalidInput("quantity must be greater than 0".into()));
        }
        if let Some(nsn) = input.nsn.as_deref().filter(|n| !n.trim().is_empty()) {
            if !is_valid_nsn(nsn)? {
                return Err(HandReceiptError::InvalidInput(format!(
                    "Invalid NSN format {} (expected XXXX-XX-XXX-XXXX)",
                    nsn
                )));
            }
        }

        if input.assigned_to_user_id.is_none() {
            input.assigned_to_user_id = Some(acting_user_id);
        }
        if input.verified && input.verified_by.is_none() {
            input.verified_by = Some(acting_user_id);
        }

        let property = self.repo.create_property(&input)?;
        info!(property_id = property.id, serial = %property.serial_number, "Property created");

        let mut warnings = Vec::new();
        best_effort(
            &mut warnings,
            "ledger property creation",
            self.ledger.log_property_creation(&property, acting_user_id),
        );

        self.events.emit(HandReceiptEvent::PropertyCreated {
            property_id: property.id,
            serial_number: property.serial_number.clone(),
        });

        Ok(PropertyOutcome { property, warnings })
    }

    /// Change the free-text operational status
    pub fn update_status(
        &self,
        property_id: PropertyId,
        new_status: &str,
        acting_user_id: UserId,
    ) -> Result<PropertyOutcome> {
        let new_status = new_status.trim();
        if new_status.is_empty() {
            return Err(HandReceiptError::InvalidInput("status is required".into()));
        }

        let mut property = self.get(property_id)?;
        if property.assigned_to_user_id.is_some() && !property.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "Only the current holder can change a property's status".into(),
            ));
        }

        if property.current_status == new_status {
            return Ok(PropertyOutcome { property, warnings: Vec::new() });
        }

        let old_status = std::mem::replace(&mut property.current_status, new_status.to_string());
        let property = self.repo.update_property(&property, property.version)?;

        info!(
            property_id,
            old = %old_status,
            new = %property.current_status,
            "Property status changed"
        );

        let mut warnings = Vec::new();
        best_effort(
            &mut warnings,
            "ledger status change",
            self.ledger.log_status_change(
                property.id,
                &property.serial_number,
                &old_status,
                &property.current_status,
                acting_user_id,
            ),
        );

        self.events.emit(HandReceiptEvent::PropertyUpdated { property_id });

        Ok(PropertyOutcome { property, warnings })
    }

    /// Mark a property verified with an explicit verification type
    pub fn verify_property(
        &self,
        property_id: PropertyId,
        acting_user_id: UserId,
        verification_type: &str,
    ) -> Result<PropertyOutcome> {
        let verification_type = verification_type.trim();
        if verification_type.is_empty() {
            return Err(HandReceiptError::InvalidInput("verification_type is required".into()));
        }

        let mut property = self.get(property_id)?;
        if !property.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "You can only verify your own properties".into(),
            ));
        }

        Self::mark_verified(&mut property, acting_user_id);
        self.save_verified(property, acting_user_id, verification_type)
    }

    /// Confirm an imported item, optionally fixing its serial number or NSN
    pub fn verify_imported(
        &self,
        property_id: PropertyId,
        acting_user_id: UserId,
        request: VerifyImportedRequest,
    ) -> Result<PropertyOutcome> {
        let mut property = self.get(property_id)?;
        if !property.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "You can only verify your own properties".into(),
            ));
        }

        let serial = request.serial_number.as_deref().map(str::trim);
        if let Some(serial) = serial.filter(|s| !s.is_empty()) {
            property.serial_number = serial.to_string();
            if let Some(metadata) = property.import_metadata.as_mut() {
                metadata.serial_source = Some(SerialSource::Manual);
            }
        }

        if let Some(nsn) = request.nsn.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            if !is_valid_nsn(nsn)? {
                return Err(HandReceiptError::InvalidInput(format!(
                    "Invalid NSN format {} (expected XXXX-XX-XXX-XXXX)",
                    nsn
                )));
            }
            property.nsn = Some(nsn.to_string());
        }

        Self::mark_verified(&mut property, acting_user_id);
        self.save_verified(property, acting_user_id, IMPORT_VERIFICATION)
    }

    fn mark_verified(property: &mut Property, acting_user_id: UserId) {
        property.verified = true;
        property.verified_at = Some(Utc::now());
        property.verified_by = Some(acting_user_id);
    }

    fn save_verified(
        &self,
        property: Property,
        acting_user_id: UserId,
        verification_type: &str,
    ) -> Result<PropertyOutcome> {
        let property = self.repo.update_property(&property, property.version)?;
        info!(
            property_id = property.id,
            serial = %property.serial_number,
            verification_type,
            "Property verified"
        );

        let mut warnings = Vec::new();
        best_effort(
            &mut warnings,
            "ledger verification",
            self.ledger.log_verification_event(
                property.id,
                &property.serial_number,
                acting_user_id,
                verification_type,
            ),
        );

        self.events.emit(HandReceiptEvent::PropertyUpdated { property_id: property.id });

        Ok(PropertyOutcome { property, warnings })
    }

    // =========================================================================
    // Batch Import
    // =========================================================================

    /// Validate an import line item; `Ok(Some(reason))` means it is rejected
    pub fn validate_import_item(item: &ImportItem) -> Result<Option<String>> {
        if item.name.trim().is_empty() && item.description.trim().is_empty() {
            return Ok(Some("Item name or description is required".into()));
        }
        if item.serial_number.trim().is_empty() {
            return Ok(Some("Serial number is required and cannot be empty".into()));
        }
        if item.quantity <= 0 {
            return Ok(Some("Quantity must be greater than 0".into()));
        }
        let nsn = item.nsn.trim();
        if !nsn.is_empty() && !is_valid_nsn(nsn)? {
            return Ok(Some("Invalid NSN format (should be XXXX-XX-XXX-XXXX)".into()));
        }
        Ok(None)
    }

    /// Create every valid item for the importer, itemizing each failure
    pub fn batch_import(
        &self,
        request: BatchImportRequest,
        acting_user_id: UserId,
    ) -> Result<BatchImportResult> {
        let total_attempted = request.items.len();
        let mut created: Vec<Property> = Vec::new();
        let mut failed_items = Vec::new();
        let mut warnings = Vec::new();

        for item in request.items {
            if let Some(error) = Self::validate_import_item(&item)? {
                failed_items.push(BatchFailedItem {
                    item,
                    error,
                    reason: ImportFailureReason::ValidationFailed,
                });
                continue;
            }

            let input =
                Self::import_item_to_property(&item, request.source.as_deref(), acting_user_id);
            match self.repo.create_property(&input) {
                Ok(property) => {
                    best_effort(
                        &mut warnings,
                        "ledger property creation",
                        self.ledger.log_property_creation(&property, acting_user_id),
                    );
                    created.push(property);
                }
                Err(HandReceiptError::DuplicateSerial(serial)) => {
                    warn!(serial = %serial, "Import item has a duplicate serial number");
                    failed_items.push(BatchFailedItem {
                        item,
                        error: format!("Property with serial number '{}' already exists", serial),
                        reason: ImportFailureReason::DuplicateSerial,
                    });
                }
                Err(e) => {
                    warn!(
                        serial = %input.serial_number,
                        error = %e,
                        "Failed to create imported property"
                    );
                    failed_items.push(BatchFailedItem {
                        item,
                        error: e.to_string(),
                        reason: ImportFailureReason::CreationFailed,
                    });
                }
            }
        }

        if !created.is_empty() {
            let ids: Vec<PropertyId> = created.iter().map(|p| p.id).collect();
            best_effort(
                &mut warnings,
                "ledger import summary",
                self.ledger.log_hand_receipt_export(
                    IMPORT_EXPORT_TYPE,
                    request.source_reference.as_deref(),
                    None,
                    &ids,
                    acting_user_id,
                ),
            );
            self.events.emit(HandReceiptEvent::PropertiesImported {
                user_id: acting_user_id,
                count: created.len(),
            });
        }

        let (verification_needed, verified): (Vec<Property>, Vec<Property>) =
            created.iter().cloned().partition(|p| !p.verified);

        let status = BatchStatus::from_counts(created.len(), failed_items.len());
        info!(
            user_id = acting_user_id,
            created = created.len(),
            failed = failed_items.len(),
            status = ?status,
            "Batch import finished"
        );

        Ok(BatchImportResult {
            status,
            created_count: created.len(),
            failed_count: failed_items.len(),
            total_attempted,
            verified_count: verified.len(),
            verification_needed,
            items: created,
            failed_items,
            warnings,
        })
    }

    fn import_item_to_property(
        item: &ImportItem,
        source: Option<&str>,
        importer: UserId,
    ) -> NewProperty {
        let name = if item.name.trim().is_empty() {
            item.description.trim()
        } else {
            item.name.trim()
        };
        let requires_verification = item
            .import_metadata
            .as_ref()
            .map_or(false, |m| m.requires_verification);
        let non_blank = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());

        NewProperty {
            name: name.to_string(),
            serial_number: item.serial_number.trim().to_string(),
            description: non_blank(&item.description),
            nsn: non_blank(&item.nsn),
            lin: None,
            quantity: item.quantity,
            current_status: Some(DEFAULT_PROPERTY_STATUS.to_string()),
            condition: None,
            location: None,
            assigned_to_user_id: Some(importer),
            verified: !requires_verification,
            verified_by: (!requires_verification).then_some(importer),
            source_type: source.and_then(non_blank),
            source_ref: item.source_ref.as_deref().and_then(non_blank),
            source_document_url: item
                .import_metadata
                .as_ref()
                .and_then(|m| m.source_document_url.clone()),
            import_metadata: item.import_metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewUser;
    use crate::db::HandReceiptDb;
    use crate::ledger::SqliteLedger;

    struct Fixture {
        service: PropertyService,
        ledger: Arc<SqliteLedger>,
        user: UserId,
        other: UserId,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(HandReceiptDb::open_in_memory().unwrap());
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let user = |name: &str| {
            db.create_user(&NewUser { name: name.into(), ..Default::default() })
                .unwrap()
                .id
        };
        let (user, other) = (user("SGT Holder"), user("SPC Other"));
        let service = PropertyService::new(db, ledger.clone(), Arc::new(EventBus::new()));
        Fixture { service, ledger, user, other }
    }

    fn new_property(name: &str, serial: &str) -> NewProperty {
        NewProperty {
            name: name.into(),
            serial_number: serial.into(),
            quantity: 1,
            ..Default::default()
        }
    }

    fn batch(items: Vec<ImportItem>) -> BatchImportRequest {
        BatchImportRequest { items, source: None, source_reference: None }
    }

    fn item(name: &str, serial: &str) -> ImportItem {
        ImportItem {
            name: name.into(),
            description: String::new(),
            serial_number: serial.into(),
            nsn: String::new(),
            quantity: 1,
            unit: None,
            category: None,
            source_ref: None,
            import_metadata: None,
        }
    }

    #[test]
    fn test_nsn_format() {
        assert!(is_valid_nsn("1005-01-231-0973").unwrap());
        assert!(is_valid_nsn("1005012310973").unwrap());
        assert!(!is_valid_nsn("1005-01-231").unwrap());
        assert!(!is_valid_nsn("ABCD-01-231-0973").unwrap());
    }

    #[test]
    fn test_create_assigns_creator_and_logs() {
        let f = fixture();
        let outcome = f
            .service
            .create(
                new_property("M4 Carbine", " W123 "),
                f.user,
            )
            .unwrap();

        assert_eq!(outcome.property.serial_number, "W123");
        assert!(outcome.property.is_held_by(f.user));
        assert!(outcome.warnings.is_empty());
        assert_eq!(f.ledger.get_property_history(outcome.property.id).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_serial_is_distinguishable() {
        let f = fixture();
        let input = new_property("Radio", "R1");
        f.service.create(input.clone(), f.user).unwrap();

        let err = f.service.create(input, f.user).unwrap_err();
        assert!(matches!(err, HandReceiptError::DuplicateSerial(ref s) if s == "R1"));
        assert_eq!(f.service.list_by_user(f.user).unwrap().len(), 1);
    }

    #[test]
    fn test_update_status_requires_holder() {
        let f = fixture();
        let property = f
            .service
            .create(new_property("NVG", "N1"), f.user)
            .unwrap()
            .property;

        let err = f.service.update_status(property.id, "Under Maintenance", f.other).unwrap_err();
        assert!(matches!(err, HandReceiptError::Unauthorized(_)));

        let updated = f.service.update_status(property.id, "Under Maintenance", f.user).unwrap();
        assert_eq!(updated.property.current_status, "Under Maintenance");
        assert_eq!(f.ledger.get_property_history(property.id).unwrap().len(), 2);
    }

    #[test]
    fn test_batch_import_itemizes_failures() {
        let f = fixture();
        f.service
            .create(new_property("Existing", "DUP"), f.user)
            .unwrap();

        let mut bad_nsn = item("Compass", "C1");
        bad_nsn.nsn = "12-34".into();
        let mut needs_check = item("Binoculars", "B1");
        needs_check.import_metadata = Some(ImportMetadata {
            requires_verification: true,
            verification_reasons: vec!["low confidence".into()],
            ..Default::default()
        });

        let result = f
            .service
            .batch_import(
                BatchImportRequest {
                    items: vec![
                        item("Rifle", "R1"),
                        item("", "X1"),
                        item("Dup", "DUP"),
                        bad_nsn,
                        needs_check,
                    ],
                    source: Some("da2062_scan".into()),
                    source_reference: Some("HR-0001".into()),
                },
                f.user,
            )
            .unwrap();

        assert_eq!(result.status, BatchStatus::PartialSuccess);
        assert_eq!(result.total_attempted, 5);
        assert_eq!(result.created_count, 2);
        assert_eq!(result.failed_count, 3);
        assert_eq!(result.verified_count, 1);
        assert_eq!(result.verification_needed.len(), 1);

        let reasons: Vec<_> = result.failed_items.iter().map(|f| f.reason).collect();
        assert_eq!(
            reasons,
            vec![
                ImportFailureReason::ValidationFailed,
                ImportFailureReason::DuplicateSerial,
                ImportFailureReason::ValidationFailed,
            ]
        );
    }

    #[test]
    fn test_batch_import_all_failed() {
        let f = fixture();
        let result = f
            .service
            .batch_import(batch(vec![item("Blank", "  ")]), f.user)
            .unwrap();
        assert_eq!(result.status, BatchStatus::Failed);
        assert!(result.items.is_empty());
    }

    #[test]
    fn test_verify_imported_fixes_serial() {
        let f = fixture();
        let mut scanned = item("Tripod", "GEN-0001");
        scanned.import_metadata = Some(ImportMetadata {
            serial_source: Some(SerialSource::Generated),
            requires_verification: true,
            ..Default::default()
        });
        let created = f
            .service
            .batch_import(batch(vec![scanned]), f.user)
            .unwrap();
        let id = created.items[0].id;
        assert_eq!(f.service.list_unverified(f.user).unwrap().len(), 1);

        let err = f
            .service
            .verify_imported(id, f.other, VerifyImportedRequest::default())
            .unwrap_err();
        assert!(matches!(err, HandReceiptError::Unauthorized(_)));

        let verified = f
            .service
            .verify_imported(
                id,
                f.user,
                VerifyImportedRequest {
                    serial_number: Some("TP-778".into()),
                    nsn: Some("1005-01-231-0973".into()),
                },
            )
            .unwrap()
            .property;

        assert!(verified.verified);
        assert_eq!(verified.serial_number, "TP-778");
        assert_eq!(
            verified.import_metadata.unwrap().serial_source,
            Some(SerialSource::Manual)
        );
        assert!(f.service.list_unverified(f.user).unwrap().is_empty());
        assert_eq!(f.service.history_by_serial("TP-778").unwrap().len(), 2);
    }
}
