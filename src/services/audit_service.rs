//! Audit service - read side of the ledger and corrections

use std::sync::Arc;

use tracing::{info, warn};

use crate::db::models::{PropertyId, UserId};
use crate::error::{HandReceiptError, Result};
use crate::ledger::{ChainVerification, CorrectionEvent, EntryVerification, Ledger, LedgerEntry};

pub struct AuditService {
    ledger: Arc<dyn Ledger>,
}

impl AuditService {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    // =========================================================================
    // History
    // =========================================================================

    pub fn property_history(&self, property_id: PropertyId) -> Result<Vec<LedgerEntry>> {
        self.ledger.get_property_history(property_id)
    }

    /// Most recent entries first
    pub fn general_history(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        self.ledger.get_general_history(limit.clamp(1, 1000))
    }

    pub fn get_entry(&self, event_id: &str) -> Result<LedgerEntry> {
        self.ledger
            .get_entry(event_id)?
            .ok_or_else(|| {
                HandReceiptError::NotFound(format!("Ledger entry {} not found", event_id))
            })
    }

    // =========================================================================
    // Corrections
    // =========================================================================

    pub fn all_corrections(&self) -> Result<Vec<CorrectionEvent>> {
        self.ledger.get_all_correction_events()
    }

    pub fn corrections_for(&self, original_event_id: &str) -> Result<Vec<CorrectionEvent>> {
        self.ledger.get_correction_events_by_original_id(original_event_id)
    }

    pub fn get_correction(&self, event_id: &str) -> Result<CorrectionEvent> {
        self.ledger.get_correction_event_by_id(event_id)?.ok_or_else(|| {
            HandReceiptError::NotFound(format!("Correction event {} not found", event_id))
        })
    }

    /// Append a correction referencing an existing entry.
    ///
    /// A blank `original_event_type` takes the original entry's type; a
    /// non-blank one must match it.
    pub fn record_correction(
        &self,
        original_event_id: &str,
        original_event_type: &str,
        reason: &str,
        acting_user_id: UserId,
    ) -> Result<CorrectionEvent> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(HandReceiptError::InvalidInput("reason is required".into()));
        }

        let original = self.get_entry(original_event_id)?;
        let event_type = original_event_type.trim();
        if !event_type.is_empty() && event_type != original.event_type {
            return Err(HandReceiptError::InvalidInput(format!(
                "Event {} is a {} event, not {}",
                original_event_id, original.event_type, event_type
            )));
        }

        let correction = self.ledger.log_correction_event(
            &original.event_id,
            &original.event_type,
            reason,
            acting_user_id,
        )?;

        info!(
            correction_id = %correction.event_id,
            original_event_id = %correction.original_event_id,
            corrected_by = acting_user_id,
            "Correction recorded"
        );
        Ok(correction)
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check a single entry's hash and its link to the previous entry
    pub fn verify_document(&self, event_id: &str) -> Result<EntryVerification> {
        self.ledger.verify_entry(event_id)
    }

    pub fn verify_chain(&self) -> Result<ChainVerification> {
        let verification = self.ledger.verify_chain()?;
        if verification.valid {
            info!(entries = verification.entries_checked, "Ledger chain verified");
        } else {
            warn!(
                entries = verification.entries_checked,
                problems = verification.problems.len(),
                "Ledger chain verification found problems"
            );
        }
        Ok(verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerEvent, SqliteLedger};

    fn service() -> (Arc<SqliteLedger>, AuditService) {
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        (ledger.clone(), AuditService::new(ledger))
    }

    fn status_change(ledger: &SqliteLedger) -> LedgerEntry {
        ledger
            .append(
                LedgerEvent::StatusChanged {
                    property_id: 1,
                    serial_number: "SN1".into(),
                    old_status: "Active".into(),
                    new_status: "Lost".into(),
                },
                3,
            )
            .unwrap()
    }

    #[test]
    fn test_correction_references_original() {
        let (ledger, service) = service();
        let original = status_change(&ledger);

        let correction = service
            .record_correction(&original.event_id, "", "entered against wrong item", 3)
            .unwrap();
        assert_eq!(correction.original_event_type, "STATUS_CHANGED");

        let found = service.corrections_for(&original.event_id).unwrap();
        assert_eq!(found, vec![correction.clone()]);
        assert_eq!(service.get_correction(&correction.event_id).unwrap(), correction);

        // Original entry is untouched
        assert_eq!(service.get_entry(&original.event_id).unwrap(), original);
        assert!(service.verify_chain().unwrap().valid);
    }

    #[test]
    fn test_correction_validation() {
        let (ledger, service) = service();
        let original = status_change(&ledger);

        assert!(matches!(
            service.record_correction(&original.event_id, "", "  ", 3),
            Err(HandReceiptError::InvalidInput(_))
        ));
        assert!(matches!(
            service.record_correction(&original.event_id, "TRANSFER", "wrong", 3),
            Err(HandReceiptError::InvalidInput(_))
        ));
        assert!(service
            .record_correction("no-such-event", "", "wrong", 3)
            .unwrap_err()
            .is_not_found());
        assert!(service.all_corrections().unwrap().is_empty());
    }

    #[test]
    fn test_verify_document() {
        let (ledger, service) = service();
        let first = status_change(&ledger);
        let second = status_change(&ledger);

        assert!(service.verify_document(&first.event_id).unwrap().is_valid());
        assert!(service.verify_document(&second.event_id).unwrap().is_valid());
        assert!(service.verify_document("missing").unwrap_err().is_not_found());
    }
}
