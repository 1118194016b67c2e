//! Transfer service - the custody state machine
//!
//! A transfer moves one property between two users. It is created pending by
//! either the holder (offer) or the prospective recipient (request) and
//! resolves exactly once. Acceptance moves custody; everything after the
//! custody write (component cascade, ledger entry, hand receipt) is best
//! effort and reported as warnings.
//!
//! Status writes are conditional on the transfer's version, so of two
//! concurrent transitions only one can land. The other gets `Conflict`.
//! The custody write is conditional on the holder, so two different
//! transfers of the same item cannot both be accepted; the loser is rolled
//! back to its previous status.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::db::models::{
    NewTransfer, Property, PropertyId, Transfer, TransferId, TransferQuery, TransferStatus,
    TransferType, UserId,
};
use crate::db::Repository;
use crate::error::{HandReceiptError, Result};
use crate::ledger::Ledger;

use super::best_effort;
use super::component_service::{CascadeReport, ComponentService};
use super::events::{EventBus, HandReceiptEvent};
use super::hand_receipt::{HandReceiptIssuer, ReceiptIssue};

// =============================================================================
// Request / outcome types
// =============================================================================

/// Holder offers a property to one connected user
#[derive(Debug, Clone, Deserialize)]
pub struct OfferTransferRequest {
    pub property_id: PropertyId,
    pub to_user_id: UserId,
    #[serde(default)]
    pub include_components: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Prospective recipient asks the holder of a serial number for it
#[derive(Debug, Clone, Deserialize)]
pub struct SerialTransferRequest {
    pub serial_number: String,
    #[serde(default)]
    pub include_components: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Untyped transfer created by the holder
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTransferRequest {
    pub property_id: PropertyId,
    pub to_user_id: UserId,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Side effects that follow a custody move
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcceptanceEffects {
    pub cascade: Option<CascadeReport>,
    pub receipt: Option<ReceiptIssue>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub transfer: Transfer,
    pub property: Property,
    /// False when the transfer already had the requested status
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade: Option<CascadeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<ReceiptIssue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Check whether `acting_user_id` may move `transfer` to `target`.
///
/// | type    | accept / reject | cancel                    | pending       |
/// |---------|-----------------|---------------------------|---------------|
/// | request | from (holder)   | to (requester)            | nobody        |
/// | offer   | to (recipient)  | from (holder)             | nobody        |
/// | legacy  | to              | from, while still pending | either party  |
pub fn authorize_transition(
    transfer: &Transfer,
    target: TransferStatus,
    acting_user_id: UserId,
) -> Result<()> {
    use TransferStatus::*;

    let is_from = acting_user_id == transfer.from_user_id;
    let is_to = acting_user_id == transfer.to_user_id;

    let allowed = match (transfer.transfer_type, target) {
        (TransferType::Request, Accepted | Rejected) => is_from,
        (TransferType::Request, Cancelled) => is_to,
        (TransferType::Offer, Accepted | Rejected) => is_to,
        (TransferType::Offer, Cancelled) => is_from,
        (TransferType::Request | TransferType::Offer, Pending) => false,
        (TransferType::Legacy, Accepted | Rejected) => is_to,
        (TransferType::Legacy, Cancelled) => {
            is_from && matches!(transfer.status, Pending | Cancelled)
        }
        (TransferType::Legacy, Pending) => is_from || is_to,
    };

    if allowed {
        Ok(())
    } else {
        Err(HandReceiptError::Unauthorized(format!(
            "User {} may not mark {} transfer {} as {}",
            acting_user_id, transfer.transfer_type, transfer.id, target
        )))
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct TransferService {
    repo: Arc<dyn Repository>,
    ledger: Arc<dyn Ledger>,
    events: Arc<EventBus>,
    components: Arc<ComponentService>,
    receipts: Option<Arc<HandReceiptIssuer>>,
    require_connection: bool,
}

impl TransferService {
    pub fn new(
        repo: Arc<dyn Repository>,
        ledger: Arc<dyn Ledger>,
        events: Arc<EventBus>,
        components: Arc<ComponentService>,
        receipts: Option<Arc<HandReceiptIssuer>>,
        require_connection: bool,
    ) -> Self {
        Self {
            repo,
            ledger,
            events,
            components,
            receipts,
            require_connection,
        }
    }

    pub(crate) fn get_property(&self, id: PropertyId) -> Result<Property> {
        self.repo
            .get_property(id)?
            .ok_or_else(|| HandReceiptError::NotFound(format!("Property {} not found", id)))
    }

    fn get_existing(&self, id: TransferId) -> Result<Transfer> {
        self.repo
            .get_transfer(id)?
            .ok_or_else(|| HandReceiptError::NotFound(format!("Transfer {} not found", id)))
    }

    pub(crate) fn ensure_user_exists(&self, id: UserId) -> Result<()> {
        self.repo
            .get_user(id)?
            .map(|_| ())
            .ok_or_else(|| HandReceiptError::NotFound(format!("User {} not found", id)))
    }

    /// Connection gate shared by offers and requests
    pub(crate) fn ensure_connected(&self, a: UserId, b: UserId) -> Result<()> {
        if !self.require_connection || self.repo.are_users_connected(a, b)? {
            Ok(())
        } else {
            Err(HandReceiptError::Unauthorized(
                "You can only transfer property with connected users".into(),
            ))
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// A transfer visible to one of its parties
    pub fn get_transfer(&self, id: TransferId, acting_user_id: UserId) -> Result<Transfer> {
        let transfer = self.get_existing(id)?;
        if !transfer.involves(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(format!(
                "User {} is not a party to transfer {}",
                acting_user_id, id
            )));
        }
        Ok(transfer)
    }

    /// Transfers where the caller is either party
    pub fn list_transfers(
        &self,
        acting_user_id: UserId,
        mut query: TransferQuery,
    ) -> Result<Vec<Transfer>> {
        query.user_id = Some(acting_user_id);
        self.repo.list_transfers(&query)
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Holder offers a property to a connected user
    pub fn offer_transfer(
        &self,
        acting_user_id: UserId,
        request: OfferTransferRequest,
    ) -> Result<Transfer> {
        if request.to_user_id == acting_user_id {
            return Err(HandReceiptError::InvalidInput(
                "Cannot transfer property to yourself".into(),
            ));
        }

        let property = self.get_property(request.property_id)?;
        if !property.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "You can only offer property you currently hold".into(),
            ));
        }
        self.ensure_user_exists(request.to_user_id)?;
        self.ensure_connected(acting_user_id, request.to_user_id)?;

        self.create(NewTransfer {
            property_id: property.id,
            from_user_id: acting_user_id,
            to_user_id: request.to_user_id,
            initiator_id: acting_user_id,
            transfer_type: TransferType::Offer,
            status: TransferStatus::Pending,
            include_components: request.include_components,
            requested_serial_number: None,
            notes: request.notes,
        })
    }

    /// Prospective recipient asks the current holder of a serial number
    pub fn request_by_serial(
        &self,
        acting_user_id: UserId,
        request: SerialTransferRequest,
    ) -> Result<Transfer> {
        let serial = request.serial_number.trim();
        if serial.is_empty() {
            return Err(HandReceiptError::InvalidInput("serial_number is required".into()));
        }

        let property = self.repo.get_property_by_serial(serial)?.ok_or_else(|| {
            HandReceiptError::NotFound(format!("Property with serial number {} not found", serial))
        })?;
        let holder = property.assigned_to_user_id.ok_or_else(|| {
            HandReceiptError::InvalidInput(format!(
                "Property {} is not currently assigned to anyone",
                serial
            ))
        })?;
        if holder == acting_user_id {
            return Err(HandReceiptError::InvalidInput(
                "Cannot request property you already hold".into(),
            ));
        }
        self.ensure_connected(acting_user_id, holder)?;

        self.create(NewTransfer {
            property_id: property.id,
            from_user_id: holder,
            to_user_id: acting_user_id,
            initiator_id: acting_user_id,
            transfer_type: TransferType::Request,
            status: TransferStatus::Pending,
            include_components: request.include_components,
            requested_serial_number: Some(serial.to_string()),
            notes: request.notes,
        })
    }

    /// Untyped transfer from the holder; not connection gated
    pub fn create_transfer(
        &self,
        acting_user_id: UserId,
        request: CreateTransferRequest,
    ) -> Result<Transfer> {
        if request.to_user_id == acting_user_id {
            return Err(HandReceiptError::InvalidInput(
                "Cannot transfer property to yourself".into(),
            ));
        }

        let property = self.get_property(request.property_id)?;
        if !property.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "You can only transfer property you currently hold".into(),
            ));
        }
        self.ensure_user_exists(request.to_user_id)?;

        self.create(NewTransfer {
            property_id: property.id,
            from_user_id: acting_user_id,
            to_user_id: request.to_user_id,
            initiator_id: acting_user_id,
            transfer_type: TransferType::Legacy,
            status: TransferStatus::Pending,
            include_components: false,
            requested_serial_number: None,
            notes: request.notes,
        })
    }

    pub(crate) fn create(&self, input: NewTransfer) -> Result<Transfer> {
        let transfer = self.repo.create_transfer(&input)?;

        info!(
            transfer_id = transfer.id,
            property_id = transfer.property_id,
            from = transfer.from_user_id,
            to = transfer.to_user_id,
            transfer_type = %transfer.transfer_type,
            "Transfer created"
        );
        self.events.emit(HandReceiptEvent::TransferCreated {
            transfer_id: transfer.id,
            property_id: transfer.property_id,
            from_user_id: transfer.from_user_id,
            to_user_id: transfer.to_user_id,
        });

        Ok(transfer)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Move a transfer to `status`, appending `reason` to its notes.
    ///
    /// Repeating the transfer's current status is a no-op (`applied` is
    /// false). Any other change to a resolved transfer is `Conflict`.
    pub async fn update_status(
        &self,
        transfer_id: TransferId,
        acting_user_id: UserId,
        status: &str,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let target: TransferStatus = status.parse()?;
        let transfer = self.get_existing(transfer_id)?;
        authorize_transition(&transfer, target, acting_user_id)?;

        if transfer.status == target {
            debug!(transfer_id, status = %target, "Transfer already has requested status");
            let property = self.get_property(transfer.property_id)?;
            return Ok(TransitionOutcome {
                transfer,
                property,
                applied: false,
                cascade: None,
                receipt: None,
                warnings: Vec::new(),
            });
        }
        if transfer.status.is_terminal() {
            return Err(HandReceiptError::Conflict(format!(
                "Transfer {} is already {}",
                transfer_id, transfer.status
            )));
        }

        let property = self.get_property(transfer.property_id)?;
        if target == TransferStatus::Accepted && !property.is_held_by(transfer.from_user_id) {
            return Err(HandReceiptError::Conflict(format!(
                "Property {} is no longer held by user {}",
                property.serial_number, transfer.from_user_id
            )));
        }

        let mut next = transfer.clone();
        next.status = target;
        next.resolved_date = target.is_terminal().then(Utc::now);
        if let Some(reason) = reason {
            next.append_note(reason);
        }
        let updated = self.repo.update_transfer(&next, transfer.version)?;

        info!(
            transfer_id,
            from_status = %transfer.status,
            to_status = %updated.status,
            acting_user_id,
            "Transfer status changed"
        );

        let outcome = if target == TransferStatus::Accepted {
            let property = match self.reassign(property, updated.to_user_id) {
                Ok(property) => property,
                Err(e) => {
                    self.restore(&transfer, &updated);
                    return Err(e);
                }
            };
            let effects = self.finish_acceptance(&updated, &property, acting_user_id).await;
            TransitionOutcome {
                transfer: updated,
                property,
                applied: true,
                cascade: effects.cascade,
                receipt: effects.receipt,
                warnings: effects.warnings,
            }
        } else {
            let mut warnings = Vec::new();
            best_effort(
                &mut warnings,
                "ledger transfer event",
                self.ledger
                    .log_transfer_event(&updated, &property.serial_number, acting_user_id),
            );
            TransitionOutcome {
                transfer: updated,
                property,
                applied: true,
                cascade: None,
                receipt: None,
                warnings,
            }
        };

        self.events.emit(HandReceiptEvent::TransferUpdated {
            transfer_id,
            status: outcome.transfer.status,
            from_user_id: outcome.transfer.from_user_id,
            to_user_id: outcome.transfer.to_user_id,
        });

        Ok(outcome)
    }

    /// Point a property at its new holder.
    ///
    /// The write only lands while the holder read with `property` still holds
    /// it, so two accepted transfers out of the same holder cannot both move it.
    pub(crate) fn reassign(&self, property: Property, to_user_id: UserId) -> Result<Property> {
        let previous_holder = property.assigned_to_user_id;

        match self.repo.reassign_property(property.id, previous_holder, to_user_id) {
            Ok(updated) => {
                info!(
                    property_id = updated.id,
                    serial = %updated.serial_number,
                    from = ?previous_holder,
                    to = to_user_id,
                    "Custody moved"
                );
                self.events.emit(HandReceiptEvent::PropertyUpdated { property_id: updated.id });
                Ok(updated)
            }
            Err(e) => {
                error!(property_id = property.id, error = %e, "Custody update failed");
                Err(e)
            }
        }
    }

    /// Undo an accepted status write after the custody update failed
    fn restore(&self, previous: &Transfer, accepted: &Transfer) {
        let mut restored = accepted.clone();
        restored.status = previous.status;
        restored.resolved_date = previous.resolved_date;
        restored.notes = previous.notes.clone();

        match self.repo.update_transfer(&restored, accepted.version) {
            Ok(t) => {
                warn!(transfer_id = t.id, status = %t.status, "Transfer acceptance rolled back")
            }
            Err(e) => error!(transfer_id = accepted.id, error = %e, "Transfer rollback failed"),
        }
    }

    /// Cascade, ledger entry and hand receipt for an accepted transfer
    pub(crate) async fn finish_acceptance(
        &self,
        transfer: &Transfer,
        property: &Property,
        acting_user_id: UserId,
    ) -> AcceptanceEffects {
        let mut effects = AcceptanceEffects::default();

        if transfer.include_components {
            let report = self.components.transfer_components(
                property.id,
                transfer.from_user_id,
                transfer.to_user_id,
            );
            for warning in report.warnings() {
                warn!(transfer_id = transfer.id, "{}", warning);
            }
            effects.warnings.extend(report.warnings());
            effects.cascade = Some(report);
        }

        best_effort(
            &mut effects.warnings,
            "ledger transfer event",
            self.ledger
                .log_transfer_event(transfer, &property.serial_number, acting_user_id),
        );

        if let Some(issuer) = &self.receipts {
            let component_ids = effects
                .cascade
                .as_ref()
                .map(|c| c.transferred.clone())
                .unwrap_or_default();
            let issue = issuer
                .issue(transfer, property, &component_ids, acting_user_id)
                .await;
            effects.warnings.extend(issue.warnings.iter().cloned());
            effects.receipt = Some(issue);
        }

        effects
    }
}
