//! Offer service - one holder broadcasting a property to several users
//!
//! The first recipient to accept wins: the offer's status write is
//! conditional on its version, so a second acceptance sees `Conflict`.
//! Acceptance produces an already-accepted offer transfer and then follows
//! the same custody path as an accepted transfer.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::db::models::{
    NewTransfer, NewTransferOffer, OfferId, OfferStatus, Property, PropertyId, Transfer,
    TransferOffer, TransferStatus, TransferType, UserId,
};
use crate::db::Repository;
use crate::error::{HandReceiptError, Result};

use super::component_service::CascadeReport;
use super::events::{EventBus, HandReceiptEvent};
use super::hand_receipt::ReceiptIssue;
use super::transfer_service::TransferService;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOfferRequest {
    pub property_id: PropertyId,
    pub recipient_ids: Vec<UserId>,
    #[serde(default)]
    pub include_components: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub expires_in_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfferAcceptance {
    pub offer: TransferOffer,
    pub transfer: Transfer,
    pub property: Property,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade: Option<CascadeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<ReceiptIssue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct OfferService {
    repo: Arc<dyn Repository>,
    events: Arc<EventBus>,
    transfers: Arc<TransferService>,
    default_expiry_days: Option<u32>,
}

impl OfferService {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<EventBus>,
        transfers: Arc<TransferService>,
        default_expiry_days: Option<u32>,
    ) -> Self {
        Self {
            repo,
            events,
            transfers,
            default_expiry_days,
        }
    }

    fn get_existing(&self, id: OfferId) -> Result<TransferOffer> {
        self.repo
            .get_transfer_offer(id)?
            .ok_or_else(|| HandReceiptError::NotFound(format!("Offer {} not found", id)))
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// An offer visible to its sender and recipients
    pub fn get_offer(&self, id: OfferId, acting_user_id: UserId) -> Result<TransferOffer> {
        let offer = self.get_existing(id)?;
        if offer.offering_user_id != acting_user_id && !offer.has_recipient(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(format!(
                "User {} cannot see offer {}",
                acting_user_id, id
            )));
        }
        Ok(offer)
    }

    /// Offers the caller has made, in any status
    pub fn list_my_offers(&self, acting_user_id: UserId) -> Result<Vec<TransferOffer>> {
        self.repo.list_offers_by_user(acting_user_id)
    }

    /// Unexpired active offers addressed to the caller; each is marked viewed
    pub fn list_active_offers(&self, acting_user_id: UserId) -> Result<Vec<TransferOffer>> {
        let now = Utc::now();
        let mut offers: Vec<TransferOffer> = self
            .repo
            .list_active_offers_for_user(acting_user_id, now)?
            .into_iter()
            .filter(|offer| !offer.is_expired_at(now))
            .collect();

        for offer in &mut offers {
            if let Err(e) = self.repo.mark_offer_viewed(offer.id, acting_user_id) {
                warn!(
                    offer_id = offer.id,
                    user_id = acting_user_id,
                    error = %e,
                    "Failed to mark offer viewed"
                );
                continue;
            }
            for recipient in &mut offer.recipients {
                if recipient.recipient_user_id == acting_user_id && recipient.viewed_at.is_none() {
                    recipient.viewed_at = Some(now);
                }
            }
        }

        debug!(user_id = acting_user_id, count = offers.len(), "Listed active offers");
        Ok(offers)
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    pub fn create_offer(
        &self,
        acting_user_id: UserId,
        request: CreateOfferRequest,
    ) -> Result<TransferOffer> {
        let recipients: BTreeSet<UserId> = request.recipient_ids.iter().copied().collect();
        if recipients.is_empty() {
            return Err(HandReceiptError::InvalidInput(
                "At least one recipient is required".into(),
            ));
        }
        if recipients.contains(&acting_user_id) {
            return Err(HandReceiptError::InvalidInput(
                "Cannot offer property to yourself".into(),
            ));
        }

        let property = self.transfers.get_property(request.property_id)?;
        if !property.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "You can only offer property you currently hold".into(),
            ));
        }
        for recipient in &recipients {
            self.transfers.ensure_user_exists(*recipient)?;
            self.transfers.ensure_connected(acting_user_id, *recipient)?;
        }

        let expires_at = match request.expires_in_days.or(self.default_expiry_days) {
            Some(0) => {
                return Err(HandReceiptError::InvalidInput(
                    "expires_in_days must be at least 1".into(),
                ))
            }
            Some(days) => Some(Utc::now() + Duration::days(i64::from(days))),
            None => None,
        };

        let offer = self.repo.create_transfer_offer(&NewTransferOffer {
            property_id: property.id,
            offering_user_id: acting_user_id,
            recipient_ids: recipients.into_iter().collect(),
            include_components: request.include_components,
            notes: request.notes,
            expires_at,
        })?;

        info!(
            offer_id = offer.id,
            property_id = offer.property_id,
            recipients = offer.recipients.len(),
            expires_at = ?offer.expires_at,
            "Offer created"
        );
        self.events.emit(HandReceiptEvent::OfferCreated {
            offer_id: offer.id,
            property_id: offer.property_id,
            recipient_ids: offer.recipients.iter().map(|r| r.recipient_user_id).collect(),
        });

        Ok(offer)
    }

    pub async fn accept_offer(
        &self,
        offer_id: OfferId,
        acting_user_id: UserId,
    ) -> Result<OfferAcceptance> {
        let offer = self.get_existing(offer_id)?;
        if !offer.has_recipient(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(format!(
                "User {} is not a recipient of offer {}",
                acting_user_id, offer_id
            )));
        }
        if offer.status != OfferStatus::Active {
            return Err(HandReceiptError::Conflict(format!(
                "Offer {} is {}",
                offer_id, offer.status
            )));
        }

        let now = Utc::now();
        if offer.is_expired_at(now) {
            let mut expired = offer.clone();
            expired.status = OfferStatus::Expired;
            if let Err(e) = self.repo.update_transfer_offer(&expired, offer.version) {
                debug!(offer_id, error = %e, "Could not mark offer expired");
            }
            return Err(HandReceiptError::Conflict(format!("Offer {} has expired", offer_id)));
        }

        let property = self.transfers.get_property(offer.property_id)?;
        if !property.is_held_by(offer.offering_user_id) {
            return Err(HandReceiptError::Conflict(format!(
                "Property {} is no longer held by the offering user",
                property.serial_number
            )));
        }

        let mut claim = offer.clone();
        claim.status = OfferStatus::Accepted;
        claim.accepted_by_user_id = Some(acting_user_id);
        claim.accepted_at = Some(now);
        let accepted = self.repo.update_transfer_offer(&claim, offer.version)?;

        let transfer = match self.transfers.create(NewTransfer {
            property_id: property.id,
            from_user_id: offer.offering_user_id,
            to_user_id: acting_user_id,
            initiator_id: offer.offering_user_id,
            transfer_type: TransferType::Offer,
            status: TransferStatus::Accepted,
            include_components: offer.include_components,
            requested_serial_number: None,
            notes: offer.notes.clone(),
        }) {
            Ok(transfer) => transfer,
            Err(e) => {
                self.reopen(&accepted);
                return Err(e);
            }
        };

        let property = match self.transfers.reassign(property, acting_user_id) {
            Ok(property) => property,
            Err(e) => {
                self.reopen(&accepted);
                self.void_transfer(&transfer);
                return Err(e);
            }
        };

        info!(offer_id, transfer_id = transfer.id, accepted_by = acting_user_id, "Offer accepted");

        let effects = self
            .transfers
            .finish_acceptance(&transfer, &property, acting_user_id)
            .await;

        self.events.emit(HandReceiptEvent::OfferAccepted {
            offer_id,
            transfer_id: transfer.id,
            accepted_by: acting_user_id,
        });

        Ok(OfferAcceptance {
            offer: accepted,
            transfer,
            property,
            cascade: effects.cascade,
            receipt: effects.receipt,
            warnings: effects.warnings,
        })
    }

    pub fn cancel_offer(&self, offer_id: OfferId, acting_user_id: UserId) -> Result<TransferOffer> {
        let offer = self.get_existing(offer_id)?;
        if offer.offering_user_id != acting_user_id {
            return Err(HandReceiptError::Unauthorized(
                "Only the offering user can cancel an offer".into(),
            ));
        }
        if offer.status != OfferStatus::Active {
            return Err(HandReceiptError::Conflict(format!(
                "Offer {} is {}",
                offer_id, offer.status
            )));
        }

        let mut cancelled = offer.clone();
        cancelled.status = OfferStatus::Cancelled;
        let cancelled = self.repo.update_transfer_offer(&cancelled, offer.version)?;

        info!(offer_id, "Offer cancelled");
        self.events.emit(HandReceiptEvent::OfferCancelled { offer_id });

        Ok(cancelled)
    }

    /// Put a claimed offer back up after the custody move failed
    fn reopen(&self, accepted: &TransferOffer) {
        let mut reopened = accepted.clone();
        reopened.status = OfferStatus::Active;
        reopened.accepted_by_user_id = None;
        reopened.accepted_at = None;

        match self.repo.update_transfer_offer(&reopened, accepted.version) {
            Ok(_) => warn!(offer_id = accepted.id, "Offer acceptance rolled back"),
            Err(e) => error!(offer_id = accepted.id, error = %e, "Offer rollback failed"),
        }
    }

    fn void_transfer(&self, transfer: &Transfer) {
        let mut voided = transfer.clone();
        voided.status = TransferStatus::Cancelled;
        voided.append_note("custody update failed");

        if let Err(e) = self.repo.update_transfer(&voided, transfer.version) {
            error!(transfer_id = transfer.id, error = %e, "Failed to void offer transfer");
        }
    }
}
