//! Hand receipt issuance after an accepted transfer
//!
//! Rendering is a collaborator behind [`ReceiptGenerator`]; this module only
//! gathers what goes on the form, stores the rendered bytes and files a copy
//! in each party's documents. Nothing here can fail a transfer: every step
//! that goes wrong becomes a warning.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::models::{
    Document, DocumentDirection, NewDocument, Property, PropertyId, Transfer, TransferId, User,
    UserId, DOCUMENT_SUBTYPE_HAND_RECEIPT, DOCUMENT_TYPE_TRANSFER_FORM,
};
use crate::db::Repository;
use crate::error::{HandReceiptError, Result};
use crate::ledger::Ledger;
use crate::storage::ObjectStorage;

use super::best_effort;
use super::events::{EventBus, HandReceiptEvent};

/// Ledger export type for receipts issued on transfer
pub const TRANSFER_EXPORT_TYPE: &str = "transfer";

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptParty {
    pub user_id: UserId,
    pub name: String,
    pub rank: Option<String>,
    pub unit: Option<String>,
}

impl From<&User> for ReceiptParty {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            name: user.name.clone(),
            rank: user.rank.clone(),
            unit: user.unit.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptLine {
    pub property_id: PropertyId,
    pub name: String,
    pub serial_number: String,
    pub nsn: Option<String>,
    pub lin: Option<String>,
    pub quantity: i64,
    pub condition: Option<String>,
    pub is_component: bool,
}

impl ReceiptLine {
    fn new(property: &Property, is_component: bool) -> Self {
        Self {
            property_id: property.id,
            name: property.name.clone(),
            serial_number: property.serial_number.clone(),
            nsn: property.nsn.clone(),
            lin: property.lin.clone(),
            quantity: property.quantity,
            condition: property.condition.clone(),
            is_component,
        }
    }
}

/// Everything printed on a hand receipt
#[derive(Debug, Clone, Serialize)]
pub struct HandReceipt {
    pub form_number: String,
    pub transfer_id: TransferId,
    pub issued_at: DateTime<Utc>,
    pub from: ReceiptParty,
    pub to: ReceiptParty,
    pub unit_name: Option<String>,
    pub lines: Vec<ReceiptLine>,
}

impl HandReceipt {
    pub fn property_ids(&self) -> Vec<PropertyId> {
        self.lines.iter().map(|l| l.property_id).collect()
    }
}

pub struct RenderedReceipt {
    pub data: Bytes,
    pub content_type: String,
    pub extension: String,
}

/// Turns a receipt into a storable file (PDF, HTML, ...)
pub trait ReceiptGenerator: Send + Sync {
    fn render(&self, receipt: &HandReceipt) -> Result<RenderedReceipt>;
}

/// Renders the receipt as a JSON manifest
pub struct JsonReceiptGenerator;

impl ReceiptGenerator for JsonReceiptGenerator {
    fn render(&self, receipt: &HandReceipt) -> Result<RenderedReceipt> {
        Ok(RenderedReceipt {
            data: Bytes::from(serde_json::to_vec_pretty(receipt)?),
            content_type: "application/json".to_string(),
            extension: "json".to_string(),
        })
    }
}

pub fn form_number(transfer: &Transfer, issued_at: DateTime<Utc>) -> String {
    format!("HR-{}-{}", issued_at.format("%Y%m%d"), transfer.id)
}

pub fn storage_key(transfer_id: TransferId, extension: &str) -> String {
    format!("hand-receipts/transfer_{}.{}", transfer_id, extension)
}

/// Result of issuing a receipt; partial when `warnings` is not empty
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiptIssue {
    pub form_number: Option<String>,
    pub storage_key: Option<String>,
    pub file_url: Option<String>,
    pub documents: Vec<Document>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct HandReceiptIssuer {
    repo: Arc<dyn Repository>,
    ledger: Arc<dyn Ledger>,
    storage: Arc<dyn ObjectStorage>,
    generator: Arc<dyn ReceiptGenerator>,
    events: Arc<EventBus>,
    url_ttl: Duration,
}

impl HandReceiptIssuer {
    pub fn new(
        repo: Arc<dyn Repository>,
        ledger: Arc<dyn Ledger>,
        storage: Arc<dyn ObjectStorage>,
        generator: Arc<dyn ReceiptGenerator>,
        events: Arc<EventBus>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            repo,
            ledger,
            storage,
            generator,
            events,
            url_ttl,
        }
    }

    fn user(&self, id: UserId) -> Result<User> {
        self.repo
            .get_user(id)?
            .ok_or_else(|| HandReceiptError::NotFound(format!("User {} not found", id)))
    }

    /// Assemble the receipt for an accepted transfer
    pub fn build_receipt(
        &self,
        transfer: &Transfer,
        property: &Property,
        component_ids: &[PropertyId],
        warnings: &mut Vec<String>,
    ) -> Result<HandReceipt> {
        let from = self.user(transfer.from_user_id)?;
        let to = self.user(transfer.to_user_id)?;

        let mut lines = vec![ReceiptLine::new(property, false)];
        for id in component_ids {
            let component = self.repo.get_property(*id).and_then(|p| {
                p.ok_or_else(|| HandReceiptError::NotFound(format!("Property {} not found", id)))
            });
            if let Some(component) = best_effort(warnings, "receipt component lookup", component) {
                lines.push(ReceiptLine::new(&component, true));
            }
        }

        let issued_at = Utc::now();
        Ok(HandReceipt {
            form_number: form_number(transfer, issued_at),
            transfer_id: transfer.id,
            issued_at,
            unit_name: from.unit.clone(),
            from: ReceiptParty::from(&from),
            to: ReceiptParty::from(&to),
            lines,
        })
    }

    /// Render, store and file a hand receipt for an accepted transfer
    pub async fn issue(
        &self,
        transfer: &Transfer,
        property: &Property,
        component_ids: &[PropertyId],
        acting_user_id: UserId,
    ) -> ReceiptIssue {
        let mut issue = ReceiptIssue::default();

        let built = self.build_receipt(transfer, property, component_ids, &mut issue.warnings);
        let Some(receipt) = best_effort(&mut issue.warnings, "hand receipt assembly", built) else {
            return issue;
        };
        issue.form_number = Some(receipt.form_number.clone());

        let rendered = self.generator.render(&receipt);
        let Some(rendered) =
            best_effort(&mut issue.warnings, "hand receipt rendering", rendered)
        else {
            return issue;
        };

        let key = storage_key(transfer.id, &rendered.extension);
        let uploaded = self
            .storage
            .upload_file(&key, rendered.data, &rendered.content_type)
            .await;
        if best_effort(&mut issue.warnings, "hand receipt upload", uploaded).is_none() {
            return issue;
        }
        issue.storage_key = Some(key.clone());

        let url = self.storage.get_presigned_url(&key, self.url_ttl).await;
        issue.file_url = best_effort(&mut issue.warnings, "hand receipt url", url);

        let title = format!("Hand Receipt {} - {}", receipt.form_number, property.name);
        for (owner, counterpart, direction) in [
            (transfer.from_user_id, transfer.to_user_id, DocumentDirection::Sent),
            (transfer.to_user_id, transfer.from_user_id, DocumentDirection::Received),
        ] {
            let created = self.repo.create_document(&NewDocument {
                user_id: owner,
                counterpart_user_id: Some(counterpart),
                direction,
                document_type: DOCUMENT_TYPE_TRANSFER_FORM.to_string(),
                subtype: Some(DOCUMENT_SUBTYPE_HAND_RECEIPT.to_string()),
                title: title.clone(),
                property_id: Some(property.id),
                transfer_id: Some(transfer.id),
                form_number: Some(receipt.form_number.clone()),
                storage_key: Some(key.clone()),
                file_url: issue.file_url.clone(),
            });
            let Some(document) =
                best_effort(&mut issue.warnings, "hand receipt document", created)
            else {
                continue;
            };
            debug!(
                document_id = document.id,
                user_id = owner,
                direction = %direction,
                "Filed hand receipt"
            );

            best_effort(
                &mut issue.warnings,
                "ledger document event",
                self.ledger.log_document_event(&document, "created", acting_user_id),
            );
            if direction == DocumentDirection::Received {
                self.events.emit(HandReceiptEvent::DocumentReceived {
                    document_id: document.id,
                    user_id: owner,
                });
            }
            issue.documents.push(document);
        }

        best_effort(
            &mut issue.warnings,
            "ledger hand receipt export",
            self.ledger.log_hand_receipt_export(
                TRANSFER_EXPORT_TYPE,
                Some(&receipt.form_number),
                Some(transfer.id),
                &receipt.property_ids(),
                acting_user_id,
            ),
        );

        info!(
            transfer_id = transfer.id,
            form_number = %receipt.form_number,
            documents = issue.documents.len(),
            "Hand receipt issued"
        );

        issue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewProperty, NewTransfer, NewUser, TransferStatus, TransferType};
    use crate::db::HandReceiptDb;
    use crate::ledger::SqliteLedger;
    use crate::storage::FileStore;
    use tempfile::TempDir;

    struct BrokenGenerator;

    impl ReceiptGenerator for BrokenGenerator {
        fn render(&self, _receipt: &HandReceipt) -> Result<RenderedReceipt> {
            Err(HandReceiptError::Internal("template missing".into()))
        }
    }

    async fn setup(
        generator: Arc<dyn ReceiptGenerator>,
    ) -> (TempDir, Arc<HandReceiptDb>, HandReceiptIssuer, Transfer, Property) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(HandReceiptDb::open_in_memory().unwrap());
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let storage = Arc::new(FileStore::new(temp.path()).await.unwrap());

        let from = db
            .create_user(&NewUser {
                name: "Alice".into(),
                unit: Some("A Co".into()),
                ..Default::default()
            })
            .unwrap();
        let to = db.create_user(&NewUser { name: "Bob".into(), ..Default::default() }).unwrap();
        let property = db
            .create_property(&NewProperty {
                name: "M4 Carbine".into(),
                serial_number: "ABC123".into(),
                quantity: 1,
                assigned_to_user_id: Some(to.id),
                ..Default::default()
            })
            .unwrap();
        let transfer = db
            .create_transfer(&NewTransfer {
                property_id: property.id,
                from_user_id: from.id,
                to_user_id: to.id,
                initiator_id: from.id,
                transfer_type: TransferType::Offer,
                status: TransferStatus::Accepted,
                include_components: false,
                requested_serial_number: None,
                notes: None,
            })
            .unwrap();

        let issuer = HandReceiptIssuer::new(
            db.clone(),
            ledger,
            storage,
            generator,
            Arc::new(EventBus::new()),
            Duration::from_secs(60),
        );
        (temp, db, issuer, transfer, property)
    }

    #[tokio::test]
    async fn test_issue_files_both_copies() {
        let (_temp, db, issuer, transfer, property) = setup(Arc::new(JsonReceiptGenerator)).await;

        let issue = issuer.issue(&transfer, &property, &[], transfer.from_user_id).await;
        assert!(issue.warnings.is_empty(), "{:?}", issue.warnings);
        assert_eq!(issue.documents.len(), 2);
        assert_eq!(issue.storage_key.as_deref(), Some(storage_key(transfer.id, "json").as_str()));
        assert!(issue.file_url.is_some());

        let received = db.list_documents_for_user(transfer.to_user_id).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].direction, DocumentDirection::Received);
        assert_eq!(received[0].subtype.as_deref(), Some(DOCUMENT_SUBTYPE_HAND_RECEIPT));
    }

    #[tokio::test]
    async fn test_render_failure_is_a_warning() {
        let (_temp, db, issuer, transfer, property) = setup(Arc::new(BrokenGenerator)).await;

        let issue = issuer.issue(&transfer, &property, &[], transfer.from_user_id).await;
        assert_eq!(issue.warnings.len(), 1);
        assert!(issue.form_number.is_some());
        assert!(issue.documents.is_empty());
        assert!(db.list_documents_for_user(transfer.to_user_id).unwrap().is_empty());
    }
}
