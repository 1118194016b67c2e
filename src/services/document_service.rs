//! Document service - each user's inbox and outbox of forms

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::models::{Document, UserId};
use crate::db::Repository;
use crate::error::{HandReceiptError, Result};
use crate::ledger::Ledger;
use crate::storage::ObjectStorage;

use super::best_effort;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentDeletion {
    pub document: Document,
    /// Whether removal of the stored file was scheduled
    pub file_cleanup: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct DocumentService {
    repo: Arc<dyn Repository>,
    ledger: Arc<dyn Ledger>,
    storage: Arc<dyn ObjectStorage>,
}

impl DocumentService {
    pub fn new(
        repo: Arc<dyn Repository>,
        ledger: Arc<dyn Ledger>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self { repo, ledger, storage }
    }

    pub fn list_for_user(&self, user_id: UserId) -> Result<Vec<Document>> {
        self.repo.list_documents_for_user(user_id)
    }

    /// A document owned by the caller
    pub fn get(&self, id: i64, acting_user_id: UserId) -> Result<Document> {
        let document = self
            .repo
            .get_document(id)?
            .ok_or_else(|| HandReceiptError::NotFound(format!("Document {} not found", id)))?;

        if document.user_id != acting_user_id {
            return Err(HandReceiptError::Unauthorized(format!(
                "Document {} belongs to another user",
                id
            )));
        }
        Ok(document)
    }

    pub async fn download(&self, id: i64, acting_user_id: UserId) -> Result<Bytes> {
        let document = self.get(id, acting_user_id)?;
        let key = document.storage_key.ok_or_else(|| {
            HandReceiptError::NotFound(format!("Document {} has no stored file", id))
        })?;
        self.storage.download_file(&key).await
    }

    /// Remove a document from the caller's box.
    ///
    /// The stored file is deleted in the background once no other document
    /// refers to it; that deletion's outcome is not reported.
    pub fn delete(&self, id: i64, acting_user_id: UserId) -> Result<DocumentDeletion> {
        let document = self.get(id, acting_user_id)?;
        if !self.repo.delete_document(id)? {
            return Err(HandReceiptError::NotFound(format!("Document {} not found", id)));
        }
        info!(document_id = id, user_id = acting_user_id, "Document deleted");

        let mut warnings = Vec::new();
        best_effort(
            &mut warnings,
            "ledger document event",
            self.ledger.log_document_event(&document, "deleted", acting_user_id),
        );

        let mut file_cleanup = false;
        if let Some(key) = document.storage_key.clone() {
            let still_referenced = best_effort(
                &mut warnings,
                "document reference count",
                self.repo.count_documents_with_storage_key(&key),
            )
            .map_or(true, |count| count > 0);

            if !still_referenced {
                file_cleanup = self.spawn_file_cleanup(key);
            }
        }

        Ok(DocumentDeletion {
            document,
            file_cleanup,
            warnings,
        })
    }

    fn spawn_file_cleanup(&self, key: String) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "No async runtime; leaving orphaned file in place");
            return false;
        };

        let storage = self.storage.clone();
        handle.spawn(async move {
            match storage.delete_file(&key).await {
                Ok(()) => debug!(key = %key, "Deleted orphaned file"),
                Err(e) => debug!(key = %key, error = %e, "Orphaned file cleanup failed"),
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{DocumentDirection, NewDocument, DOCUMENT_TYPE_TRANSFER_FORM};
    use crate::db::HandReceiptDb;
    use crate::ledger::SqliteLedger;
    use crate::storage::FileStore;
    use tempfile::TempDir;
    use tokio::time::{sleep, Duration};

    const KEY: &str = "hand-receipts/transfer_9.json";

    fn copy(user_id: UserId, direction: DocumentDirection) -> NewDocument {
        NewDocument {
            user_id,
            counterpart_user_id: None,
            direction,
            document_type: DOCUMENT_TYPE_TRANSFER_FORM.into(),
            subtype: None,
            title: "Hand Receipt".into(),
            property_id: None,
            transfer_id: Some(9),
            form_number: None,
            storage_key: Some(KEY.into()),
            file_url: None,
        }
    }

    #[tokio::test]
    async fn test_file_removed_after_last_reference() {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(HandReceiptDb::open_in_memory().unwrap());
        let storage = Arc::new(FileStore::new(temp.path()).await.unwrap());
        let service = DocumentService::new(
            db.clone(),
            Arc::new(SqliteLedger::open_in_memory().unwrap()),
            storage.clone(),
        );

        storage
            .upload_file(KEY, Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();
        let sent = db.create_document(&copy(1, DocumentDirection::Sent)).unwrap();
        let received = db.create_document(&copy(2, DocumentDirection::Received)).unwrap();

        assert!(matches!(
            service.delete(sent.id, 2).unwrap_err(),
            HandReceiptError::Unauthorized(_)
        ));

        let first = service.delete(sent.id, 1).unwrap();
        assert!(!first.file_cleanup);
        assert_eq!(&service.download(received.id, 2).await.unwrap()[..], b"{}");

        let second = service.delete(received.id, 2).unwrap();
        assert!(second.file_cleanup);

        for _ in 0..50 {
            if storage.download_file(KEY).await.is_err() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("orphaned file was not removed");
    }
}
