//! Service layer for handreceipt
//!
//! Services sit between a transport and the repository. Each one wraps
//! repository calls with:
//! - Input validation and authorization by the acting user
//! - Cross-entity orchestration (custody moves, cascades, receipts)
//! - Ledger logging and event emission, both best effort
//!
//! ## Architecture
//!
//! ```text
//! Transport (out of scope)
//!     ↓
//! Service Layer (state machine, graph, offers)
//!     ↓                    ↘
//! Repository (db/*.rs)      Ledger, ObjectStorage, ReceiptGenerator
//!     ↓
//! SQLite Database
//! ```

pub mod response;
pub mod events;
pub mod connection_service;
pub mod property_service;
pub mod component_service;
pub mod hand_receipt;
pub mod transfer_service;
pub mod offer_service;
pub mod document_service;
pub mod audit_service;

// Re-exports
pub use events::{spawn_logging_listener, EventBus, EventListener, HandReceiptEvent};
pub use connection_service::ConnectionService;
pub use property_service::{BatchStatus, PropertyService};
pub use component_service::{CascadeReport, ComponentService};
pub use hand_receipt::{HandReceiptIssuer, JsonReceiptGenerator, ReceiptGenerator};
pub use transfer_service::{TransferService, TransitionOutcome};
pub use offer_service::{OfferAcceptance, OfferService};
pub use document_service::DocumentService;
pub use audit_service::AuditService;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::db::{HandReceiptDb, Repository};
use crate::error::Result;
use crate::ledger::{Ledger, SqliteLedger};
use crate::storage::{FileStore, ObjectStorage};

/// Keep the value of a best-effort step, or log its failure and note a warning
pub(crate) fn best_effort<T>(
    warnings: &mut Vec<String>,
    step: &str,
    result: Result<T>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(step, error = %e, "Best-effort step failed");
            warnings.push(format!("{} failed: {}", step, e));
            None
        }
    }
}

/// Collaborators the services are built on
pub struct Backends {
    pub repo: Arc<dyn Repository>,
    pub ledger: Arc<dyn Ledger>,
    pub storage: Arc<dyn ObjectStorage>,
    pub generator: Arc<dyn ReceiptGenerator>,
}

/// Service container for dependency injection
///
/// Holds all services over one shared repository, ledger and event bus.
pub struct Services {
    pub connections: Arc<ConnectionService>,
    pub properties: Arc<PropertyService>,
    pub components: Arc<ComponentService>,
    pub transfers: Arc<TransferService>,
    pub offers: Arc<OfferService>,
    pub documents: Arc<DocumentService>,
    pub audit: Arc<AuditService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire every service over the given collaborators
    pub fn new(backends: Backends, config: &Config) -> Self {
        let Backends {
            repo,
            ledger,
            storage,
            generator,
        } = backends;
        let events = Arc::new(EventBus::with_capacity(config.event_bus_capacity));

        let components =
            Arc::new(ComponentService::new(repo.clone(), ledger.clone(), events.clone()));
        let receipts = config.issue_hand_receipts.then(|| {
            Arc::new(HandReceiptIssuer::new(
                repo.clone(),
                ledger.clone(),
                storage.clone(),
                generator,
                events.clone(),
                config.presigned_url_ttl(),
            ))
        });
        let transfers = Arc::new(TransferService::new(
            repo.clone(),
            ledger.clone(),
            events.clone(),
            components.clone(),
            receipts,
            config.require_connection,
        ));

        Self {
            connections: Arc::new(ConnectionService::new(repo.clone(), events.clone())),
            properties: Arc::new(PropertyService::new(
                repo.clone(),
                ledger.clone(),
                events.clone(),
            )),
            offers: Arc::new(OfferService::new(
                repo.clone(),
                events.clone(),
                transfers.clone(),
                config.default_offer_expiry_days,
            )),
            documents: Arc::new(DocumentService::new(repo, ledger.clone(), storage)),
            audit: Arc::new(AuditService::new(ledger)),
            components,
            transfers,
            events,
        }
    }

    /// Open the on-disk registry, ledger and file store named by `config`
    pub async fn open(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let repo = Arc::new(HandReceiptDb::open(&config.database_path())?);
        let ledger = Arc::new(SqliteLedger::open(&config.ledger_path())?);
        let storage = Arc::new(FileStore::new(config.files_path()).await?);

        info!(data_dir = %config.data_dir.display(), "Services ready");

        Ok(Self::new(
            Backends {
                repo,
                ledger,
                storage,
                generator: Arc::new(JsonReceiptGenerator),
            },
            config,
        ))
    }
}
