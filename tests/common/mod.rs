//! Shared fixtures for the integration tests
//!
//! Builds the full service stack over an in-memory registry, a temp-dir file
//! store and either a real or a failing ledger. The registry is wrapped in
//! `FlakyRepository` so a test can make chosen property updates fail.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use handreceipt::db::models::*;
use handreceipt::ledger::{
    ChainVerification, CorrectionEvent, EntryVerification, LedgerEntry, LedgerEvent,
};
use handreceipt::services::hand_receipt::{HandReceipt, ReceiptGenerator, RenderedReceipt};
use handreceipt::services::JsonReceiptGenerator;
use handreceipt::{
    Backends, Config, FileStore, HandReceiptDb, HandReceiptError, Ledger, Repository, Services,
    SqliteLedger,
};
use tempfile::TempDir;

type Result<T> = std::result::Result<T, HandReceiptError>;

// =============================================================================
// Failing collaborators
// =============================================================================

/// Ledger whose every write fails; counts the attempts
#[derive(Default)]
pub struct FailingLedger {
    pub attempts: AtomicUsize,
}

impl FailingLedger {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Ledger for FailingLedger {
    fn append(&self, _event: LedgerEvent, _actor_id: UserId) -> Result<LedgerEntry> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(HandReceiptError::Ledger("ledger unavailable".into()))
    }

    fn get_entry(&self, _event_id: &str) -> Result<Option<LedgerEntry>> {
        Ok(None)
    }

    fn get_property_history(&self, _property_id: PropertyId) -> Result<Vec<LedgerEntry>> {
        Ok(Vec::new())
    }

    fn get_general_history(&self, _limit: u32) -> Result<Vec<LedgerEntry>> {
        Ok(Vec::new())
    }

    fn get_all_correction_events(&self) -> Result<Vec<CorrectionEvent>> {
        Ok(Vec::new())
    }

    fn get_correction_events_by_original_id(
        &self,
        _original_event_id: &str,
    ) -> Result<Vec<CorrectionEvent>> {
        Ok(Vec::new())
    }

    fn get_correction_event_by_id(&self, _event_id: &str) -> Result<Option<CorrectionEvent>> {
        Ok(None)
    }

    fn verify_entry(&self, event_id: &str) -> Result<EntryVerification> {
        Err(HandReceiptError::NotFound(format!("Ledger entry {} not found", event_id)))
    }

    fn verify_chain(&self) -> Result<ChainVerification> {
        Ok(ChainVerification {
            valid: true,
            entries_checked: 0,
            head_hash: None,
            problems: Vec::new(),
        })
    }
}

pub struct FailingGenerator;

impl ReceiptGenerator for FailingGenerator {
    fn render(&self, _receipt: &HandReceipt) -> Result<RenderedReceipt> {
        Err(HandReceiptError::Internal("renderer offline".into()))
    }
}

/// Registry wrapper that fails property writes for selected ids
pub struct FlakyRepository {
    inner: Arc<HandReceiptDb>,
    failing_updates: Mutex<HashSet<PropertyId>>,
}

impl FlakyRepository {
    pub fn new(inner: Arc<HandReceiptDb>) -> Self {
        Self {
            inner,
            failing_updates: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_updates_for(&self, property_id: PropertyId) {
        self.failing_updates.lock().unwrap().insert(property_id);
    }

    pub fn heal(&self) {
        self.failing_updates.lock().unwrap().clear();
    }

    fn check(&self, property_id: PropertyId) -> Result<()> {
        if self.failing_updates.lock().unwrap().contains(&property_id) {
            return Err(HandReceiptError::Internal(format!(
                "injected failure updating property {}",
                property_id
            )));
        }
        Ok(())
    }
}

impl Repository for FlakyRepository {
    fn create_user(&self, input: &NewUser) -> Result<User> {
        self.inner.create_user(input)
    }

    fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.inner.get_user(id)
    }

    fn create_connection(
        &self,
        requester_id: UserId,
        addressee_id: UserId,
    ) -> Result<UserConnection> {
        self.inner.create_connection(requester_id, addressee_id)
    }

    fn get_connection(&self, id: i64) -> Result<Option<UserConnection>> {
        self.inner.get_connection(id)
    }

    fn find_connection_between(&self, a: UserId, b: UserId) -> Result<Option<UserConnection>> {
        self.inner.find_connection_between(a, b)
    }

    fn update_connection_status(&self, id: i64, status: ConnectionStatus) -> Result<bool> {
        self.inner.update_connection_status(id, status)
    }

    fn are_users_connected(&self, a: UserId, b: UserId) -> Result<bool> {
        self.inner.are_users_connected(a, b)
    }

    fn get_user_connections(&self, user_id: UserId) -> Result<Vec<UserConnection>> {
        self.inner.get_user_connections(user_id)
    }

    fn get_property(&self, id: PropertyId) -> Result<Option<Property>> {
        self.inner.get_property(id)
    }

    fn get_property_by_serial(&self, serial_number: &str) -> Result<Option<Property>> {
        self.inner.get_property_by_serial(serial_number)
    }

    fn create_property(&self, input: &NewProperty) -> Result<Property> {
        self.inner.create_property(input)
    }

    fn update_property(&self, property: &Property, expected_version: i64) -> Result<Property> {
        self.check(property.id)?;
        self.inner.update_property(property, expected_version)
    }

    fn reassign_property(
        &self,
        id: PropertyId,
        from_holder: Option<UserId>,
        to_user_id: UserId,
    ) -> Result<Property> {
        self.check(id)?;
        self.inner.reassign_property(id, from_holder, to_user_id)
    }

    fn list_properties_by_user(&self, user_id: UserId) -> Result<Vec<Property>> {
        self.inner.list_properties_by_user(user_id)
    }

    fn list_unverified_properties(&self, user_id: UserId) -> Result<Vec<Property>> {
        self.inner.list_unverified_properties(user_id)
    }

    fn create_transfer(&self, input: &NewTransfer) -> Result<Transfer> {
        self.inner.create_transfer(input)
    }

    fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>> {
        self.inner.get_transfer(id)
    }

    fn update_transfer(&self, transfer: &Transfer, expected_version: i64) -> Result<Transfer> {
        self.inner.update_transfer(transfer, expected_version)
    }

    fn list_transfers(&self, query: &TransferQuery) -> Result<Vec<Transfer>> {
        self.inner.list_transfers(query)
    }

    fn create_transfer_offer(&self, input: &NewTransferOffer) -> Result<TransferOffer> {
        self.inner.create_transfer_offer(input)
    }

    fn get_transfer_offer(&self, id: OfferId) -> Result<Option<TransferOffer>> {
        self.inner.get_transfer_offer(id)
    }

    fn update_transfer_offer(
        &self,
        offer: &TransferOffer,
        expected_version: i64,
    ) -> Result<TransferOffer> {
        self.inner.update_transfer_offer(offer, expected_version)
    }

    fn list_active_offers_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransferOffer>> {
        self.inner.list_active_offers_for_user(user_id, now)
    }

    fn list_offers_by_user(&self, user_id: UserId) -> Result<Vec<TransferOffer>> {
        self.inner.list_offers_by_user(user_id)
    }

    fn mark_offer_viewed(&self, offer_id: OfferId, user_id: UserId) -> Result<()> {
        self.inner.mark_offer_viewed(offer_id, user_id)
    }

    fn create_component_link(&self, input: &NewPropertyComponent) -> Result<PropertyComponent> {
        self.inner.create_component_link(input)
    }

    fn get_parent_link(&self, component_id: PropertyId) -> Result<Option<PropertyComponent>> {
        self.inner.get_parent_link(component_id)
    }

    fn list_property_components(&self, parent_id: PropertyId) -> Result<Vec<PropertyComponent>> {
        self.inner.list_property_components(parent_id)
    }

    fn find_component_at_position(
        &self,
        parent_id: PropertyId,
        position: &str,
    ) -> Result<Option<PropertyComponent>> {
        self.inner.find_component_at_position(parent_id, position)
    }

    fn delete_component_link(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
    ) -> Result<bool> {
        self.inner.delete_component_link(parent_id, component_id)
    }

    fn update_component_position(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
        position: Option<&str>,
    ) -> Result<bool> {
        self.inner.update_component_position(parent_id, component_id, position)
    }

    fn list_available_components(
        &self,
        parent_id: PropertyId,
        user_id: UserId,
    ) -> Result<Vec<Property>> {
        self.inner.list_available_components(parent_id, user_id)
    }

    fn create_component_event(&self, input: &NewComponentEvent) -> Result<ComponentEvent> {
        self.inner.create_component_event(input)
    }

    fn list_component_events(&self, query: &ComponentEventQuery) -> Result<Vec<ComponentEvent>> {
        self.inner.list_component_events(query)
    }

    fn create_document(&self, input: &NewDocument) -> Result<Document> {
        self.inner.create_document(input)
    }

    fn get_document(&self, id: i64) -> Result<Option<Document>> {
        self.inner.get_document(id)
    }

    fn list_documents_for_user(&self, user_id: UserId) -> Result<Vec<Document>> {
        self.inner.list_documents_for_user(user_id)
    }

    fn delete_document(&self, id: i64) -> Result<bool> {
        self.inner.delete_document(id)
    }

    fn count_documents_with_storage_key(&self, key: &str) -> Result<i64> {
        self.inner.count_documents_with_storage_key(key)
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub struct Fixture {
    pub db: Arc<HandReceiptDb>,
    pub repo: Arc<FlakyRepository>,
    /// Set unless the fixture was built with a failing ledger
    pub ledger: Option<Arc<SqliteLedger>>,
    pub failing_ledger: Option<Arc<FailingLedger>>,
    pub services: Services,
    _files: TempDir,
}

#[derive(Default)]
pub struct FixtureBuilder {
    failing_ledger: bool,
    failing_generator: bool,
    without_receipts: bool,
    without_connection_gate: bool,
}

impl FixtureBuilder {
    pub fn failing_ledger(mut self) -> Self {
        self.failing_ledger = true;
        self
    }

    pub fn failing_generator(mut self) -> Self {
        self.failing_generator = true;
        self
    }

    pub fn without_receipts(mut self) -> Self {
        self.without_receipts = true;
        self
    }

    pub fn without_connection_gate(mut self) -> Self {
        self.without_connection_gate = true;
        self
    }

    pub async fn build(self) -> Fixture {
        let files = TempDir::new().unwrap();
        let db = Arc::new(HandReceiptDb::open_in_memory().unwrap());
        let repo = Arc::new(FlakyRepository::new(db.clone()));

        let mut ledger = None;
        let mut failing_ledger = None;
        let ledger_dyn: Arc<dyn Ledger> = if self.failing_ledger {
            let failing = Arc::new(FailingLedger::default());
            failing_ledger = Some(failing.clone());
            failing
        } else {
            let sqlite = Arc::new(SqliteLedger::open_in_memory().unwrap());
            ledger = Some(sqlite.clone());
            sqlite
        };

        let generator: Arc<dyn ReceiptGenerator> = if self.failing_generator {
            Arc::new(FailingGenerator)
        } else {
            Arc::new(JsonReceiptGenerator)
        };

        let mut config = Config::with_data_dir(files.path());
        config.issue_hand_receipts = !self.without_receipts;
        config.require_connection = !self.without_connection_gate;

        let services = Services::new(
            Backends {
                repo: repo.clone(),
                ledger: ledger_dyn,
                storage: Arc::new(FileStore::new(config.files_path()).await.unwrap()),
                generator,
            },
            &config,
        );

        Fixture {
            db,
            repo,
            ledger,
            failing_ledger,
            services,
            _files: files,
        }
    }
}

impl Fixture {
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder::default()
    }

    pub async fn new() -> Fixture {
        FixtureBuilder::default().build().await
    }

    pub fn user(&self, name: &str) -> UserId {
        self.db
            .create_user(&NewUser {
                name: name.into(),
                unit: Some("1st PLT".into()),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    pub fn connect(&self, a: UserId, b: UserId) {
        let link = self.db.create_connection(a, b).unwrap();
        self.db
            .update_connection_status(link.id, ConnectionStatus::Accepted)
            .unwrap();
    }

    pub fn property(&self, serial: &str, holder: Option<UserId>) -> Property {
        self.db
            .create_property(&NewProperty {
                name: format!("Item {}", serial),
                serial_number: serial.into(),
                quantity: 1,
                assigned_to_user_id: holder,
                ..Default::default()
            })
            .unwrap()
    }

    pub fn attach(&self, parent: PropertyId, component: PropertyId, holder: UserId) {
        self.services
            .components
            .attach(parent, component, holder, None, None)
            .unwrap();
    }

    pub fn holder_of(&self, property_id: PropertyId) -> Option<UserId> {
        self.db.get_property(property_id).unwrap().unwrap().assigned_to_user_id
    }

    pub fn transfer(&self, id: TransferId) -> Transfer {
        self.db.get_transfer(id).unwrap().unwrap()
    }

    /// Ledger entries of one event type for a property
    pub fn ledger_events(&self, property_id: PropertyId, event_type: &str) -> Vec<LedgerEntry> {
        self.ledger
            .as_ref()
            .expect("fixture built with a failing ledger")
            .get_property_history(property_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}
