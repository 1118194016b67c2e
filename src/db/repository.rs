//! Persistence seam used by the service layer
//!
//! `HandReceiptDb` is the production implementation. Services hold an
//! `Arc<dyn Repository>` so a test can wrap the real database and make
//! selected writes fail. Lookups return `Option` so a missing row is never
//! confused with a database error.

use chrono::{DateTime, Utc};

use crate::error::HandReceiptError;

use super::models::*;
use super::{components, connections, documents, offers, properties, transfers, HandReceiptDb};

type Result<T> = std::result::Result<T, HandReceiptError>;

pub trait Repository: Send + Sync {
    // Users and connections
    fn create_user(&self, input: &NewUser) -> Result<User>;
    fn get_user(&self, id: UserId) -> Result<Option<User>>;
    fn create_connection(
        &self,
        requester_id: UserId,
        addressee_id: UserId,
    ) -> Result<UserConnection>;
    fn get_connection(&self, id: i64) -> Result<Option<UserConnection>>;
    fn find_connection_between(&self, a: UserId, b: UserId) -> Result<Option<UserConnection>>;
    fn update_connection_status(&self, id: i64, status: ConnectionStatus) -> Result<bool>;
    fn are_users_connected(&self, a: UserId, b: UserId) -> Result<bool>;
    fn get_user_connections(&self, user_id: UserId) -> Result<Vec<UserConnection>>;

    // Properties
    fn get_property(&self, id: PropertyId) -> Result<Option<Property>>;
    fn get_property_by_serial(&self, serial_number: &str) -> Result<Option<Property>>;
    fn create_property(&self, input: &NewProperty) -> Result<Property>;
    fn update_property(&self, property: &Property, expected_version: i64) -> Result<Property>;
    fn reassign_property(
        &self,
        id: PropertyId,
        from_holder: Option<UserId>,
        to_user_id: UserId,
    ) -> Result<Property>;
    fn list_properties_by_user(&self, user_id: UserId) -> Result<Vec<Property>>;
    fn list_unverified_properties(&self, user_id: UserId) -> Result<Vec<Property>>;

    // Transfers
    fn create_transfer(&self, input: &NewTransfer) -> Result<Transfer>;
    fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>>;
    fn update_transfer(&self, transfer: &Transfer, expected_version: i64) -> Result<Transfer>;
    fn list_transfers(&self, query: &TransferQuery) -> Result<Vec<Transfer>>;

    // Broadcast offers
    fn create_transfer_offer(&self, input: &NewTransferOffer) -> Result<TransferOffer>;
    fn get_transfer_offer(&self, id: OfferId) -> Result<Option<TransferOffer>>;
    fn update_transfer_offer(
        &self,
        offer: &TransferOffer,
        expected_version: i64,
    ) -> Result<TransferOffer>;
    fn list_active_offers_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransferOffer>>;
    fn list_offers_by_user(&self, user_id: UserId) -> Result<Vec<TransferOffer>>;
    fn mark_offer_viewed(&self, offer_id: OfferId, user_id: UserId) -> Result<()>;

    // Components
    fn create_component_link(&self, input: &NewPropertyComponent) -> Result<PropertyComponent>;
    fn get_parent_link(&self, component_id: PropertyId) -> Result<Option<PropertyComponent>>;
    fn list_property_components(&self, parent_id: PropertyId) -> Result<Vec<PropertyComponent>>;
    fn find_component_at_position(
        &self,
        parent_id: PropertyId,
        position: &str,
    ) -> Result<Option<PropertyComponent>>;
    fn delete_component_link(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
    ) -> Result<bool>;
    fn update_component_position(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
        position: Option<&str>,
    ) -> Result<bool>;
    fn list_available_components(
        &self,
        parent_id: PropertyId,
        user_id: UserId,
    ) -> Result<Vec<Property>>;
    fn create_component_event(&self, input: &NewComponentEvent) -> Result<ComponentEvent>;
    fn list_component_events(&self, query: &ComponentEventQuery) -> Result<Vec<ComponentEvent>>;

    // Documents
    fn create_document(&self, input: &NewDocument) -> Result<Document>;
    fn get_document(&self, id: i64) -> Result<Option<Document>>;
    fn list_documents_for_user(&self, user_id: UserId) -> Result<Vec<Document>>;
    fn delete_document(&self, id: i64) -> Result<bool>;
    fn count_documents_with_storage_key(&self, key: &str) -> Result<i64>;
}

impl Repository for HandReceiptDb {
    fn create_user(&self, input: &NewUser) -> Result<User> {
        self.with_conn(|conn| connections::create_user(conn, input))
    }

    fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.with_conn(|conn| connections::get_user(conn, id))
    }

    fn create_connection(
        &self,
        requester_id: UserId,
        addressee_id: UserId,
    ) -> Result<UserConnection> {
        self.with_conn(|conn| connections::create_connection(conn, requester_id, addressee_id))
    }

    fn get_connection(&self, id: i64) -> Result<Option<UserConnection>> {
        self.with_conn(|conn| connections::get_connection(conn, id))
    }

    fn find_connection_between(&self, a: UserId, b: UserId) -> Result<Option<UserConnection>> {
        self.with_conn(|conn| connections::find_connection_between(conn, a, b))
    }

    fn update_connection_status(&self, id: i64, status: ConnectionStatus) -> Result<bool> {
        self.with_conn(|conn| connections::update_connection_status(conn, id, status))
    }

    fn are_users_connected(&self, a: UserId, b: UserId) -> Result<bool> {
        self.with_conn(|conn| connections::are_users_connected(conn, a, b))
    }

    fn get_user_connections(&self, user_id: UserId) -> Result<Vec<UserConnection>> {
        self.with_conn(|conn| connections::get_user_connections(conn, user_id))
    }

    fn get_property(&self, id: PropertyId) -> Result<Option<Property>> {
        self.with_conn(|conn| properties::get_property(conn, id))
    }

    fn get_property_by_serial(&self, serial_number: &str) -> Result<Option<Property>> {
        self.with_conn(|conn| properties::get_property_by_serial(conn, serial_number))
    }

    fn create_property(&self, input: &NewProperty) -> Result<Property> {
        self.with_conn(|conn| properties::create_property(conn, input))
    }

    fn update_property(&self, property: &Property, expected_version: i64) -> Result<Property> {
        self.with_conn(|conn| properties::update_property(conn, property, expected_version))
    }

    fn reassign_property(
        &self,
        id: PropertyId,
        from_holder: Option<UserId>,
        to_user_id: UserId,
    ) -> Result<Property> {
        self.with_conn(|conn| properties::reassign_property(conn, id, from_holder, to_user_id))
    }

    fn list_properties_by_user(&self, user_id: UserId) -> Result<Vec<Property>> {
        self.with_conn(|conn| properties::list_properties_by_user(conn, user_id))
    }

    fn list_unverified_properties(&self, user_id: UserId) -> Result<Vec<Property>> {
        self.with_conn(|conn| properties::list_unverified_properties(conn, user_id))
    }

    fn create_transfer(&self, input: &NewTransfer) -> Result<Transfer> {
        self.with_conn(|conn| transfers::create_transfer(conn, input))
    }

    fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>> {
        self.with_conn(|conn| transfers::get_transfer(conn, id))
    }

    fn update_transfer(&self, transfer: &Transfer, expected_version: i64) -> Result<Transfer> {
        self.with_conn(|conn| transfers::update_transfer(conn, transfer, expected_version))
    }

    fn list_transfers(&self, query: &TransferQuery) -> Result<Vec<Transfer>> {
        self.with_conn(|conn| transfers::list_transfers(conn, query))
    }

    fn create_transfer_offer(&self, input: &NewTransferOffer) -> Result<TransferOffer> {
        self.with_conn_mut(|conn| offers::create_transfer_offer(conn, input))
    }

    fn get_transfer_offer(&self, id: OfferId) -> Result<Option<TransferOffer>> {
        self.with_conn(|conn| offers::get_transfer_offer(conn, id))
    }

    fn update_transfer_offer(
        &self,
        offer: &TransferOffer,
        expected_version: i64,
    ) -> Result<TransferOffer> {
        self.with_conn(|conn| offers::update_transfer_offer(conn, offer, expected_version))
    }

    fn list_active_offers_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransferOffer>> {
        self.with_conn(|conn| offers::list_active_offers_for_user(conn, user_id, now))
    }

    fn list_offers_by_user(&self, user_id: UserId) -> Result<Vec<TransferOffer>> {
        self.with_conn(|conn| offers::list_offers_by_user(conn, user_id))
    }

    fn mark_offer_viewed(&self, offer_id: OfferId, user_id: UserId) -> Result<()> {
        self.with_conn(|conn| offers::mark_offer_viewed(conn, offer_id, user_id))
    }

    fn create_component_link(&self, input: &NewPropertyComponent) -> Result<PropertyComponent> {
        self.with_conn(|conn| components::create_component_link(conn, input))
    }

    fn get_parent_link(&self, component_id: PropertyId) -> Result<Option<PropertyComponent>> {
        self.with_conn(|conn| components::get_parent_link(conn, component_id))
    }

    fn list_property_components(&self, parent_id: PropertyId) -> Result<Vec<PropertyComponent>> {
        self.with_conn(|conn| components::list_property_components(conn, parent_id))
    }

    fn find_component_at_position(
        &self,
        parent_id: PropertyId,
        position: &str,
    ) -> Result<Option<PropertyComponent>> {
        self.with_conn(|conn| components::find_component_at_position(conn, parent_id, position))
    }

    fn delete_component_link(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
    ) -> Result<bool> {
        self.with_conn(|conn| components::delete_component_link(conn, parent_id, component_id))
    }

    fn update_component_position(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
        position: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            components::update_component_position(conn, parent_id, component_id, position)
        })
    }

    fn list_available_components(
        &self,
        parent_id: PropertyId,
        user_id: UserId,
    ) -> Result<Vec<Property>> {
        self.with_conn(|conn| properties::list_available_components(conn, parent_id, user_id))
    }

    fn create_component_event(&self, input: &NewComponentEvent) -> Result<ComponentEvent> {
        self.with_conn(|conn| components::create_component_event(conn, input))
    }

    fn list_component_events(&self, query: &ComponentEventQuery) -> Result<Vec<ComponentEvent>> {
        self.with_conn(|conn| components::list_component_events(conn, query))
    }

    fn create_document(&self, input: &NewDocument) -> Result<Document> {
        self.with_conn(|conn| documents::create_document(conn, input))
    }

    fn get_document(&self, id: i64) -> Result<Option<Document>> {
        self.with_conn(|conn| documents::get_document(conn, id))
    }

    fn list_documents_for_user(&self, user_id: UserId) -> Result<Vec<Document>> {
        self.with_conn(|conn| documents::list_documents_for_user(conn, user_id))
    }

    fn delete_document(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| documents::delete_document(conn, id))
    }

    fn count_documents_with_storage_key(&self, key: &str) -> Result<i64> {
        self.with_conn(|conn| documents::count_documents_with_storage_key(conn, key))
    }
}
