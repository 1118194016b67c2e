//! Connection service - user directory and the connections that gate custody moves

use std::sync::Arc;

use tracing::info;

use crate::db::models::{ConnectionStatus, NewUser, User, UserConnection, UserId};
use crate::db::Repository;
use crate::error::{HandReceiptError, Result};

use super::events::{EventBus, HandReceiptEvent};

pub struct ConnectionService {
    repo: Arc<dyn Repository>,
    events: Arc<EventBus>,
}

impl ConnectionService {
    pub fn new(repo: Arc<dyn Repository>, events: Arc<EventBus>) -> Self {
        Self { repo, events }
    }

    // =========================================================================
    // Directory
    // =========================================================================

    pub fn register_user(&self, input: NewUser) -> Result<User> {
        if input.name.trim().is_empty() {
            return Err(HandReceiptError::InvalidInput("name is required".into()));
        }
        self.repo.create_user(&input)
    }

    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        self.repo
            .get_user(user_id)?
            .ok_or_else(|| HandReceiptError::NotFound(format!("User {} not found", user_id)))
    }

    // =========================================================================
    // Connections
    // =========================================================================

    pub fn are_connected(&self, a: UserId, b: UserId) -> Result<bool> {
        self.repo.are_users_connected(a, b)
    }

    pub fn list_connections(&self, user_id: UserId) -> Result<Vec<UserConnection>> {
        self.repo.get_user_connections(user_id)
    }

    /// Ask another user to connect
    pub fn request_connection(
        &self,
        requester_id: UserId,
        addressee_id: UserId,
    ) -> Result<UserConnection> {
        if requester_id == addressee_id {
            return Err(HandReceiptError::InvalidInput("Cannot connect to yourself".into()));
        }
        self.get_user(requester_id)?;
        self.get_user(addressee_id)?;

        if let Some(existing) = self.repo.find_connection_between(requester_id, addressee_id)? {
            return Err(HandReceiptError::Conflict(format!(
                "Connection already exists with status {}",
                existing.status
            )));
        }

        let connection = self.repo.create_connection(requester_id, addressee_id)?;

        info!(connection_id = connection.id, requester_id, addressee_id, "Connection requested");
        self.events.emit(HandReceiptEvent::ConnectionRequested {
            connection_id: connection.id,
            requester_id,
            addressee_id,
        });

        Ok(connection)
    }

    /// Accept or block a pending request. Only the addressee may answer.
    pub fn respond_to_connection(
        &self,
        connection_id: i64,
        acting_user_id: UserId,
        accept: bool,
    ) -> Result<UserConnection> {
        let connection = self.repo.get_connection(connection_id)?.ok_or_else(|| {
            HandReceiptError::NotFound(format!("Connection {} not found", connection_id))
        })?;

        if connection.addressee_id != acting_user_id {
            return Err(HandReceiptError::Unauthorized(
                "Only the addressee can respond to a connection request".into(),
            ));
        }
        if connection.status != ConnectionStatus::Pending {
            return Err(HandReceiptError::Conflict(format!(
                "Connection is already {}",
                connection.status
            )));
        }

        let status = if accept {
            ConnectionStatus::Accepted
        } else {
            ConnectionStatus::Blocked
        };
        self.repo.update_connection_status(connection_id, status)?;

        if accept {
            self.events.emit(HandReceiptEvent::ConnectionAccepted {
                connection_id,
                requester_id: connection.requester_id,
                addressee_id: connection.addressee_id,
            });
        }

        self.repo.get_connection(connection_id)?.ok_or_else(|| {
            HandReceiptError::NotFound(format!("Connection {} not found", connection_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::HandReceiptDb;

    fn service() -> ConnectionService {
        let db = Arc::new(HandReceiptDb::open_in_memory().unwrap());
        ConnectionService::new(db, Arc::new(EventBus::new()))
    }

    fn user(service: &ConnectionService, name: &str) -> UserId {
        service
            .register_user(NewUser { name: name.into(), ..Default::default() })
            .unwrap()
            .id
    }

    #[test]
    fn test_request_and_accept() {
        let service = service();
        let a = user(&service, "A");
        let b = user(&service, "B");

        let request = service.request_connection(a, b).unwrap();
        assert!(!service.are_connected(a, b).unwrap());

        let err = service.respond_to_connection(request.id, a, true).unwrap_err();
        assert!(matches!(err, HandReceiptError::Unauthorized(_)));

        let accepted = service.respond_to_connection(request.id, b, true).unwrap();
        assert_eq!(accepted.status, ConnectionStatus::Accepted);
        assert!(service.are_connected(b, a).unwrap());
    }

    #[test]
    fn test_reverse_request_is_conflict() {
        let service = service();
        let a = user(&service, "A");
        let b = user(&service, "B");

        service.request_connection(a, b).unwrap();
        let err = service.request_connection(b, a).unwrap_err();
        assert!(matches!(err, HandReceiptError::Conflict(_)));
    }

    #[test]
    fn test_unknown_addressee_is_not_found() {
        let service = service();
        let a = user(&service, "A");
        assert!(service.request_connection(a, 404).unwrap_err().is_not_found());
    }
}
