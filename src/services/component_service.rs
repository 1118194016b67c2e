//! Component service - attachment graph between properties
//!
//! Edges form a forest: a component has at most one parent and no property
//! may end up beneath itself. Attach, detach and reposition hold per-property
//! locks so two callers cannot race each other past those checks.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::models::{
    ComponentEvent, ComponentEventQuery, ComponentEventType, NewComponentEvent,
    NewPropertyComponent, Property, PropertyComponent, PropertyId, UserId,
};
use crate::db::Repository;
use crate::error::{HandReceiptError, Result};
use crate::ledger::Ledger;

use super::best_effort;
use super::events::{EventBus, HandReceiptEvent};

/// An edge write plus any best-effort failures along the way
#[derive(Debug, Clone, Serialize)]
pub struct ComponentOutcome {
    pub link: PropertyComponent,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeFailure {
    pub property_id: PropertyId,
    pub error: String,
}

/// What a component cascade moved, left alone, or failed to move
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadeReport {
    pub transferred: Vec<PropertyId>,
    /// Attached components the sending user no longer held
    pub skipped: Vec<PropertyId>,
    pub failed: Vec<CascadeFailure>,
}

impl CascadeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Human-readable warnings for skipped and failed components
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings: Vec<String> = self
            .failed
            .iter()
            .map(|f| format!("component {} not transferred: {}", f.property_id, f.error))
            .collect();
        warnings.extend(
            self.skipped
                .iter()
                .map(|id| format!("component {} skipped: not held by the sending user", id)),
        );
        warnings
    }
}

pub struct ComponentService {
    repo: Arc<dyn Repository>,
    ledger: Arc<dyn Ledger>,
    events: Arc<EventBus>,
    locks: DashMap<PropertyId, Arc<Mutex<()>>>,
}

impl ComponentService {
    pub fn new(repo: Arc<dyn Repository>, ledger: Arc<dyn Ledger>, events: Arc<EventBus>) -> Self {
        Self {
            repo,
            ledger,
            events,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, property_id: PropertyId) -> Arc<Mutex<()>> {
        self.locks.entry(property_id).or_default().clone()
    }

    /// Run `f` while holding the locks for every id, taken in ascending order
    fn with_locks<T>(&self, ids: &[PropertyId], f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let locks: Vec<_> = ids.iter().map(|id| self.lock_for(*id)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(
                lock.lock()
                    .map_err(|_| HandReceiptError::Internal("Component lock poisoned".into()))?,
            );
        }

        f()
    }

    fn get_property(&self, id: PropertyId) -> Result<Property> {
        self.repo
            .get_property(id)?
            .ok_or_else(|| HandReceiptError::NotFound(format!("Property {} not found", id)))
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get_components(&self, parent_id: PropertyId) -> Result<Vec<PropertyComponent>> {
        self.repo.list_property_components(parent_id)
    }

    /// Properties `user_id` holds that could be attached under `parent_id`
    pub fn get_available(&self, parent_id: PropertyId, user_id: UserId) -> Result<Vec<Property>> {
        self.repo.list_available_components(parent_id, user_id)
    }

    pub fn list_events(&self, query: &ComponentEventQuery) -> Result<Vec<ComponentEvent>> {
        self.repo.list_component_events(query)
    }

    /// Whether attaching `component_id` under `parent_id` would put a property beneath itself
    pub fn would_create_cycle(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
    ) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut current = parent_id;
        loop {
            if current == component_id {
                return Ok(true);
            }
            if !seen.insert(current) {
                warn!(property_id = current, "Component graph already contains a cycle");
                return Ok(true);
            }
            match self.repo.get_parent_link(current)? {
                Some(link) => current = link.parent_property_id,
                None => return Ok(false),
            }
        }
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    pub fn attach(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
        acting_user_id: UserId,
        position: Option<String>,
        notes: Option<String>,
    ) -> Result<ComponentOutcome> {
        if parent_id == component_id {
            return Err(HandReceiptError::InvalidInput(
                "A property cannot be attached to itself".into(),
            ));
        }

        let parent = self.get_property(parent_id)?;
        let component = self.get_property(component_id)?;
        if !parent.is_held_by(acting_user_id) || !component.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "You must hold both the parent and the component to attach them".into(),
            ));
        }

        let position = position.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());

        let link = self.with_locks(&[parent_id, component_id], || {
            if let Some(existing) = self.repo.get_parent_link(component_id)? {
                return Err(HandReceiptError::Conflict(format!(
                    "Property {} is already attached to property {}",
                    component_id, existing.parent_property_id
                )));
            }
            if self.would_create_cycle(parent_id, component_id)? {
                return Err(HandReceiptError::Conflict(format!(
                    "Attaching property {} under property {} would create a cycle",
                    component_id, parent_id
                )));
            }
            if let Some(pos) = position.as_deref() {
                if let Some(occupant) = self.repo.find_component_at_position(parent_id, pos)? {
                    return Err(HandReceiptError::Conflict(format!(
                        "Position {} is already occupied by property {}",
                        pos, occupant.component_property_id
                    )));
                }
            }

            self.repo.create_component_link(&NewPropertyComponent {
                parent_property_id: parent_id,
                component_property_id: component_id,
                attached_by_user_id: acting_user_id,
                position: position.clone(),
                notes: notes.clone(),
            })
        })?;

        info!(parent_id, component_id, position = ?link.position, "Component attached");

        let warnings = self.record_change(&link, ComponentEventType::Attached, acting_user_id);
        self.events.emit(HandReceiptEvent::ComponentAttached {
            parent_property_id: parent_id,
            component_property_id: component_id,
        });

        Ok(ComponentOutcome { link, warnings })
    }

    pub fn detach(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
        acting_user_id: UserId,
    ) -> Result<ComponentOutcome> {
        let parent = self.get_property(parent_id)?;
        if !parent.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "Only the holder of the parent can detach its components".into(),
            ));
        }

        let link = self.with_locks(&[parent_id, component_id], || {
            let link = self.attached_link(parent_id, component_id)?;
            if !self.repo.delete_component_link(parent_id, component_id)? {
                return Err(HandReceiptError::NotFound(format!(
                    "Property {} is not attached to property {}",
                    component_id, parent_id
                )));
            }
            Ok(link)
        })?;

        info!(parent_id, component_id, "Component detached");

        let warnings = self.record_change(&link, ComponentEventType::Detached, acting_user_id);
        self.events.emit(HandReceiptEvent::ComponentDetached {
            parent_property_id: parent_id,
            component_property_id: component_id,
        });

        Ok(ComponentOutcome { link, warnings })
    }

    pub fn update_position(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
        acting_user_id: UserId,
        position: Option<String>,
    ) -> Result<PropertyComponent> {
        let parent = self.get_property(parent_id)?;
        if !parent.is_held_by(acting_user_id) {
            return Err(HandReceiptError::Unauthorized(
                "Only the holder of the parent can reposition its components".into(),
            ));
        }

        let position = position.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());

        self.with_locks(&[parent_id, component_id], || {
            self.attached_link(parent_id, component_id)?;
            if let Some(pos) = position.as_deref() {
                if let Some(occupant) = self.repo.find_component_at_position(parent_id, pos)? {
                    if occupant.component_property_id != component_id {
                        return Err(HandReceiptError::Conflict(format!(
                            "Position {} is already occupied by property {}",
                            pos, occupant.component_property_id
                        )));
                    }
                }
            }

            self.repo
                .update_component_position(parent_id, component_id, position.as_deref())?;
            debug!(parent_id, component_id, position = ?position, "Component repositioned");
            self.attached_link(parent_id, component_id)
        })
    }

    fn attached_link(
        &self,
        parent_id: PropertyId,
        component_id: PropertyId,
    ) -> Result<PropertyComponent> {
        self.repo
            .get_parent_link(component_id)?
            .filter(|link| link.parent_property_id == parent_id)
            .ok_or_else(|| {
                HandReceiptError::NotFound(format!(
                    "Property {} is not attached to property {}",
                    component_id, parent_id
                ))
            })
    }

    /// Component event row and ledger entry for an attach or detach
    fn record_change(
        &self,
        link: &PropertyComponent,
        event_type: ComponentEventType,
        acting_user_id: UserId,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        best_effort(
            &mut warnings,
            "component event",
            self.repo.create_component_event(&NewComponentEvent {
                parent_property_id: link.parent_property_id,
                component_property_id: link.component_property_id,
                attaching_user_id: acting_user_id,
                event_type,
                position: link.position.clone(),
                notes: link.notes.clone(),
            }),
        );

        let logged = match event_type {
            ComponentEventType::Attached => self.ledger.log_component_attached(
                link.parent_property_id,
                link.component_property_id,
                acting_user_id,
                link.position.as_deref(),
                link.notes.as_deref(),
            ),
            ComponentEventType::Detached => self.ledger.log_component_detached(
                link.parent_property_id,
                link.component_property_id,
                acting_user_id,
                link.position.as_deref(),
                link.notes.as_deref(),
            ),
        };
        best_effort(&mut warnings, "ledger component event", logged);

        warnings
    }

    // =========================================================================
    // Cascade
    // =========================================================================

    /// Move every component beneath `parent_id` from `from_user_id` to
    /// `to_user_id`, descending through components of components.
    ///
    /// Never aborts part way: each component succeeds, is skipped, or fails
    /// on its own and the report says which.
    pub fn transfer_components(
        &self,
        parent_id: PropertyId,
        from_user_id: UserId,
        to_user_id: UserId,
    ) -> CascadeReport {
        let mut report = CascadeReport::default();
        let mut visited = HashSet::from([parent_id]);
        let mut queue = VecDeque::from([parent_id]);

        while let Some(node) = queue.pop_front() {
            let links = match self.repo.list_property_components(node) {
                Ok(links) => links,
                Err(e) => {
                    warn!(parent_id = node, error = %e, "Failed to list components for cascade");
                    if node != parent_id {
                        report.failed.push(CascadeFailure {
                            property_id: node,
                            error: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            for link in links {
                let component_id = link.component_property_id;
                if !visited.insert(component_id) {
                    continue;
                }
                queue.push_back(component_id);

                match self.move_component(component_id, from_user_id, to_user_id) {
                    Ok(true) => report.transferred.push(component_id),
                    Ok(false) => report.skipped.push(component_id),
                    Err(e) => {
                        warn!(
                            component_id,
                            parent_id = node,
                            error = %e,
                            "Component cascade failed"
                        );
                        report.failed.push(CascadeFailure {
                            property_id: component_id,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        info!(
            parent_id,
            transferred = report.transferred.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Component cascade finished"
        );

        report
    }

    fn move_component(
        &self,
        component_id: PropertyId,
        from_user_id: UserId,
        to_user_id: UserId,
    ) -> Result<bool> {
        let component = self.get_property(component_id)?;
        if !component.is_held_by(from_user_id) {
            return Ok(false);
        }

        match self.repo.reassign_property(component_id, Some(from_user_id), to_user_id) {
            Ok(_) => {}
            // Moved by someone else since the read above
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e),
        }
        self.events.emit(HandReceiptEvent::PropertyUpdated { property_id: component_id });
        Ok(true)
    }
}
