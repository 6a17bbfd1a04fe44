//! Mutation event types

use serde::{Deserialize, Serialize};

/// The type of entity that was mutated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Organization,
    Entity,
    Category,
    Project,
    Complex,
    Object,
    Connection,
    Meter,
    Document,
    BillingItem,
}

impl From<crate::hierarchy::HierarchyLevel> for EntityType {
    fn from(level: crate::hierarchy::HierarchyLevel) -> Self {
        use crate::hierarchy::HierarchyLevel as L;
        match level {
            L::Organization => Self::Organization,
            L::Entity => Self::Entity,
            L::Category => Self::Category,
            L::Project => Self::Project,
            L::Complex => Self::Complex,
            L::Object => Self::Object,
            L::Connection => Self::Connection,
            L::Meter => Self::Meter,
            L::Document => Self::Document,
        }
    }
}

/// The action performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrudAction {
    Created,
    Updated,
    Moved,
    Deleted,
    /// Connection lifecycle status change
    Transitioned,
}

/// An event emitted after a committed mutation
///
/// Must be Clone for `tokio::sync::broadcast`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrudEvent {
    pub entity_type: EntityType,
    pub action: CrudAction,
    pub entity_id: String,
    /// Entity data relevant to the change (new status, path names, amounts)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    /// ISO 8601 timestamp
    pub timestamp: String,
    /// Owning organization, for subscriber-side filtering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

impl CrudEvent {
    /// Create a new CrudEvent with the current timestamp
    pub fn new(entity_type: EntityType, action: CrudAction, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            action,
            entity_id: entity_id.into(),
            payload: serde_json::Value::Null,
            timestamp: chrono::Utc::now().to_rfc3339(),
            organization_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_organization_id(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }
}

/// Sink for mutation events.
///
/// Emission is fire-and-forget and must never fail the mutation that
/// produced the event.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: CrudEvent);

    fn emit_created(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
        organization_id: Option<String>,
    ) {
        self.emit(with_org(
            CrudEvent::new(entity_type, CrudAction::Created, entity_id).with_payload(payload),
            organization_id,
        ));
    }

    fn emit_updated(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
        organization_id: Option<String>,
    ) {
        self.emit(with_org(
            CrudEvent::new(entity_type, CrudAction::Updated, entity_id).with_payload(payload),
            organization_id,
        ));
    }

    fn emit_moved(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
        organization_id: Option<String>,
    ) {
        self.emit(with_org(
            CrudEvent::new(entity_type, CrudAction::Moved, entity_id).with_payload(payload),
            organization_id,
        ));
    }

    fn emit_deleted(&self, entity_type: EntityType, entity_id: &str, organization_id: Option<String>) {
        self.emit(with_org(
            CrudEvent::new(entity_type, CrudAction::Deleted, entity_id),
            organization_id,
        ));
    }

    fn emit_transitioned(
        &self,
        connection_id: &str,
        payload: serde_json::Value,
        organization_id: Option<String>,
    ) {
        self.emit(with_org(
            CrudEvent::new(EntityType::Connection, CrudAction::Transitioned, connection_id)
                .with_payload(payload),
            organization_id,
        ));
    }
}

fn with_org(event: CrudEvent, organization_id: Option<String>) -> CrudEvent {
    match organization_id {
        Some(org) => event.with_organization_id(org),
        None => event,
    }
}

/// Emitter that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: CrudEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::HierarchyLevel;

    #[test]
    fn test_entity_type_snake_case() {
        assert_eq!(
            serde_json::to_string(&EntityType::BillingItem).unwrap(),
            "\"billing_item\""
        );
        assert_eq!(
            serde_json::to_string(&CrudAction::Transitioned).unwrap(),
            "\"transitioned\""
        );
    }

    #[test]
    fn test_entity_type_from_level() {
        assert_eq!(EntityType::from(HierarchyLevel::Object), EntityType::Object);
        assert_eq!(
            EntityType::from(HierarchyLevel::Connection),
            EntityType::Connection
        );
    }

    #[test]
    fn test_crud_event_optional_fields_omitted() {
        let event = CrudEvent::new(EntityType::Meter, CrudAction::Deleted, "meter-1");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"payload\""));
        assert!(!json.contains("\"organization_id\""));
    }

    #[test]
    fn test_crud_event_serde_roundtrip() {
        let event = CrudEvent::new(EntityType::Connection, CrudAction::Transitioned, "c-1")
            .with_payload(serde_json::json!({"from": "planned", "to": "connected"}))
            .with_organization_id("org-1");

        let json = serde_json::to_string(&event).unwrap();
        let back: CrudEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, CrudAction::Transitioned);
        assert_eq!(back.payload["to"], "connected");
        assert_eq!(back.organization_id.as_deref(), Some("org-1"));
    }
}
