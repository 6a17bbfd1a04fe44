//! In-process fan-out of mutation events

use super::{CrudEvent, EventEmitter};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast channel shared by every engine of an `AppState`.
///
/// Sending never blocks; with nobody listening the event is dropped.
/// Clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CrudEvent>,
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Every event, in emission order
    pub fn subscribe(&self) -> broadcast::Receiver<CrudEvent> {
        self.tx.subscribe()
    }

    /// Only events tagged with `organization_id`
    pub fn subscribe_organization(&self, organization_id: impl Into<String>) -> OrganizationEvents {
        OrganizationEvents {
            organization_id: organization_id.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, event: CrudEvent) {
        let (entity_type, action) = (event.entity_type, event.action);
        match self.tx.send(event) {
            Ok(n) => debug!(?entity_type, ?action, listeners = n, "Event published"),
            Err(_) => debug!(?entity_type, ?action, "Event dropped, no listeners"),
        }
    }
}

/// Receiver filtered to one organization's events
pub struct OrganizationEvents {
    organization_id: String,
    rx: broadcast::Receiver<CrudEvent>,
}

impl OrganizationEvents {
    /// Next matching event; `None` once the bus is gone.
    ///
    /// A slow listener that falls behind skips the overwritten events.
    pub async fn recv(&mut self) -> Option<CrudEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(organization_id = %self.organization_id, missed, "Event listener lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &CrudEvent) -> bool {
        event.organization_id.as_deref() == Some(self.organization_id.as_str())
    }
}
