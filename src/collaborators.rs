// External collaborator seams
//
// The core never blocks on these for longer than a bounded synchronous call,
// and a failure here never rolls back a ledger mutation that has already
// committed. Each trait has an in-memory implementation under `entities` (or
// here, for the trivial ones) and test doubles where tests need them.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::info;

// ============================================================================
// INFRACTION CATALOG
// ============================================================================

/// One catalog entry for an infraction type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfractionEntry {
    pub code: String,
    pub description: String,
    pub category: String,
    pub min_amount: f64,
    pub max_amount: f64,
    pub default_amount: f64,
}

/// Read-only lookup of infraction types. Owned by the municipality's
/// regulation office, not by this core.
pub trait InfractionCatalog {
    fn lookup(&self, kind: &str) -> Option<InfractionEntry>;
}

// ============================================================================
// BUSINESS REGISTRY
// ============================================================================

/// Display-level profile of a business as resolved by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub id: String,
    pub name: String,
    pub tax_code: String,
    pub wallet_balance: f64,
}

/// Resolves business references for display. Wallet balances used by
/// transfer accounting live in the core store; this seam is read-only.
pub trait BusinessRegistry {
    fn resolve(&self, business_id: &str) -> Option<BusinessProfile>;
}

// ============================================================================
// BLOB STORAGE
// ============================================================================

/// Accepts an uploaded file, returns a retrievable reference.
/// Only JustificationReview uses it; the core stores references, never bytes.
pub trait BlobStore {
    fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String, String>;
}

/// In-memory blob store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<Vec<(String, Vec<u8>)>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String, String> {
        let reference = format!("blob://{}/{}", uuid::Uuid::new_v4(), file_name);
        self.blobs
            .write()
            .unwrap()
            .push((reference.clone(), bytes.to_vec()));
        Ok(reference)
    }
}

// ============================================================================
// NOTIFICATION DISPATCHER
// ============================================================================

/// A state-change message bound for the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Fire-and-forget delivery. Delivery failures are the dispatcher's concern;
/// the outbox retries, the core never waits.
pub trait NotificationDispatcher {
    fn dispatch(&self, notification: &Notification) -> Result<(), String>;
}

/// Dispatcher that logs deliveries; the default for CLI runs.
#[derive(Default)]
pub struct TracingDispatcher;

impl NotificationDispatcher for TracingDispatcher {
    fn dispatch(&self, notification: &Notification) -> Result<(), String> {
        info!(topic = %notification.topic, "notification dispatched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_blob_store_returns_reference() {
        let store = InMemoryBlobStore::new();
        let reference = store.store("certificato.pdf", b"%PDF-1.4").unwrap();
        assert!(reference.starts_with("blob://"));
        assert!(reference.ends_with("certificato.pdf"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_tracing_dispatcher_accepts() {
        let dispatcher = TracingDispatcher;
        let notification = Notification {
            topic: "sanction.issued".to_string(),
            payload: serde_json::json!({"code": "PM-2025-000001"}),
        };
        assert!(dispatcher.dispatch(&notification).is_ok());
    }
}
