// Mercato Core - Concession Titolarità Ledger + Compliance Workflow
// Exposes all modules for use in CLI, API server, and tests

pub mod db;
pub mod error;
pub mod collaborators;
pub mod entities;       // In-memory registries behind the collaborator seams
pub mod ledger;         // Concession holdership + append-only titolarità events
pub mod transgressions; // Detection -> sanction / archival pipeline
pub mod sessions;       // Market-day aggregation (the upstream fact source)
pub mod justifications; // Independent excuse review workflow
pub mod watchlist;      // Monitoring triggers per business
pub mod notifications;  // Outbox + reconciliation digest

// Re-export commonly used types
pub use db::{open_database, open_in_memory, setup_database, Business, Stall};
pub use error::{CoreError, CoreResult};
pub use collaborators::{
    BlobStore, BusinessProfile, BusinessRegistry, InMemoryBlobStore, InfractionCatalog,
    InfractionEntry, Notification, NotificationDispatcher, TracingDispatcher,
};
pub use entities::{BusinessDirectory, InfractionRegistry};
pub use ledger::{
    compute_status, ArchivedSnapshots, Concession, ConcessionStatus, DocumentRefs, EventKind,
    HistoryScope, TitolaritaEvent, TransferOutcome,
};
pub use transgressions::{
    DisplayBucket, PaymentStatus, PendingPayment, Sanction, Transgression, TransgressionStatus,
};
pub use sessions::{
    MarketSession, PresenceFact, PresenceKind, RawPresenceRow, RowIssue, RowIssueSeverity,
    SessionDetail, SessionOutcome,
};
pub use justifications::{Justification, JustificationStatus, ReviewDecision};
pub use watchlist::{TriggerPriority, WatchlistItem, WatchlistStatus};
pub use notifications::{DispatchSummary, OutboxRecord, OutboxStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
