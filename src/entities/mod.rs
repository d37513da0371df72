// Entity registries backing the collaborator seams
//
// Each registry keeps a timeline-free, in-memory view used for display
// resolution and catalog lookups. The authoritative rows (wallets, stalls)
// live in the store; these never participate in ledger transactions.

pub mod business;
pub mod infraction;

pub use business::BusinessDirectory;
pub use infraction::InfractionRegistry;
