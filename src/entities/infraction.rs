// Infraction Registry - in-memory catalog behind the InfractionCatalog seam
//
// Ships the standard municipal infraction table; deployments replace it with
// the regulation office's own catalog feed.

use std::sync::{Arc, RwLock};

use crate::collaborators::{InfractionCatalog, InfractionEntry};

/// Registry of infraction types keyed by code.
pub struct InfractionRegistry {
    entries: Arc<RwLock<Vec<InfractionEntry>>>,
}

impl InfractionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        InfractionRegistry {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Registry seeded with the standard municipal table.
    pub fn with_standard_table() -> Self {
        let registry = Self::new();
        for entry in standard_table() {
            registry.register(entry);
        }
        registry
    }

    /// Register or replace an entry (latest registration wins).
    pub fn register(&self, entry: InfractionEntry) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|e| e.code != entry.code);
        entries.push(entry);
    }

    pub fn all(&self) -> Vec<InfractionEntry> {
        self.entries.read().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

impl Default for InfractionRegistry {
    fn default() -> Self {
        Self::with_standard_table()
    }
}

impl InfractionCatalog for InfractionRegistry {
    fn lookup(&self, kind: &str) -> Option<InfractionEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|e| e.code == kind)
            .cloned()
    }
}

fn standard_table() -> Vec<InfractionEntry> {
    vec![
        InfractionEntry {
            code: "ASSENZA".to_string(),
            description: "Assenza non giustificata dal posteggio".to_string(),
            category: "presenze".to_string(),
            min_amount: 50.0,
            max_amount: 300.0,
            default_amount: 100.0,
        },
        InfractionEntry {
            code: "OCCUPAZIONE_ABUSIVA".to_string(),
            description: "Occupazione di posteggio senza titolo".to_string(),
            category: "concessioni".to_string(),
            min_amount: 150.0,
            max_amount: 900.0,
            default_amount: 450.0,
        },
        InfractionEntry {
            code: "SUPERFICIE_ECCEDENTE".to_string(),
            description: "Occupazione oltre la superficie concessa".to_string(),
            category: "concessioni".to_string(),
            min_amount: 80.0,
            max_amount: 500.0,
            default_amount: 160.0,
        },
        InfractionEntry {
            code: "MANCATO_PAGAMENTO".to_string(),
            description: "Mancato pagamento del canone di posteggio".to_string(),
            category: "tributi".to_string(),
            min_amount: 100.0,
            max_amount: 600.0,
            default_amount: 200.0,
        },
        InfractionEntry {
            code: "USCITA_ANTICIPATA".to_string(),
            description: "Abbandono del posteggio prima dell'orario consentito".to_string(),
            category: "presenze".to_string(),
            min_amount: 25.0,
            max_amount: 150.0,
            default_amount: 50.0,
        },
    ]
}
