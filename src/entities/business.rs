// Business Directory - in-memory registry behind the BusinessRegistry seam
//
// Resolves a business reference to its display profile (name, tax code,
// wallet). Lookups are read-only; wallet accounting happens in the store.

use std::sync::{Arc, RwLock};

use crate::collaborators::{BusinessProfile, BusinessRegistry};

/// Registry of known business profiles.
pub struct BusinessDirectory {
    profiles: Arc<RwLock<Vec<BusinessProfile>>>,
}

impl BusinessDirectory {
    pub fn new() -> Self {
        BusinessDirectory {
            profiles: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register or replace a profile (latest registration wins).
    pub fn register(&self, profile: BusinessProfile) {
        let mut profiles = self.profiles.write().unwrap();
        profiles.retain(|p| p.id != profile.id);
        profiles.push(profile);
    }

    /// Find a profile by exact display name (case-insensitive).
    pub fn find_by_name(&self, name: &str) -> Option<BusinessProfile> {
        let lower = name.to_lowercase();
        self.profiles
            .read()
            .unwrap()
            .iter()
            .find(|p| p.name.to_lowercase() == lower)
            .cloned()
    }

    /// Find a profile by tax code.
    pub fn find_by_tax_code(&self, tax_code: &str) -> Option<BusinessProfile> {
        self.profiles
            .read()
            .unwrap()
            .iter()
            .find(|p| p.tax_code == tax_code)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.profiles.read().unwrap().len()
    }
}

impl Default for BusinessDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl BusinessRegistry for BusinessDirectory {
    fn resolve(&self, business_id: &str) -> Option<BusinessProfile> {
        self.profiles
            .read()
            .unwrap()
            .iter()
            .find(|p| p.id == business_id)
            .cloned()
    }
}
