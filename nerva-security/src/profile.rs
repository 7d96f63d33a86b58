use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use nerva_core::{KernelError, Pkr};

/// A named, reusable set of grants: apply it to a resource to add every
/// listed principal to the matching rights list, remove it to take them
/// back out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionProfile {
    pub name: String,
    #[serde(default)]
    pub readers: Vec<Pkr>,
    #[serde(default)]
    pub writers: Vec<Pkr>,
    #[serde(default)]
    pub granters: Vec<Pkr>,
    #[serde(default)]
    pub metadata: Value,
}

impl PermissionProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            readers: Vec::new(),
            writers: Vec::new(),
            granters: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn reader(mut self, pkr: Pkr) -> Self {
        self.readers.push(pkr);
        self
    }

    pub fn writer(mut self, pkr: Pkr) -> Self {
        self.writers.push(pkr);
        self
    }

    pub fn granter(mut self, pkr: Pkr) -> Self {
        self.granters.push(pkr);
        self
    }

    /// Total number of grants the profile carries.
    pub fn grant_count(&self) -> usize {
        self.readers.len() + self.writers.len() + self.granters.len()
    }
}

/// Registry of permission profiles, keyed by name.
#[derive(Default)]
pub struct ProfileRegistry {
    by_name: DashMap<String, PermissionProfile>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, profile: PermissionProfile) -> Result<(), KernelError> {
        if self.by_name.contains_key(&profile.name) {
            return Err(KernelError::validation(format!(
                "profile '{}' already exists",
                profile.name
            )));
        }
        self.by_name.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<PermissionProfile> {
        self.by_name.get(name).map(|p| p.clone())
    }

    pub fn list(&self) -> Vec<PermissionProfile> {
        let mut profiles: Vec<PermissionProfile> =
            self.by_name.iter().map(|p| p.clone()).collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    pub fn delete(&self, name: &str) -> bool {
        self.by_name.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
