use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::engine::errors::StoreError;
use crate::engine::policy::CookiePolicyItem;
use crate::engine::storage::PolicyBackend;

/// Policy backend that keeps nothing beyond the lifetime of the process.
///
/// Useful for private sessions and tests.
#[derive(Debug, Default)]
pub struct InMemoryPolicyBackend {
    items: RwLock<BTreeMap<String, CookiePolicyItem>>,
}

impl InMemoryPolicyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolicyBackend for InMemoryPolicyBackend {
    fn load_all(&self) -> Result<Vec<CookiePolicyItem>, StoreError> {
        Ok(self.items.read().unwrap().values().cloned().collect())
    }

    fn save(&self, item: &CookiePolicyItem) -> Result<(), StoreError> {
        self.items
            .write()
            .unwrap()
            .insert(item.source_url().to_string(), item.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.items.write().unwrap().clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
