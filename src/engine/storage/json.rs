//! JSON-backed policy storage.
//!
//! `JsonPolicyBackend` persists **all** policy items in a single JSON file on disk.
//!
//! ### Design
//! - One file for all sites (`PolicyFile { items: BTreeMap<source_url, CookiePolicyItem> }`).
//! - A mutex serializes file access, so concurrent saves never interleave their
//!   read-modify-write cycles.
//!
//! ### I/O characteristics & caveats
//! - `save` **reads then rewrites** the entire JSON file. For large datasets, use the
//!   SQLite backend.
//! - File writes are not atomic.
//! - A file that fails to parse loads as empty (logged), but `save` refuses to write
//!   over it until `clear` resets the file.
//!
//! ### Example
//! ```ignore
//! let backend = JsonPolicyBackend::new("policies.json".into())?;
//! let store = PolicyStore::open(Arc::new(backend))?;
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::engine::errors::StoreError;
use crate::engine::policy::CookiePolicyItem;
use crate::engine::storage::PolicyBackend;

/// On-disk representation of all policy items.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyFile {
    items: BTreeMap<String, CookiePolicyItem>,
}

/// A JSON-based policy backend that persists items across sessions.
pub struct JsonPolicyBackend {
    /// Path to the JSON file where items are stored.
    path: PathBuf,
    /// Serializes file access.
    io: Mutex<()>,
}

impl JsonPolicyBackend {
    /// Creates (or opens) a JSON policy file at `path`.
    ///
    /// If the file does not exist, an empty structure is written to disk.
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let backend = Self { path, io: Mutex::new(()) };

        if !backend.path.exists() {
            backend.save_file(&PolicyFile::default())?;
        }

        Ok(backend)
    }

    /// Loads and deserializes the policy file.
    fn load_file(&self) -> Result<PolicyFile, StoreError> {
        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Serializes and writes the full policy file (pretty-printed).
    fn save_file(&self, file: &PolicyFile) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(file)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl PolicyBackend for JsonPolicyBackend {
    fn load_all(&self) -> Result<Vec<CookiePolicyItem>, StoreError> {
        let _guard = self.io.lock().unwrap();
        match self.load_file() {
            Ok(file) => Ok(file.items.into_values().collect()),
            Err(StoreError::Serialization(e)) => {
                log::warn!("policy file {} is corrupt, starting empty: {e}", self.path.display());
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn save(&self, item: &CookiePolicyItem) -> Result<(), StoreError> {
        let _guard = self.io.lock().unwrap();
        let mut file = self.load_file()?;
        file.items.insert(item.source_url().to_string(), item.clone());
        self.save_file(&file)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.io.lock().unwrap();
        self.save_file(&PolicyFile::default())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
