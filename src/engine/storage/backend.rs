use std::sync::Arc;

use crate::engine::errors::StoreError;
use crate::engine::policy::CookiePolicyItem;

/// A handle to a policy backend.
pub type PolicyBackendHandle = Arc<dyn PolicyBackend>;

/// Durable storage for policy items.
///
/// The [`PolicyStore`](crate::storage::PolicyStore) keeps the working set in memory and
/// writes through to a backend. Backends only need to load everything at startup, save
/// single items (keyed by `source_url`) and drop everything at once.
///
/// Implementations must be `Send + Sync` and internally synchronized.
pub trait PolicyBackend: Send + Sync {
    /// Loads every stored item.
    fn load_all(&self) -> Result<Vec<CookiePolicyItem>, StoreError>;

    /// Inserts or replaces the item keyed by `item.source_url()`.
    fn save(&self, item: &CookiePolicyItem) -> Result<(), StoreError>;

    /// Removes every stored item.
    fn clear(&self) -> Result<(), StoreError>;

    /// Backend name, for logging.
    fn name(&self) -> &'static str;
}
