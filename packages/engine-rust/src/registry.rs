use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Binding {
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

/// Registry of named, shared objects (change feeds, clients, lookup tables)
/// that endpoints and processors resolve by name.
///
/// Provides two lookup mechanisms:
/// - **By name** (`lookup::<T>`): the object bound under a name, if it is a `T`
/// - **By type** (`lookup_by_type::<T>`): every `T`, in binding order
pub struct Registry {
    by_name: DashMap<String, Binding>,
    /// Binding order, for deterministic by-type lookups.
    order: RwLock<Vec<String>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Binds `value` under `name`, replacing any previous binding.
    pub fn bind<T: Any + Send + Sync>(&self, name: impl Into<String>, value: Arc<T>) {
        let name = name.into();
        let previous = self.by_name.insert(
            name.clone(),
            Binding {
                type_id: TypeId::of::<T>(),
                value,
            },
        );
        if previous.is_none() {
            self.order.write().push(name);
        }
    }

    /// Retrieves the object bound under `name` if it is a `T`.
    #[must_use]
    pub fn lookup<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.by_name
            .get(name)
            .and_then(|entry| Arc::clone(&entry.value().value).downcast::<T>().ok())
    }

    /// Every object of type `T` with its name, in binding order.
    #[must_use]
    pub fn lookup_by_type<T: Any + Send + Sync>(&self) -> Vec<(String, Arc<T>)> {
        let wanted = TypeId::of::<T>();
        let order = self.order.read().clone();
        order
            .into_iter()
            .filter_map(|name| {
                let entry = self.by_name.get(&name)?;
                if entry.type_id != wanted {
                    return None;
                }
                let value = Arc::clone(&entry.value).downcast::<T>().ok()?;
                drop(entry);
                Some((name, value))
            })
            .collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Removes a binding. Returns whether one existed.
    pub fn unbind(&self, name: &str) -> bool {
        let removed = self.by_name.remove(name).is_some();
        if removed {
            self.order.write().retain(|n| n != name);
        }
        removed
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &*self.order.read())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
