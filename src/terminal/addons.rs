// ABOUTME: Session-scoped registry of named addon capabilities such as the fit calculator
// Lookups are typed; `must_get` is for addons the caller registered itself

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub trait Addon: Any + Send + Sync {
    /// Release anything held by the addon when its session ends.
    fn dispose(&self) {}
}

struct Entry {
    any: Arc<dyn Any + Send + Sync>,
    addon: Arc<dyn Addon>,
}

#[derive(Default)]
pub struct AddonRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addon` under `name`, replacing (and disposing) any previous one.
    pub fn register<A: Addon>(&self, name: impl Into<String>, addon: Arc<A>) {
        let name = name.into();
        debug!("Registering addon '{}'", name);
        let entry = Entry {
            any: addon.clone(),
            addon,
        };
        if let Some(previous) = self.entries.write().insert(name, entry) {
            previous.addon.dispose();
        }
    }

    /// Look up an addon; `None` when absent or registered with another type.
    pub fn get<A: Addon>(&self, name: &str) -> Option<Arc<A>> {
        let any = self.entries.read().get(name)?.any.clone();
        any.downcast::<A>().ok()
    }

    /// Look up an addon the caller registered itself.
    ///
    /// # Panics
    ///
    /// Panics when `name` is not registered with type `A`. This is a broken
    /// contract in the caller, not a runtime condition to recover from.
    pub fn must_get<A: Addon>(&self, name: &str) -> Arc<A> {
        match self.get(name) {
            Some(addon) => addon,
            None => panic!(
                "addon '{}' of type {} is not registered",
                name,
                std::any::type_name::<A>()
            ),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispose and drop every addon.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.write());
        for (name, entry) in entries {
            debug!("Disposing addon '{}'", name);
            entry.addon.dispose();
        }
    }
}
