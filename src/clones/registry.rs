//! Registration table mapping clone type names to constructors.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::builtin::{EchoClone, SleepClone};
use super::unit::{CloneUnit, CloneWork};
use crate::error::RegistryError;
use crate::events::EventBus;

/// Constructor for the work of one clone type.
pub type CloneFactory = Arc<dyn Fn() -> Box<dyn CloneWork> + Send + Sync>;

/// Registry of clone types, populated explicitly at startup.
#[derive(Default)]
pub struct CloneRegistry {
    factories: RwLock<HashMap<String, CloneFactory>>,
}

impl CloneRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in `Echo` and `Sleep` types.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        // Names are distinct and non-empty, so neither call can fail.
        let _ = registry.register_type::<EchoClone>(EchoClone::TYPE_NAME);
        let _ = registry.register_type::<SleepClone>(SleepClone::TYPE_NAME);
        registry
    }

    /// Registers a factory under `type_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or already taken.
    pub fn register(
        &self,
        type_name: impl Into<String>,
        factory: CloneFactory,
    ) -> Result<(), RegistryError> {
        let type_name = type_name.into();
        if type_name.trim().is_empty() {
            return Err(RegistryError::EmptyTypeName);
        }

        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(&type_name) {
            return Err(RegistryError::DuplicateType(type_name));
        }
        info!(clone_type = %type_name, "Registered clone type");
        factories.insert(type_name, factory);
        Ok(())
    }

    /// Registers a type constructed through `Default`.
    pub fn register_type<W>(&self, type_name: impl Into<String>) -> Result<(), RegistryError>
    where
        W: CloneWork + Default + 'static,
    {
        self.register(type_name, Arc::new(|| Box::new(W::default()) as Box<dyn CloneWork>))
    }

    /// Removes a type. Returns whether it was registered.
    pub fn unregister(&self, type_name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(type_name)
            .is_some()
    }

    /// Whether `type_name` is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Instantiates a clone of `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownType`] if no factory is registered.
    pub fn create(
        &self,
        type_name: &str,
        id: Option<String>,
        name: Option<String>,
        bus: &EventBus,
    ) -> Result<CloneUnit, RegistryError> {
        // Clone the factory out so user code never runs under the lock.
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))?;

        let clone = CloneUnit::new(id, type_name, name, factory(), bus.clone());
        debug!(clone_id = %clone.id(), clone_type = %type_name, "Created clone instance");
        Ok(clone)
    }
}

impl std::fmt::Debug for CloneRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clones::CloneStatus;

    #[test]
    fn test_builtins_registered() {
        let registry = CloneRegistry::with_builtins();
        assert_eq!(registry.type_names(), vec!["Echo", "Sleep"]);
        assert!(registry.contains("Echo"));
        assert!(!registry.contains("echo"));
    }

    #[test]
    fn test_register_rejects_duplicates_and_empty_names() {
        let registry = CloneRegistry::new();
        assert!(registry.register_type::<EchoClone>("Echo").is_ok());
        assert!(matches!(
            registry.register_type::<EchoClone>("Echo"),
            Err(RegistryError::DuplicateType(_))
        ));
        assert!(matches!(
            registry.register_type::<EchoClone>("  "),
            Err(RegistryError::EmptyTypeName)
        ));
    }

    #[test]
    fn test_create_known_and_unknown_types() {
        let registry = CloneRegistry::with_builtins();
        let bus = EventBus::new();

        let clone = registry
            .create("Echo", Some("c-1".to_string()), None, &bus)
            .unwrap();
        assert_eq!(clone.id(), "c-1");
        assert_eq!(clone.type_name(), "Echo");
        assert_eq!(clone.status(), CloneStatus::Created);

        let err = registry.create("Missing", None, None, &bus).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType(name) if name == "Missing"));
    }

    #[test]
    fn test_unregister() {
        let registry = CloneRegistry::with_builtins();
        assert!(registry.unregister("Sleep"));
        assert!(!registry.unregister("Sleep"));
        assert_eq!(registry.type_names(), vec!["Echo"]);
    }
}
