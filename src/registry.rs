use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no bean of type `{type_name}` bound under `{name}`")]
pub struct LookupError {
    pub name: String,
    pub type_name: &'static str,
}

/// Named beans (strategies, repositories, processors, policies) looked up by type.
///
/// Values are stored as they were bound, so a bean bound as
/// `Arc<dyn AggregationStrategy>` must be looked up with that same type.
#[derive(Default)]
pub struct Registry {
    beans: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.beans.read().unwrap_or_else(|err| err.into_inner());
        let mut names: Vec<&String> = guard.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("beans", &names).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<T>(&self, name: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.beans
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(name.into(), Arc::new(value));
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.beans
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(name)
            .is_some()
    }

    /// `None` when nothing is bound under `name` or the bean has another type.
    pub fn lookup<T>(&self, name: &str) -> Option<T>
    where
        T: Any + Clone + Send + Sync,
    {
        let guard = self.beans.read().unwrap_or_else(|err| err.into_inner());
        guard
            .get(name)
            .and_then(|bean| bean.downcast_ref::<T>())
            .cloned()
    }

    pub fn mandatory_lookup<T>(&self, name: &str) -> Result<T, LookupError>
    where
        T: Any + Clone + Send + Sync,
    {
        self.lookup(name).ok_or_else(|| LookupError {
            name: name.to_string(),
            type_name: type_name::<T>(),
        })
    }
}
