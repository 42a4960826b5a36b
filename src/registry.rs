//! Name-keyed factories for pluggable kinds (data spaces, datatypes, backends).

use std::collections::BTreeMap;
use std::fmt;

use crate::error::KiraError;

type Factory<T, A> = Box<dyn Fn(&A) -> Result<T, KiraError> + Send + Sync>;

pub struct Registry<T, A = serde_json::Value> {
    kind: String,
    factories: BTreeMap<String, Factory<T, A>>,
}

impl<T, A> Registry<T, A> {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            factories: BTreeMap::new(),
        }
    }

    /// Registers a factory under `key`, replacing any previous one.
    pub fn register<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&A) -> Result<T, KiraError> + Send + Sync + 'static,
    {
        self.factories.insert(key.to_string(), Box::new(factory));
    }

    pub fn create(&self, key: &str, args: &A) -> Result<T, KiraError> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| KiraError::UnknownRegistryKey {
                kind: self.kind.clone(),
                key: key.to_string(),
                known: self.keys(),
            })?;
        factory(args)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl<T, A> fmt::Debug for Registry<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("keys", &self.keys())
            .finish()
    }
}
