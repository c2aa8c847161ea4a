use super::Value;
use crate::Error;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Named values an endpoint publishes to every peer.
///
/// Shared by all protocols of one endpoint; a root call with a `null`
/// receiver resolves its method name here.
#[derive(Clone, Default)]
pub struct Roots {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl Roots {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), Error> {
        let name = name.into();
        let mut entries = self.lock();
        if entries.contains_key(&name) {
            return Err(Error::AlreadyPublished(name));
        }
        entries.insert(name, value.into());
        Ok(())
    }

    pub fn unpublish(&self, name: &str) -> Option<Value> {
        self.lock().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub(crate) fn set(&self, name: &str, value: Value) {
        self.lock().insert(name.to_string(), value);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Roots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishing_twice_fails() {
        let roots = Roots::new();
        roots.publish("version", 1).unwrap();
        let err = roots.publish("version", 2).unwrap_err();
        assert_eq!(err.to_string(), "object version has been published");
        assert_eq!(roots.get("version"), Some(Value::Integer(1)));
    }

    #[test]
    fn unpublish_frees_the_name() {
        let roots = Roots::new();
        roots.publish("a", true).unwrap();
        assert!(roots.unpublish("a").is_some());
        roots.publish("a", false).unwrap();
        assert_eq!(roots.names(), vec!["a".to_string()]);
    }
}
