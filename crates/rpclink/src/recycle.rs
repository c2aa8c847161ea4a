//! Weak registry of live proxies.
//!
//! The protocol records every proxy it hands out here. Once the application
//! drops the last handle, the entry goes dead and [`Recycle::collect`]
//! reports its id so the owner can be told to release the real object.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecycleError {
    #[error("{0} was exists")]
    Exists(u64),
    #[error("{0} was not exists")]
    Missing(u64),
}

pub struct Recycle<T> {
    entries: HashMap<u64, Weak<T>>,
}

impl<T> Default for Recycle<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> Recycle<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `object` under `id`. A dead entry under the same id is replaced.
    pub fn add(&mut self, id: u64, object: &Arc<T>) -> Result<(), RecycleError> {
        if self.get(id).is_some() {
            return Err(RecycleError::Exists(id));
        }
        self.entries.insert(id, Arc::downgrade(object));
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Result<(), RecycleError> {
        self.entries
            .remove(&id)
            .map(drop)
            .ok_or(RecycleError::Missing(id))
    }

    pub fn get(&self, id: u64) -> Option<Arc<T>> {
        self.entries.get(&id).and_then(Weak::upgrade)
    }

    /// Remove and return the ids whose objects have been dropped.
    pub fn collect(&mut self) -> Vec<u64> {
        let mut dead: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        dead.sort_unstable();
        for id in &dead {
            self.entries.remove(id);
        }
        dead
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_entries_are_unique() {
        let mut recycle = Recycle::new();
        let object = Arc::new("a");
        recycle.add(1, &object).unwrap();
        assert_eq!(recycle.add(1, &object), Err(RecycleError::Exists(1)));
        assert_eq!(recycle.get(1).as_deref(), Some(&"a"));
    }

    #[test]
    fn dropped_objects_are_collected_once() {
        let mut recycle = Recycle::new();
        let kept = Arc::new(1);
        let dropped = Arc::new(2);
        recycle.add(1, &kept).unwrap();
        recycle.add(2, &dropped).unwrap();
        drop(dropped);

        assert_eq!(recycle.collect(), vec![2]);
        assert!(recycle.collect().is_empty());
        assert_eq!(recycle.len(), 1);
    }

    #[test]
    fn dead_entry_can_be_replaced() {
        let mut recycle = Recycle::new();
        recycle.add(5, &Arc::new(())).unwrap();
        let again = Arc::new(());
        recycle.add(5, &again).unwrap();
        assert!(recycle.collect().is_empty());
    }

    #[test]
    fn remove_missing_fails() {
        let mut recycle: Recycle<()> = Recycle::new();
        assert_eq!(recycle.remove(3), Err(RecycleError::Missing(3)));
        recycle.add(3, &Arc::new(())).unwrap();
        assert!(recycle.remove(3).is_ok());
        recycle.add(4, &Arc::new(())).unwrap();
        recycle.clear();
        assert!(recycle.is_empty());
    }
}
