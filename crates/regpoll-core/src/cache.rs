use crate::register::{RegisterKey, RegisterValue};
use std::collections::HashMap;

/// Last known-good value per register.
///
/// Only ever grows: values are inserted or overwritten by fresh reads, never
/// removed.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    values: HashMap<RegisterKey, RegisterValue>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: RegisterKey) -> Option<RegisterValue> {
        self.values.get(&key).copied()
    }

    /// Records a value just read from the device.
    pub fn store(&mut self, key: RegisterKey, value: RegisterValue) {
        self.values.insert(key, value);
    }

    pub fn contains(&self, key: RegisterKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_overwrites_without_shrinking() {
        let mut cache = Cache::new();
        cache.store(3044, 10);
        cache.store(3066, 55);
        cache.store(3044, 12);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(3044), Some(12));
        assert_eq!(cache.get(3066), Some(55));
        assert!(!cache.contains(3078));
    }
}
