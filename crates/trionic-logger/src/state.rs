//! Latest measurement per name, shared between the engine and its helpers

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone, Default)]
pub struct Measurements {
    inner: Arc<RwLock<HashMap<String, f64>>>,
}

impl Measurements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: f64) {
        self.inner.write().insert(name.to_string(), value);
    }

    /// 0 for names never set
    pub fn get(&self, name: &str) -> f64 {
        self.inner.read().get(name).copied().unwrap_or_default()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn delete(&self, name: &str) {
        self.inner.write().remove(name);
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Sorted names
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_between_clones() {
        let state = Measurements::new();
        let other = state.clone();
        other.set("In.v_Vehicle", 72.3);
        other.set("ActualIn.n_Engine", 2500.0);
        assert!(state.exists("In.v_Vehicle"));
        assert_eq!(state.get("ActualIn.n_Engine"), 2500.0);
        assert_eq!(state.get("missing"), 0.0);
        assert_eq!(state.keys(), vec!["ActualIn.n_Engine", "In.v_Vehicle"]);
        state.delete("In.v_Vehicle");
        assert_eq!(other.len(), 1);
    }
}
