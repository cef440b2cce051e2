use dashmap::DashMap;

/// Process-lifetime integer counters keyed by path
#[derive(Debug, Default)]
pub struct CounterStore {
    counters: DashMap<String, i64>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> i64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Add `delta` to the counter and return the new value
    pub fn incr(&self, key: &str, delta: i64) -> i64 {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry += delta;
        *entry
    }

    pub fn set(&self, key: &str, value: i64) {
        self.counters.insert(key.to_string(), value);
    }

    pub fn reset(&self, key: &str) {
        self.set(key, 0);
    }

    pub fn all(&self) -> std::collections::HashMap<String, i64> {
        self.counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}
