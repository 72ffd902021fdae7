use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use dashmap::DashMap;

/// Name-to-id resolution service. All operations are idempotent: the same
/// name always resolves to the same id, and resolution is assumed
/// cacheable by callers. Failures are retryable by the producer.
pub trait MetricRegistry: Send + Sync {
    fn get_or_add_source(&self, name: &str) -> Result<u32>;
    fn get_or_add_category(&self, name: &str) -> Result<u32>;
    fn get_or_add_metric(&self, category_id: u32, name: &str) -> Result<u32>;
    /// All metric ids registered under a category, in id order.
    fn metrics_for_category(&self, category_id: u32) -> Result<Vec<u32>>;
}

/// In-memory registry backed by concurrent maps and atomic id counters.
#[derive(Default)]
pub struct InMemoryRegistry {
    sources: DashMap<String, u32>,
    categories: DashMap<String, u32>,
    metrics: DashMap<(u32, String), u32>,
    next_source: AtomicU32,
    next_category: AtomicU32,
    next_metric: AtomicU32,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(map: &DashMap<String, u32>, counter: &AtomicU32, name: &str) -> u32 {
        if let Some(id) = map.get(name) {
            return *id;
        }
        *map.entry(name.to_string())
            .or_insert_with(|| counter.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl MetricRegistry for InMemoryRegistry {
    fn get_or_add_source(&self, name: &str) -> Result<u32> {
        Ok(Self::resolve(&self.sources, &self.next_source, name))
    }

    fn get_or_add_category(&self, name: &str) -> Result<u32> {
        Ok(Self::resolve(&self.categories, &self.next_category, name))
    }

    fn get_or_add_metric(&self, category_id: u32, name: &str) -> Result<u32> {
        let key = (category_id, name.to_string());
        if let Some(id) = self.metrics.get(&key) {
            return Ok(*id);
        }
        Ok(*self
            .metrics
            .entry(key)
            .or_insert_with(|| self.next_metric.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn metrics_for_category(&self, category_id: u32) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .metrics
            .iter()
            .filter(|entry| entry.key().0 == category_id)
            .map(|entry| *entry.value())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_is_idempotent() {
        let registry = InMemoryRegistry::new();
        let a = registry.get_or_add_source("router-1").unwrap();
        let b = registry.get_or_add_source("router-1").unwrap();
        let c = registry.get_or_add_source("router-2").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_metrics_scoped_by_category() {
        let registry = InMemoryRegistry::new();
        let cat_a = registry.get_or_add_category("bandwidth").unwrap();
        let cat_b = registry.get_or_add_category("storage").unwrap();

        let m1 = registry.get_or_add_metric(cat_a, "bytes").unwrap();
        let m2 = registry.get_or_add_metric(cat_b, "bytes").unwrap();
        assert_ne!(m1, m2);

        assert_eq!(registry.metrics_for_category(cat_a).unwrap(), vec![m1]);
        assert_eq!(registry.metrics_for_category(cat_b).unwrap(), vec![m2]);
    }

    #[test]
    fn test_concurrent_resolution_yields_one_id() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(InMemoryRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                registry.get_or_add_source("shared").unwrap()
            }));
        }

        let ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
