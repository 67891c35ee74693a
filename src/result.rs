use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::cache_data::CacheData;

/// Output of a single agent execution: cached entities grouped by type plus explicit evictions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheResult {
    cache_results: BTreeMap<String, Vec<CacheData>>,
    evictions:     BTreeMap<String, Vec<String>>,
}

impl CacheResult {
    pub fn new(cache_results: BTreeMap<String, Vec<CacheData>>, evictions: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            cache_results,
            evictions,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_results(cache_results: BTreeMap<String, Vec<CacheData>>) -> Self {
        Self::new(cache_results, BTreeMap::new())
    }

    pub fn cache_results(&self) -> &BTreeMap<String, Vec<CacheData>> {
        &self.cache_results
    }

    pub fn evictions(&self) -> &BTreeMap<String, Vec<String>> {
        &self.evictions
    }

    /// Entities of one type; empty if the type is absent from the result.
    pub fn items(&self, data_type: &str) -> &[CacheData] {
        self.cache_results.get(data_type).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn ids(&self, data_type: &str) -> BTreeSet<String> {
        self.items(data_type).iter().map(|item| item.id().to_string()).collect()
    }

    /// Every id mentioned by the result, either as an entity or as an eviction.
    pub fn touched_ids(&self) -> BTreeSet<String> {
        self.cache_results
            .values()
            .flatten()
            .map(|item| item.id().to_string())
            .chain(self.evictions.values().flatten().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.cache_results.values().all(Vec::is_empty) && self.evictions.values().all(Vec::is_empty)
    }

    pub fn item_count(&self) -> usize {
        self.cache_results.values().map(Vec::len).sum()
    }

    pub fn into_parts(self) -> (BTreeMap<String, Vec<CacheData>>, BTreeMap<String, Vec<String>>) {
        (self.cache_results, self.evictions)
    }
}
