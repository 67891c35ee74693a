use std::fmt::Debug;

use globset::GlobBuilder;
use globset::GlobMatcher;

use crate::error::CacheError;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Relationship,
}

/// Refines what a read hydrates.
pub trait CacheFilter: Debug + Send + Sync {
    /// Returns the subset of `names` that should be loaded.
    fn filter(&self, filter_type: FilterType, names: &[String]) -> Vec<String>;

    fn accepts(&self, filter_type: FilterType, name: &str) -> bool {
        !self.filter(filter_type, &[name.to_string()]).is_empty()
    }
}

/// Restricts hydrated relationships to those whose type starts with one of the allowed prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipCacheFilter {
    allowed_prefixes: Vec<String>,
}

impl RelationshipCacheFilter {
    /// No relationships are hydrated.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn include<S: ToString>(prefixes: &[S]) -> Self {
        Self {
            allowed_prefixes: prefixes.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn allowed_prefixes(&self) -> &[String] {
        &self.allowed_prefixes
    }
}

impl CacheFilter for RelationshipCacheFilter {
    fn filter(&self, filter_type: FilterType, names: &[String]) -> Vec<String> {
        match filter_type {
            FilterType::Relationship => names
                .iter()
                .filter(|name| self.allowed_prefixes.iter().any(|p| name.starts_with(p.as_str())))
                .cloned()
                .collect(),
        }
    }
}

/// Applies an optional filter to relationship names.
pub fn relationship_names(filter: Option<&dyn CacheFilter>, names: Vec<String>) -> Vec<String> {
    match filter {
        Some(filter) => filter.filter(FilterType::Relationship, &names),
        None => names,
    }
}

/// Compiles an identifier glob. The separator has no special meaning, so `*` spans key segments.
pub fn compile_glob(glob: &str) -> Result<GlobMatcher> {
    Ok(GlobBuilder::new(glob)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map_err(|err| CacheError::key_format(glob, err))?
        .compile_matcher())
}
