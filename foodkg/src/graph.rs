//! Graph fact source: the read interface onto the food knowledge graph
//!
//! The graph owns every `FoodRecord`. Search and recognition only read from it.
//! `MemoryGraph` serves tests and small embedded catalogs, `SqliteGraph` (database.rs)
//! a persistent one.

use crate::models::{FoodCategory, FoodRecord, ImageRef, NutrientRange};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Graph unavailable: {0}")]
    Unavailable(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Read operations the core needs from the knowledge graph.
///
/// Lookups that miss return `Ok(None)`; errors are reserved for an unreachable backend.
pub trait GraphFactSource: Send + Sync {
    /// Every food, ordered by name
    fn get_all(&self) -> GraphResult<Vec<FoodRecord>>;

    /// Foods whose class id is `category`, ordered by name
    fn get_by_category(&self, category: &str) -> GraphResult<Vec<FoodRecord>>;

    /// Foods inside the range, ordered by ascending calories
    fn get_by_nutritional_range(&self, range: &NutrientRange) -> GraphResult<Vec<FoodRecord>>;

    /// The full record including ingredients and images
    fn get_detail(&self, uri: &str) -> GraphResult<Option<FoodRecord>>;

    fn get_images(&self, uri: &str) -> GraphResult<Vec<ImageRef>>;

    fn get_ingredients(&self, uri: &str) -> GraphResult<Vec<String>>;

    /// Distinct classes, ordered by label
    fn list_categories(&self) -> GraphResult<Vec<FoodCategory>>;

    /// Distinct group names, ordered
    fn list_groups(&self) -> GraphResult<Vec<String>>;

    /// Case-insensitive exact match on name
    fn resolve_uri_by_exact_name(&self, name: &str) -> GraphResult<Option<String>>;

    /// Case-insensitive containment match on name; the shortest matching name wins
    fn resolve_uri_by_name_contains(&self, name: &str) -> GraphResult<Option<String>>;
}

/// Exact match first, containment second.
pub(crate) fn resolve_exact_then_contains(
    graph: &dyn GraphFactSource,
    name: &str,
) -> GraphResult<Option<String>> {
    if name.trim().is_empty() {
        return Ok(None);
    }
    if let Some(uri) = graph.resolve_uri_by_exact_name(name)? {
        return Ok(Some(uri));
    }
    graph.resolve_uri_by_name_contains(name)
}

// ─────────────────────────────────────────────────────────────────────────────
// IN-MEMORY GRAPH
// ─────────────────────────────────────────────────────────────────────────────

/// A `GraphFactSource` over a fixed set of records.
///
/// Listing operations return summaries (no ingredients or images), like the graph
/// queries they stand in for; `get_detail` returns the full record.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    records: Vec<FoodRecord>,
    categories: BTreeSet<FoodCategory>,
    groups: BTreeSet<String>,
}

impl MemoryGraph {
    pub fn new(records: Vec<FoodRecord>) -> Self {
        let categories = records
            .iter()
            .filter_map(|r| {
                let id = r.category.clone()?;
                let label = r.category_label.clone().unwrap_or_else(|| id.clone());
                Some(FoodCategory { id, label })
            })
            .collect();
        let groups = records.iter().filter_map(|r| r.group.clone()).collect();
        Self { records, categories, groups }
    }

    /// Register a class that no record belongs to yet
    pub fn with_category(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.categories.insert(FoodCategory { id: id.into(), label: label.into() });
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn summaries<'a>(&'a self, keep: impl Fn(&FoodRecord) -> bool + 'a) -> Vec<FoodRecord> {
        let mut out: Vec<FoodRecord> = self
            .records
            .iter()
            .filter(|r| keep(r))
            .map(|r| FoodRecord {
                ingredients: Vec::new(),
                images: Vec::new(),
                search_score: None,
                ..r.clone()
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn find(&self, uri: &str) -> Option<&FoodRecord> {
        self.records.iter().find(|r| r.uri == uri)
    }
}

impl GraphFactSource for MemoryGraph {
    fn get_all(&self) -> GraphResult<Vec<FoodRecord>> {
        Ok(self.summaries(|_| true))
    }

    fn get_by_category(&self, category: &str) -> GraphResult<Vec<FoodRecord>> {
        Ok(self.summaries(|r| r.category.as_deref() == Some(category)))
    }

    fn get_by_nutritional_range(&self, range: &NutrientRange) -> GraphResult<Vec<FoodRecord>> {
        let range = *range;
        let mut out = self.summaries(move |r| range.admits(&r.nutrients));
        // Stable sort keeps name order among equal calorie values; missing values go last
        out.sort_by(|a, b| match (a.nutrients.calories, b.nutrients.calories) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Ok(out)
    }

    fn get_detail(&self, uri: &str) -> GraphResult<Option<FoodRecord>> {
        Ok(self.find(uri).map(|r| FoodRecord { search_score: None, ..r.clone() }))
    }

    fn get_images(&self, uri: &str) -> GraphResult<Vec<ImageRef>> {
        Ok(self.find(uri).map(|r| r.images.clone()).unwrap_or_default())
    }

    fn get_ingredients(&self, uri: &str) -> GraphResult<Vec<String>> {
        Ok(self.find(uri).map(|r| r.ingredients.clone()).unwrap_or_default())
    }

    fn list_categories(&self) -> GraphResult<Vec<FoodCategory>> {
        let mut categories: Vec<FoodCategory> = self.categories.iter().cloned().collect();
        categories.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));
        categories.dedup_by(|a, b| a.id == b.id);
        Ok(categories)
    }

    fn list_groups(&self) -> GraphResult<Vec<String>> {
        Ok(self.groups.iter().cloned().collect())
    }

    fn resolve_uri_by_exact_name(&self, name: &str) -> GraphResult<Option<String>> {
        let needle = name.trim().to_lowercase();
        Ok(self
            .records
            .iter()
            .find(|r| r.name.to_lowercase() == needle)
            .map(|r| r.uri.clone()))
    }

    fn resolve_uri_by_name_contains(&self, name: &str) -> GraphResult<Option<String>> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .min_by_key(|r| r.name.chars().count())
            .map(|r| r.uri.clone()))
    }
}
