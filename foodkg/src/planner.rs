//! Hybrid query planner
//!
//! Blank-text queries go straight to the graph and are complete. Text queries go through the
//! index and are bounded by `text_overfetch`. Both paths are enriched from the graph, sorted
//! and paginated the same way.

use crate::graph::{resolve_exact_then_contains, GraphFactSource};
use crate::interface::{FoodKgError, SearchPage, SearchQuery, SortDirection, SortKey};
use crate::models::{FoodRecord, NutrientRange};
use crate::text_index::TextIndex;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on index candidates for a text query
pub const DEFAULT_TEXT_OVERFETCH: usize = 100;

/// Which retrieval path served a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPath {
    GraphCategory,
    GraphRange,
    GraphAll,
    TextIndex,
}

pub struct QueryPlanner {
    graph: Arc<dyn GraphFactSource>,
    index: Arc<TextIndex>,
    text_overfetch: usize,
}

impl QueryPlanner {
    pub fn new(graph: Arc<dyn GraphFactSource>, index: Arc<TextIndex>) -> Self {
        Self {
            graph,
            index,
            text_overfetch: DEFAULT_TEXT_OVERFETCH,
        }
    }

    pub fn with_text_overfetch(mut self, overfetch: usize) -> Self {
        self.text_overfetch = overfetch;
        self
    }

    pub fn graph(&self) -> &dyn GraphFactSource {
        self.graph.as_ref()
    }

    /// Run a search. Backend failures become an empty page at the requested position;
    /// only cancellation is reported as an error.
    pub fn search_foods(&self, query: &SearchQuery, token: &CancellationToken) -> Result<SearchPage, FoodKgError> {
        match self.try_search(query, token) {
            Ok(page) => Ok(page),
            Err(FoodKgError::Cancelled) => Err(FoodKgError::Cancelled),
            Err(e) => {
                warn!(error = %e, "search failed, returning empty page");
                Ok(SearchPage::empty(query.page, query.size))
            }
        }
    }

    fn try_search(&self, query: &SearchQuery, token: &CancellationToken) -> Result<SearchPage, FoodKgError> {
        #[cfg(feature = "perf-log")]
        let started = std::time::Instant::now();

        let (path, candidates) = self.retrieve(query)?;
        debug!(?path, candidates = candidates.len(), "retrieved candidates");

        let mut foods = self.enrich(candidates, token)?;
        sort_foods(&mut foods, query.sort_by, query.sort_direction);

        #[cfg(feature = "perf-log")]
        debug!(elapsed_ms = started.elapsed().as_secs_f64() * 1000.0, ?path, "search timing");

        Ok(SearchPage::paginate(foods, query.page, query.size))
    }

    /// Pick the retrieval path and fetch unenriched candidates
    pub fn retrieve(&self, query: &SearchQuery) -> Result<(RetrievalPath, Vec<FoodRecord>), FoodKgError> {
        let range = query.nutrient_range();
        let Some(text) = query.text_query() else {
            if let Some(category) = query.category_filter() {
                return Ok((RetrievalPath::GraphCategory, self.graph.get_by_category(category)?));
            }
            if !range.is_empty() {
                return Ok((RetrievalPath::GraphRange, self.graph.get_by_nutritional_range(&range)?));
            }
            return Ok((RetrievalPath::GraphAll, self.graph.get_all()?));
        };

        let mut hits = self.index.search_advanced(
            Some(text),
            query.category_filter(),
            query.group_filter(),
            range.min_calories,
            range.max_calories,
            self.text_overfetch,
        )?;
        // Protein is not part of the index query
        if range.constrains_protein() {
            let protein = NutrientRange::protein(range.min_protein, range.max_protein);
            hits.retain(|r| protein.admits(&r.nutrients));
        }
        Ok((RetrievalPath::TextIndex, hits))
    }

    /// Swap each candidate for its full graph record, keeping the relevance score.
    /// A failed or empty lookup keeps the candidate as it is.
    fn enrich(&self, candidates: Vec<FoodRecord>, token: &CancellationToken) -> Result<Vec<FoodRecord>, FoodKgError> {
        let mut enriched = Vec::with_capacity(candidates.len());
        let mut misses = 0usize;
        for candidate in candidates {
            if token.is_cancelled() {
                return Err(FoodKgError::Cancelled);
            }
            match self.graph.get_detail(&candidate.uri) {
                Ok(Some(detail)) => enriched.push(FoodRecord {
                    search_score: candidate.search_score,
                    ..detail
                }),
                Ok(None) => {
                    misses += 1;
                    enriched.push(candidate);
                }
                Err(e) => {
                    debug!(uri = %candidate.uri, error = %e, "enrichment failed, keeping summary");
                    misses += 1;
                    enriched.push(candidate);
                }
            }
        }
        if misses > 0 {
            debug!(misses, "some candidates were not enriched");
        }
        Ok(enriched)
    }

    /// Resolve a display name to a food uri.
    ///
    /// Tries the name as given (exact, then containment), then the same tiers on a normalized form.
    pub fn find_food_uri_by_name(&self, name: &str) -> Option<String> {
        let lookup = |candidate: &str| match resolve_exact_then_contains(self.graph.as_ref(), candidate) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(name = candidate, error = %e, "name resolution failed");
                None
            }
        };
        if let Some(uri) = lookup(name) {
            return Some(uri);
        }
        let normalized = normalize_name(name);
        if normalized != name.trim() {
            return lookup(&normalized);
        }
        None
    }

    /// First resolvable name from `names`
    pub fn find_food_uri_by_name_variants(&self, names: &[String]) -> Option<String> {
        names.iter().find_map(|name| self.find_food_uri_by_name(name))
    }
}

/// Lowercase, turn `_` and `-` into spaces, collapse whitespace
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable sort by `key`. Records without the key go last in either direction.
pub fn sort_foods(foods: &mut [FoodRecord], key: SortKey, direction: SortDirection) {
    let value = |record: &FoodRecord| match key {
        SortKey::Calories => record.nutrients.calories,
        SortKey::Protein => record.nutrients.protein,
        SortKey::Relevance | SortKey::Name => None,
    };
    let directed = |ordering: Ordering| match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    };
    match key {
        SortKey::Relevance => {}
        SortKey::Name => foods.sort_by(|a, b| directed(a.name.to_lowercase().cmp(&b.name.to_lowercase()))),
        SortKey::Calories | SortKey::Protein => foods.sort_by(|a, b| match (value(a), value(b)) {
            (Some(x), Some(y)) => directed(x.total_cmp(&y)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphError, GraphResult, MemoryGraph};
    use crate::models::{FoodCategory, ImageRef};

    fn records() -> Vec<FoodRecord> {
        vec![
            FoodRecord::new("u:banana", "Banana")
                .with_category("Fruit", "Fruit")
                .with_calories(89.0)
                .with_protein(1.1)
                .with_ingredients(["banana"]),
            FoodRecord::new("u:bread", "Bread")
                .with_category("Grain", "Grain")
                .with_calories(265.0)
                .with_protein(9.0),
        ]
    }

    fn planner() -> QueryPlanner {
        let index = Arc::new(TextIndex::in_memory());
        index.rebuild(&records()).unwrap();
        QueryPlanner::new(Arc::new(MemoryGraph::new(records())), index)
    }

    fn names(page: &SearchPage) -> Vec<&str> {
        page.foods.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_path_selection() {
        let p = planner();
        let by = |q: SearchQuery| p.retrieve(&q).unwrap().0;
        assert_eq!(by(SearchQuery::default()), RetrievalPath::GraphAll);
        assert_eq!(by(SearchQuery::default().with_category("Fruit")), RetrievalPath::GraphCategory);
        assert_eq!(by(SearchQuery::default().with_protein(Some(1.0), None)), RetrievalPath::GraphRange);
        assert_eq!(by(SearchQuery::text("bread")), RetrievalPath::TextIndex);
    }

    #[test]
    fn test_graph_only_calorie_range() {
        let q = SearchQuery::default().with_calories(Some(80.0), Some(100.0));
        let page = planner().search_foods(&q, &CancellationToken::new()).unwrap();
        assert_eq!(names(&page), vec!["Banana"]);
    }

    #[test]
    fn test_text_path_applies_protein_post_filter() {
        let q = SearchQuery::text("b").with_protein(Some(5.0), None);
        let page = planner().search_foods(&q, &CancellationToken::new()).unwrap();
        assert_eq!(names(&page), vec!["Bread"]);
    }

    #[test]
    fn test_enrichment_keeps_score() {
        let page = planner()
            .search_foods(&SearchQuery::text("banana"), &CancellationToken::new())
            .unwrap();
        assert_eq!(page.foods[0].ingredients, vec!["banana"]);
        assert!(page.foods[0].search_score.is_some());
    }

    #[test]
    fn test_enrichment_miss_keeps_candidate() {
        let index = Arc::new(TextIndex::in_memory());
        index.rebuild(&records()).unwrap();
        // The graph no longer knows about bread
        let graph = MemoryGraph::new(records().into_iter().take(1).collect());
        let p = QueryPlanner::new(Arc::new(graph), index);
        let page = p.search_foods(&SearchQuery::text("bread"), &CancellationToken::new()).unwrap();
        assert_eq!(names(&page), vec!["Bread"]);
        assert_eq!(page.foods[0].nutrients.calories, Some(265.0));
    }

    #[test]
    fn test_sorting_and_pagination() {
        let q = SearchQuery::default()
            .sorted_by(SortKey::Calories, SortDirection::Desc)
            .with_page(0, 1);
        let page = planner().search_foods(&q, &CancellationToken::new()).unwrap();
        assert_eq!(names(&page), vec!["Bread"]);
        assert_eq!(page.total_elements(), 2);
        assert_eq!(page.total_pages(), 2);
        assert!(page.has_next());
    }

    #[test]
    fn test_sort_missing_values_last() {
        let mut foods = vec![
            FoodRecord::new("u:1", "Water"),
            FoodRecord::new("u:2", "Rice").with_calories(130.0),
            FoodRecord::new("u:3", "apple").with_calories(52.0),
        ];
        sort_foods(&mut foods, SortKey::Calories, SortDirection::Desc);
        let order: Vec<&str> = foods.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, vec!["Rice", "apple", "Water"]);

        sort_foods(&mut foods, SortKey::Name, SortDirection::Asc);
        let order: Vec<&str> = foods.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, vec!["apple", "Rice", "Water"]);
    }

    #[test]
    fn test_cancelled_search_is_reported() {
        let token = CancellationToken::new();
        token.cancel();
        let result = planner().search_foods(&SearchQuery::default(), &token);
        assert!(matches!(result, Err(FoodKgError::Cancelled)));
    }

    struct BrokenGraph;

    impl GraphFactSource for BrokenGraph {
        fn get_all(&self) -> GraphResult<Vec<FoodRecord>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn get_by_category(&self, _: &str) -> GraphResult<Vec<FoodRecord>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn get_by_nutritional_range(&self, _: &NutrientRange) -> GraphResult<Vec<FoodRecord>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn get_detail(&self, _: &str) -> GraphResult<Option<FoodRecord>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn get_images(&self, _: &str) -> GraphResult<Vec<ImageRef>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn get_ingredients(&self, _: &str) -> GraphResult<Vec<String>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn list_categories(&self) -> GraphResult<Vec<FoodCategory>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn list_groups(&self) -> GraphResult<Vec<String>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn resolve_uri_by_exact_name(&self, _: &str) -> GraphResult<Option<String>> {
            Err(GraphError::Unavailable("down".into()))
        }
        fn resolve_uri_by_name_contains(&self, _: &str) -> GraphResult<Option<String>> {
            Err(GraphError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_backend_failure_yields_empty_page() {
        let p = QueryPlanner::new(Arc::new(BrokenGraph), Arc::new(TextIndex::in_memory()));
        let page = p
            .search_foods(&SearchQuery::default().with_page(3, 10), &CancellationToken::new())
            .unwrap();
        assert!(page.foods.is_empty());
        assert_eq!(page.page(), 3);
        assert_eq!(page.size(), 10);
        assert_eq!(page.total_elements(), 0);
        assert_eq!(p.find_food_uri_by_name("Banana"), None);
    }

    #[test]
    fn test_name_resolution_tiers() {
        let graph = MemoryGraph::new(vec![
            FoodRecord::new("u:pie", "Apple Pie"),
            FoodRecord::new("u:apple", "Apple"),
            FoodRecord::new("u:ice", "Ice Cream"),
        ]);
        let p = QueryPlanner::new(Arc::new(graph), Arc::new(TextIndex::in_memory()));
        assert_eq!(p.find_food_uri_by_name("Apple").as_deref(), Some("u:apple"));
        assert_eq!(p.find_food_uri_by_name("ICE_cream").as_deref(), Some("u:ice"));
        assert_eq!(p.find_food_uri_by_name("pie").as_deref(), Some("u:pie"));
        assert_eq!(p.find_food_uri_by_name("durian"), None);
        let variants = vec!["durian".to_string(), "ice-cream".to_string()];
        assert_eq!(p.find_food_uri_by_name_variants(&variants).as_deref(), Some("u:ice"));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Green_Tea-Latte  "), "green tea latte");
    }
}
