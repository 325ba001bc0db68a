//! FoodKgStore - process-level facade over the graph, the text index and the image matcher
//!
//! Async Cancellation Architecture:
//! Search and recognition run on `spawn_blocking` threads. Each call creates a
//! CancellationToken held by a DropGuard; when the caller drops the future (a timeout,
//! a disconnected client) the guard cancels the token, and the blocking work stops at its
//! next checkpoint: between enrichment lookups in the planner, between category scans in
//! the matcher. Index rebuilds ignore the token and always run to completion.

use crate::config::FoodKgConfig;
use crate::database::SqliteGraph;
use crate::graph::GraphFactSource;
use crate::interface::{
    FoodKgApi, FoodKgError, IndexStats, RecognitionResult, SearchPage, SearchQuery,
};
use crate::matcher::VisualMatcher;
use crate::models::{FoodCategory, FoodRecord};
use crate::planner::QueryPlanner;
use crate::text_index::TextIndex;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Global fallback Tokio runtime for when async functions are called outside any runtime context.
/// Shared across all stores and never dropped.
static FALLBACK_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create fallback tokio runtime")
});

static RAYON_INIT: Once = Once::new();

/// Initialize global Rayon thread pool with core reservation and lower priority
fn init_rayon() {
    RAYON_INIT.call_once(|| {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        // Leave cores for the Tokio workers serving search requests
        let rayon_threads = num_threads.saturating_sub(2).max(1);

        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(rayon_threads)
            .thread_name(|i| format!("foodkg-scan-{}", i))
            .start_handler(|_| {
                use thread_priority::*;
                let _ = set_current_thread_priority(ThreadPriority::Min);
            })
            .build_global();
    });
}

/// RAII guard that cancels a token when dropped
struct DropGuard {
    token: CancellationToken,
}

impl DropGuard {
    fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Food search and recognition service
///
/// Concurrency Model:
/// - The graph source is shared read-only (SQLite behind an r2d2 pool, or in memory)
/// - The text index swaps whole generations; readers never block each other
/// - Blocking work runs on the runtime's blocking pool, category scans on rayon
pub struct FoodKgStore {
    config: FoodKgConfig,
    graph: Arc<dyn GraphFactSource>,
    index: Arc<TextIndex>,
    planner: Arc<QueryPlanner>,
    matcher: Arc<VisualMatcher>,
    indexed_at_startup: bool,
}

impl FoodKgStore {
    /// Build a store over `graph`, indexing it if no valid index generation exists yet.
    pub fn open(config: FoodKgConfig, graph: Arc<dyn GraphFactSource>) -> Result<Self, FoodKgError> {
        config.validate()?;
        init_rayon();

        let index = match config.index_root() {
            Some(path) => TextIndex::open(path)?,
            None => TextIndex::in_memory(),
        };
        let index = Arc::new(index);
        let planner = QueryPlanner::new(Arc::clone(&graph), Arc::clone(&index))
            .with_text_overfetch(config.search.text_overfetch);
        let matcher = VisualMatcher::new(config.images_base_path.clone())
            .with_per_category_cap(config.recognition.per_category_cap)
            .with_noise_floor(config.recognition.noise_floor)
            .with_parallel(config.recognition.parallel);

        let mut store = Self {
            config,
            graph,
            index,
            planner: Arc::new(planner),
            matcher: Arc::new(matcher),
            indexed_at_startup: false,
        };
        store.indexed_at_startup = store.rebuild_index_if_needed()?;
        Ok(store)
    }

    /// Open the SQLite graph named by `config.database_path`
    pub fn open_with_database(config: FoodKgConfig) -> Result<Self, FoodKgError> {
        let path = config
            .database_path
            .clone()
            .ok_or_else(|| FoodKgError::ConfigError("database_path is not set".into()))?;
        let graph = SqliteGraph::open(path)?;
        Self::open(config, Arc::new(graph))
    }

    /// In-memory index over `graph`, reading reference images from `images_base_path`
    pub fn in_memory(graph: Arc<dyn GraphFactSource>, images_base_path: impl Into<PathBuf>) -> Result<Self, FoodKgError> {
        Self::open(FoodKgConfig::in_memory(images_base_path), graph)
    }

    pub fn config(&self) -> &FoodKgConfig {
        &self.config
    }

    /// Whether a committed index generation is live
    pub fn is_index_valid(&self) -> bool {
        self.index.is_valid()
    }

    /// Whether `open` had to build the index from the graph
    pub fn indexed_at_startup(&self) -> bool {
        self.indexed_at_startup
    }

    /// Directory of the live index generation, when it is on disk
    pub fn index_location(&self) -> Option<PathBuf> {
        self.index.live_path()
    }

    /// Get a tokio runtime handle - uses current runtime if available, otherwise global fallback
    fn runtime_handle(&self) -> tokio::runtime::Handle {
        tokio::runtime::Handle::try_current()
            .unwrap_or_else(|_| FALLBACK_RUNTIME.handle().clone())
    }

    /// Index the graph at startup when there is no usable index.
    /// An unreachable graph is logged and leaves the index invalid instead of failing startup.
    /// Returns whether a rebuild ran.
    fn rebuild_index_if_needed(&self) -> Result<bool, FoodKgError> {
        if self.index.is_valid() {
            return Ok(false);
        }
        let records = match self.graph.get_all() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "graph unavailable at startup, text index left empty");
                return Ok(false);
            }
        };
        let docs = self.index.rebuild(&records)?;
        info!(docs, "indexed graph at startup");
        Ok(true)
    }

    /// Run `work` on the blocking pool with a token that is cancelled if this future is dropped.
    async fn run_blocking<T, F>(&self, work: F) -> Result<T, FoodKgError>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, FoodKgError> + Send + 'static,
    {
        let token = CancellationToken::new();
        let _guard = DropGuard::new(token.clone());
        let token_clone = token.clone();

        let handle = self.runtime_handle().spawn_blocking(move || work(token_clone));
        match handle.await {
            Ok(result) => result,
            // JoinError means the task panicked or was aborted
            Err(_join_error) => Err(FoodKgError::Cancelled),
        }
    }
}

#[async_trait::async_trait]
impl FoodKgApi for FoodKgStore {
    async fn search(&self, query: SearchQuery) -> Result<SearchPage, FoodKgError> {
        query.check(self.config.search.max_page_size)?;
        let planner = Arc::clone(&self.planner);
        self.run_blocking(move |token| planner.search_foods(&query, &token)).await
    }

    /// `max_suggestions == 0` uses the configured default
    fn autocomplete(&self, prefix: &str, max_suggestions: usize) -> Vec<String> {
        let max = if max_suggestions == 0 {
            self.config.search.autocomplete_max
        } else {
            max_suggestions
        };
        self.index.autocomplete(prefix, max)
    }

    fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    async fn rebuild_index(&self) -> Result<u64, FoodKgError> {
        let graph = Arc::clone(&self.graph);
        let index = Arc::clone(&self.index);
        self.run_blocking(move |_token| {
            let records = graph.get_all()?;
            Ok(index.rebuild(&records)?)
        })
        .await
    }

    async fn recognize(
        &self,
        image: Vec<u8>,
        confidence_threshold: f64,
        max_results: usize,
    ) -> Result<RecognitionResult, FoodKgError> {
        if image.is_empty() {
            return Err(FoodKgError::InvalidInput("image is empty".into()));
        }
        if !confidence_threshold.is_finite() {
            return Err(FoodKgError::InvalidInput("confidence threshold must be finite".into()));
        }
        let max_results = if max_results == 0 {
            self.config.recognition.default_max_results
        } else {
            max_results
        };
        let matcher = Arc::clone(&self.matcher);
        let graph = Arc::clone(&self.graph);
        self.run_blocking(move |token| {
            Ok(matcher.recognize(&image, confidence_threshold, max_results, graph.as_ref(), &token)?)
        })
        .await
    }

    fn food_details(&self, uri: &str) -> Result<Option<FoodRecord>, FoodKgError> {
        Ok(self.graph.get_detail(uri)?)
    }

    fn categories(&self) -> Result<Vec<FoodCategory>, FoodKgError> {
        Ok(self.graph.list_categories()?)
    }

    fn groups(&self) -> Result<Vec<String>, FoodKgError> {
        Ok(self.graph.list_groups()?)
    }

    fn find_food_uri_by_name(&self, name: &str) -> Option<String> {
        self.planner.find_food_uri_by_name(name)
    }

    fn find_food_uri_by_name_variants(&self, names: &[String]) -> Option<String> {
        self.planner.find_food_uri_by_name_variants(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn store() -> FoodKgStore {
        let graph = MemoryGraph::new(vec![
            FoodRecord::new("u:banana", "Banana").with_category("Fruit", "Fruit").with_calories(89.0),
            FoodRecord::new("u:bread", "Bread").with_category("Grain", "Grain").with_calories(265.0),
        ]);
        FoodKgStore::in_memory(Arc::new(graph), "/nonexistent/images").unwrap()
    }

    #[test]
    fn test_startup_indexes_graph() {
        let store = store();
        assert!(store.is_index_valid());
        assert_eq!(store.index_stats().total_documents, 2);
        assert!(store.index_location().is_none());
    }

    #[test]
    fn test_in_memory_index_flag_overrides_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FoodKgConfig::in_memory("/nonexistent/images");
        config.index_path = Some(dir.path().join("index"));
        config.in_memory_index = true;
        let graph = MemoryGraph::new(vec![FoodRecord::new("u:banana", "Banana")]);
        let store = FoodKgStore::open(config, Arc::new(graph)).unwrap();
        assert!(store.is_index_valid());
        assert!(store.indexed_at_startup());
        assert!(store.index_location().is_none());
        assert!(!dir.path().join("index").exists());
    }

    #[test]
    fn test_reopened_index_is_not_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FoodKgConfig::in_memory("/nonexistent/images");
        config.index_path = Some(dir.path().join("index"));
        let graph: Arc<dyn GraphFactSource> =
            Arc::new(MemoryGraph::new(vec![FoodRecord::new("u:banana", "Banana")]));

        let first = FoodKgStore::open(config.clone(), Arc::clone(&graph)).unwrap();
        assert!(first.indexed_at_startup());
        drop(first);

        let second = FoodKgStore::open(config, graph).unwrap();
        assert!(!second.indexed_at_startup());
        assert_eq!(second.index_stats().total_documents, 1);
    }

    #[test]
    fn test_drop_guard_cancels_token() {
        let token = CancellationToken::new();
        {
            let _guard = DropGuard::new(token.clone());
            assert!(!token.is_cancelled());
        }
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_search_outside_runtime_uses_fallback() {
        let store = store();
        let page = FALLBACK_RUNTIME
            .block_on(store.search(SearchQuery::text("bread")))
            .unwrap();
        assert_eq!(page.foods.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_search_does_not_poison_store() {
        let store = store();
        let pending = store.search(SearchQuery::text("banana"));
        drop(pending);
        let page = store.search(SearchQuery::text("banana")).await.unwrap();
        assert_eq!(page.foods[0].uri, "u:banana");
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let store = store();
        let oversized = SearchQuery::default().with_page(0, 10_000);
        assert!(matches!(store.search(oversized).await, Err(FoodKgError::InvalidInput(_))));
        assert!(matches!(store.recognize(Vec::new(), 0.5, 3).await, Err(FoodKgError::InvalidInput(_))));
        assert!(matches!(
            store.recognize(vec![1, 2, 3], f64::NAN, 3).await,
            Err(FoodKgError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_open_with_database_requires_path() {
        let config = FoodKgConfig::in_memory("/nonexistent");
        assert!(matches!(
            FoodKgStore::open_with_database(config),
            Err(FoodKgError::ConfigError(_))
        ));
    }
}
