//! FoodKG Public Interface Definition
//!
//! Request/response records exchanged with the API layer, the public error type,
//! and the service trait implemented by `FoodKgStore`.

use crate::models::{FoodCategory, FoodRecord, NutrientRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

pub const DEFAULT_PAGE_SIZE: usize = 20;

// ═══════════════════════════════════════════════════════════════════════════════
// ENUMS
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordering applied after retrieval. `Relevance` keeps retrieval order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Relevance,
    Name,
    Calories,
    Protein,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS (Structs)
// ═══════════════════════════════════════════════════════════════════════════════

/// A catalog search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchQuery {
    /// Free text. Blank text selects the graph-only path.
    pub query: Option<String>,
    pub category: Option<String>,
    pub group: Option<String>,
    #[validate(range(min = 0.0, max = 1000.0))]
    pub min_calories: Option<f64>,
    #[validate(range(min = 0.0, max = 1000.0))]
    pub max_calories: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_protein: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_protein: Option<f64>,
    pub page: usize,
    pub size: usize,
    pub sort_by: SortKey,
    pub sort_direction: SortDirection,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: None,
            category: None,
            group: None,
            min_calories: None,
            max_calories: None,
            min_protein: None,
            max_protein: None,
            page: 0,
            size: DEFAULT_PAGE_SIZE,
            sort_by: SortKey::default(),
            sort_direction: SortDirection::default(),
        }
    }
}

impl SearchQuery {
    pub fn text(query: impl Into<String>) -> Self {
        Self { query: Some(query.into()), ..Default::default() }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_calories(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_calories = min;
        self.max_calories = max;
        self
    }

    pub fn with_protein(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_protein = min;
        self.max_protein = max;
        self
    }

    pub fn with_page(mut self, page: usize, size: usize) -> Self {
        self.page = page;
        self.size = size;
        self
    }

    pub fn sorted_by(mut self, key: SortKey, direction: SortDirection) -> Self {
        self.sort_by = key;
        self.sort_direction = direction;
        self
    }

    /// Field-range validation plus the page size bounds
    pub fn check(&self, max_page_size: usize) -> Result<(), FoodKgError> {
        self.validate()?;
        if self.size == 0 || self.size > max_page_size {
            return Err(FoodKgError::InvalidInput(format!(
                "page size must be between 1 and {}, got {}",
                max_page_size, self.size
            )));
        }
        for (name, min, max) in [
            ("calories", self.min_calories, self.max_calories),
            ("protein", self.min_protein, self.max_protein),
        ] {
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    return Err(FoodKgError::InvalidInput(format!(
                        "minimum {} exceeds maximum ({} > {})",
                        name, min, max
                    )));
                }
            }
        }
        Ok(())
    }

    /// Trimmed free text, or None when blank
    pub fn text_query(&self) -> Option<&str> {
        non_blank(self.query.as_deref())
    }

    pub fn category_filter(&self) -> Option<&str> {
        non_blank(self.category.as_deref())
    }

    pub fn group_filter(&self) -> Option<&str> {
        non_blank(self.group.as_deref())
    }

    pub fn nutrient_range(&self) -> NutrientRange {
        NutrientRange {
            min_calories: self.min_calories,
            max_calories: self.max_calories,
            min_protein: self.min_protein,
            max_protein: self.max_protein,
        }
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// One page of search results.
///
/// The derived fields are computed by `SearchPage::new` and only readable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub foods: Vec<FoodRecord>,
    total_elements: usize,
    page: usize,
    size: usize,
    total_pages: usize,
    has_next: bool,
    has_previous: bool,
}

impl SearchPage {
    pub fn new(foods: Vec<FoodRecord>, total_elements: usize, page: usize, size: usize) -> Self {
        let total_pages = total_elements.div_ceil(size.max(1));
        Self {
            foods,
            total_elements,
            page,
            size,
            total_pages,
            has_next: page.saturating_add(1) < total_pages,
            has_previous: page > 0,
        }
    }

    pub fn total_elements(&self) -> usize {
        self.total_elements
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn has_next(&self) -> bool {
        self.has_next
    }

    pub fn has_previous(&self) -> bool {
        self.has_previous
    }

    pub fn empty(page: usize, size: usize) -> Self {
        Self::new(Vec::new(), 0, page, size)
    }

    /// Slice `foods` down to the requested page. Out-of-range pages yield an empty slice.
    pub fn paginate(foods: Vec<FoodRecord>, page: usize, size: usize) -> Self {
        let total = foods.len();
        let start = page.saturating_mul(size).min(total);
        let end = start.saturating_add(size).min(total);
        let slice = foods.into_iter().skip(start).take(end - start).collect();
        Self::new(slice, total, page, size)
    }
}

/// Text index statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    /// Live documents
    pub total_documents: u64,
    /// All document slots, including deleted ones
    pub max_documents: u64,
    pub deleted_documents: u64,
    pub index_valid: bool,
    pub last_rebuilt_unix: Option<i64>,
}

/// One recognized category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodRecognition {
    /// Category directory name with underscores turned into spaces
    pub predicted_name: String,
    pub category: String,
    pub confidence: f64,
    pub best_file: String,
    pub images_sampled: usize,
    pub food: Option<FoodRecord>,
    pub ingredients: Vec<String>,
}

/// Outcome of a recognition request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub results: Vec<FoodRecognition>,
    pub image_processed: bool,
    /// Categories whose best match cleared the noise floor
    pub total_predictions: usize,
    /// Categories returned after the confidence filter
    pub filtered_predictions: usize,
}

/// Error type for FoodKG operations
#[derive(Debug, Error)]
pub enum FoodKgError {
    #[error("Index error: {0}")]
    IndexError(String),
    #[error("Graph error: {0}")]
    GraphError(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Image corpus unavailable: {0}")]
    CorpusUnavailable(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Operation cancelled")]
    Cancelled,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVICE INTERFACE
// ═══════════════════════════════════════════════════════════════════════════════

/// The operations the API layer consumes. Implemented by `FoodKgStore`.
#[async_trait::async_trait]
pub trait FoodKgApi: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────────
    // Search
    // ─────────────────────────────────────────────────────────────────────────────

    /// Hybrid text + structured search. Backend failures yield an empty page.
    async fn search(&self, query: SearchQuery) -> Result<SearchPage, FoodKgError>;

    /// Name suggestions for a typed prefix. Never fails.
    fn autocomplete(&self, prefix: &str, max_suggestions: usize) -> Vec<String>;

    fn index_stats(&self) -> IndexStats;

    /// Rebuild the text index from the graph. Returns the number of indexed documents.
    async fn rebuild_index(&self) -> Result<u64, FoodKgError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Recognition
    // ─────────────────────────────────────────────────────────────────────────────

    async fn recognize(
        &self,
        image: Vec<u8>,
        confidence_threshold: f64,
        max_results: usize,
    ) -> Result<RecognitionResult, FoodKgError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Graph passthrough
    // ─────────────────────────────────────────────────────────────────────────────

    fn food_details(&self, uri: &str) -> Result<Option<FoodRecord>, FoodKgError>;

    fn categories(&self) -> Result<Vec<FoodCategory>, FoodKgError>;

    fn groups(&self) -> Result<Vec<String>, FoodKgError>;

    fn find_food_uri_by_name(&self, name: &str) -> Option<String>;

    fn find_food_uri_by_name_variants(&self, names: &[String]) -> Option<String>;
}

impl From<crate::text_index::IndexError> for FoodKgError {
    fn from(e: crate::text_index::IndexError) -> Self {
        FoodKgError::IndexError(e.to_string())
    }
}

impl From<crate::graph::GraphError> for FoodKgError {
    fn from(e: crate::graph::GraphError) -> Self {
        FoodKgError::GraphError(e.to_string())
    }
}

impl From<crate::matcher::RecognitionError> for FoodKgError {
    fn from(e: crate::matcher::RecognitionError) -> Self {
        use crate::matcher::RecognitionError;
        match e {
            RecognitionError::Decode(_) => FoodKgError::InvalidInput(e.to_string()),
            RecognitionError::CorpusMissing(_) | RecognitionError::Io(_) => {
                FoodKgError::CorpusUnavailable(e.to_string())
            }
            RecognitionError::Cancelled => FoodKgError::Cancelled,
        }
    }
}

impl From<validator::ValidationErrors> for FoodKgError {
    fn from(e: validator::ValidationErrors) -> Self {
        FoodKgError::InvalidInput(e.to_string())
    }
}
