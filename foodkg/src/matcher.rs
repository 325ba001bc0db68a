//! Visual similarity matcher
//!
//! Scans a corpus laid out as `<root>/<category>/<image files>` and ranks categories by their
//! single best histogram match against the uploaded photo.

use crate::graph::{resolve_exact_then_contains, GraphFactSource};
use crate::histogram::ImageHistogram;
use crate::interface::{FoodRecognition, RecognitionResult};
use crate::models::FoodRecord;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raster formats accepted from the corpus (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

pub const DEFAULT_PER_CATEGORY_CAP: usize = 70;
pub const DEFAULT_NOISE_FLOOR: f64 = 0.1;

const PLACEHOLDER_INGREDIENT: &str = "natural components";

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("Unsupported or corrupt image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Image corpus not found: {}", .0.display())]
    CorpusMissing(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Recognition cancelled")]
    Cancelled,
}

pub type MatchResult<T> = Result<T, RecognitionError>;

/// Best file of one category for one request
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryBestMatch {
    pub category: String,
    pub best_file: String,
    pub similarity: f64,
    pub images_sampled: usize,
}

impl CategoryBestMatch {
    /// Keep whichever of the two is the better match; earlier wins ties.
    fn max(self, other: Self) -> Self {
        if other.similarity > self.similarity { other } else { self }
    }
}

pub struct VisualMatcher {
    corpus_root: PathBuf,
    per_category_cap: usize,
    noise_floor: f64,
    parallel: bool,
}

impl VisualMatcher {
    pub fn new(corpus_root: impl Into<PathBuf>) -> Self {
        Self {
            corpus_root: corpus_root.into(),
            per_category_cap: DEFAULT_PER_CATEGORY_CAP,
            noise_floor: DEFAULT_NOISE_FLOOR,
            parallel: true,
        }
    }

    pub fn with_per_category_cap(mut self, cap: usize) -> Self {
        self.per_category_cap = cap;
        self
    }

    pub fn with_noise_floor(mut self, floor: f64) -> Self {
        self.noise_floor = floor;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn corpus_root(&self) -> &Path {
        &self.corpus_root
    }

    /// Best match per category above the noise floor, most similar first.
    pub fn scan(&self, query: &ImageHistogram, token: &CancellationToken) -> MatchResult<Vec<CategoryBestMatch>> {
        if !self.corpus_root.is_dir() {
            return Err(RecognitionError::CorpusMissing(self.corpus_root.clone()));
        }

        let mut categories: Vec<PathBuf> = std::fs::read_dir(&self.corpus_root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        categories.sort();

        let scan_one = |dir: &PathBuf| {
            if token.is_cancelled() {
                return None;
            }
            self.scan_category(dir, query, token)
        };
        let found: Vec<CategoryBestMatch> = if self.parallel {
            categories.par_iter().filter_map(scan_one).collect()
        } else {
            categories.iter().filter_map(scan_one).collect()
        };
        if token.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }

        // Only the best entry per category survives
        let mut best: HashMap<String, CategoryBestMatch> = HashMap::new();
        for candidate in found {
            let merged = match best.remove(&candidate.category) {
                Some(current) => current.max(candidate),
                None => candidate,
            };
            best.insert(merged.category.clone(), merged);
        }

        let mut ranked: Vec<CategoryBestMatch> = best
            .into_values()
            .filter(|m| m.similarity > self.noise_floor)
            .collect();
        ranked.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.category.cmp(&b.category))
        });
        Ok(ranked)
    }

    fn scan_category(&self, dir: &Path, query: &ImageHistogram, token: &CancellationToken) -> Option<CategoryBestMatch> {
        let category = dir.file_name()?.to_string_lossy().into_owned();
        let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && has_image_extension(path))
                .collect(),
            Err(e) => {
                warn!(category = %category, error = %e, "cannot list category directory");
                return None;
            }
        };
        files.sort();
        files.truncate(self.per_category_cap);

        let images_sampled = files.len();
        let mut best: Option<CategoryBestMatch> = None;
        for path in &files {
            if token.is_cancelled() {
                return None;
            }
            let histogram = match ImageHistogram::open(path) {
                Ok(histogram) => histogram,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping undecodable corpus image");
                    continue;
                }
            };
            let candidate = CategoryBestMatch {
                category: category.clone(),
                best_file: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                similarity: query.similarity(&histogram),
                images_sampled,
            };
            best = Some(match best {
                Some(current) => current.max(candidate),
                None => candidate,
            });
        }

        if let Some(found) = &best {
            debug!(
                category = %found.category,
                file = %found.best_file,
                similarity = found.similarity,
                "category best match"
            );
        }
        best
    }

    /// Identify the food categories closest to `image`.
    ///
    /// Returns at least one result whenever any category cleared the noise floor and
    /// `max_results` is non-zero, even if none reaches `confidence_threshold`.
    pub fn recognize(
        &self,
        image: &[u8],
        confidence_threshold: f64,
        max_results: usize,
        graph: &dyn GraphFactSource,
        token: &CancellationToken,
    ) -> MatchResult<RecognitionResult> {
        #[cfg(feature = "perf-log")]
        let started = std::time::Instant::now();

        let query = ImageHistogram::from_bytes(image)?;
        let ranked = self.scan(&query, token)?;
        let total_predictions = ranked.len();

        let top: Vec<CategoryBestMatch> = ranked.into_iter().take(max_results).collect();
        let mut kept: Vec<CategoryBestMatch> = top
            .iter()
            .filter(|m| m.similarity >= confidence_threshold)
            .cloned()
            .collect();
        if kept.is_empty() {
            if let Some(best) = top.into_iter().next() {
                debug!(category = %best.category, "nothing above threshold, keeping best match");
                kept.push(best);
            }
        }

        let results: Vec<FoodRecognition> = kept
            .into_iter()
            .map(|m| resolve_recognition(m, graph))
            .collect();

        #[cfg(feature = "perf-log")]
        debug!(elapsed_ms = started.elapsed().as_secs_f64() * 1000.0, "recognition timing");

        info!(
            considered = total_predictions,
            returned = results.len(),
            best = results.first().map(|r| r.predicted_name.as_str()).unwrap_or("-"),
            "recognition finished"
        );
        Ok(RecognitionResult {
            filtered_predictions: results.len(),
            results,
            image_processed: true,
            total_predictions,
        })
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Attach the graph record named like the category, if there is one
fn resolve_recognition(m: CategoryBestMatch, graph: &dyn GraphFactSource) -> FoodRecognition {
    let predicted_name = m.category.replace('_', " ");
    let food: Option<FoodRecord> = match resolve_exact_then_contains(graph, &predicted_name)
        .and_then(|uri| uri.map(|uri| graph.get_detail(&uri)).transpose())
    {
        Ok(found) => found.flatten(),
        Err(e) => {
            warn!(category = %m.category, error = %e, "graph lookup failed for recognized category");
            None
        }
    };
    let ingredients = match &food {
        Some(record) if !record.ingredients.is_empty() => record.ingredients.clone(),
        _ => vec![predicted_name.clone(), PLACEHOLDER_INGREDIENT.to_string()],
    };
    FoodRecognition {
        predicted_name,
        category: m.category,
        confidence: m.similarity,
        best_file: m.best_file,
        images_sampled: m.images_sampled,
        food,
        ingredients,
    }
}
