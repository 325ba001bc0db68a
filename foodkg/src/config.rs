//! Runtime configuration, loaded from TOML or built from defaults

use crate::interface::{FoodKgError, DEFAULT_PAGE_SIZE};
use crate::matcher::{DEFAULT_NOISE_FLOOR, DEFAULT_PER_CATEGORY_CAP};
use crate::planner::DEFAULT_TEXT_OVERFETCH;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FoodKgConfig {
    /// Root of the on-disk index generations. None keeps the index in memory.
    #[serde(default = "default_index_path")]
    pub index_path: Option<PathBuf>,
    /// Keep the index in memory even when `index_path` is set
    #[serde(default)]
    pub in_memory_index: bool,
    /// Reference image corpus, one directory per category
    #[serde(default = "default_images_base_path")]
    pub images_base_path: PathBuf,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
}

fn default_index_path() -> Option<PathBuf> {
    Some(PathBuf::from("./foodkg-index"))
}
fn default_images_base_path() -> PathBuf {
    PathBuf::from("./data/images")
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SearchConfig {
    #[serde(default = "default_text_overfetch")]
    pub text_overfetch: usize,
    #[serde(default = "default_autocomplete_max")]
    pub autocomplete_max: usize,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_text_overfetch() -> usize {
    DEFAULT_TEXT_OVERFETCH
}
fn default_autocomplete_max() -> usize {
    10
}
fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}
fn default_max_page_size() -> usize {
    200
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            text_overfetch: default_text_overfetch(),
            autocomplete_max: default_autocomplete_max(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RecognitionConfig {
    #[serde(default = "default_per_category_cap")]
    pub per_category_cap: usize,
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,
    #[serde(default = "default_confidence_threshold")]
    pub default_confidence_threshold: f64,
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_per_category_cap() -> usize {
    DEFAULT_PER_CATEGORY_CAP
}
fn default_noise_floor() -> f64 {
    DEFAULT_NOISE_FLOOR
}
fn default_confidence_threshold() -> f64 {
    0.01
}
fn default_max_results() -> usize {
    6
}
fn default_parallel() -> bool {
    true
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            per_category_cap: default_per_category_cap(),
            noise_floor: default_noise_floor(),
            default_confidence_threshold: default_confidence_threshold(),
            default_max_results: default_max_results(),
            parallel: default_parallel(),
        }
    }
}

impl Default for FoodKgConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            in_memory_index: false,
            images_base_path: default_images_base_path(),
            database_path: None,
            search: SearchConfig::default(),
            recognition: RecognitionConfig::default(),
        }
    }
}

impl FoodKgConfig {
    /// Defaults with an in-memory index and the given corpus root
    pub fn in_memory(images_base_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: None,
            images_base_path: images_base_path.into(),
            ..Default::default()
        }
    }

    /// Where index generations live, or None for an in-memory index
    pub fn index_root(&self) -> Option<&Path> {
        if self.in_memory_index {
            return None;
        }
        self.index_path.as_deref()
    }

    pub fn load(path: &Path) -> Result<Self, FoodKgError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FoodKgError::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, FoodKgError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| FoodKgError::ConfigError(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FoodKgError> {
        let bail = |msg: &str| -> Result<(), FoodKgError> { Err(FoodKgError::ConfigError(msg.to_string())) };
        if self.search.max_page_size == 0 {
            return bail("search.max_page_size must be >= 1");
        }
        if self.search.default_page_size == 0 || self.search.default_page_size > self.search.max_page_size {
            return bail("search.default_page_size must be in [1, search.max_page_size]");
        }
        if self.search.text_overfetch == 0 {
            return bail("search.text_overfetch must be > 0");
        }
        if self.recognition.per_category_cap == 0 {
            return bail("recognition.per_category_cap must be > 0");
        }
        if !(0.0..1.0).contains(&self.recognition.noise_floor) {
            return bail("recognition.noise_floor must be in [0.0, 1.0)");
        }
        if !self.recognition.default_confidence_threshold.is_finite() {
            return bail("recognition.default_confidence_threshold must be finite");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FoodKgConfig::parse("").unwrap();
        assert_eq!(config, FoodKgConfig::default());
        assert_eq!(config.search.text_overfetch, 100);
        assert_eq!(config.recognition.per_category_cap, 70);
        assert_eq!(config.recognition.noise_floor, 0.1);
    }

    #[test]
    fn test_partial_sections() {
        let config = FoodKgConfig::parse(
            r#"
            images_base_path = "/srv/images"
            database_path = "/srv/foods.db"

            [recognition]
            parallel = false
            default_max_results = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.images_base_path, PathBuf::from("/srv/images"));
        assert_eq!(config.database_path, Some(PathBuf::from("/srv/foods.db")));
        assert!(!config.recognition.parallel);
        assert_eq!(config.recognition.default_max_results, 3);
        assert_eq!(config.recognition.per_category_cap, 70);
        assert_eq!(config.search.max_page_size, 200);
    }

    #[test]
    fn test_in_memory_index_flag() {
        let config = FoodKgConfig::parse("in_memory_index = true").unwrap();
        assert!(config.index_path.is_some());
        assert_eq!(config.index_root(), None);

        let config = FoodKgConfig::parse("index_path = \"/srv/index\"").unwrap();
        assert_eq!(config.index_root(), Some(Path::new("/srv/index")));
        assert_eq!(FoodKgConfig::in_memory("/srv/images").index_root(), None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            FoodKgConfig::parse("[search]\nmax_page_size = 0"),
            Err(FoodKgError::ConfigError(_))
        ));
        assert!(FoodKgConfig::parse("[recognition]\nnoise_floor = 1.5").is_err());
        assert!(FoodKgConfig::parse("index_path = 12").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = FoodKgConfig::load(Path::new("/no/such/foodkg.toml")).unwrap_err();
        assert!(matches!(err, FoodKgError::ConfigError(_)));
    }
}
