//! Core data models for FoodKG
//!
//! `FoodRecord` is owned by the graph fact source. The text index and the planner only
//! ever hold read-only projections of it.

use serde::{Deserialize, Serialize};
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// FOOD RECORDS
// ─────────────────────────────────────────────────────────────────────────────

/// Nutrient values per 100g. Every value is optional and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nutrients {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbohydrates: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiber: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sodium: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sugar: Option<f64>,
}

/// A reference image attached to a food in the graph
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub image_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// A food item as known to the knowledge graph
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodRecord {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Class id (local name of the ontology class)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(flatten)]
    pub nutrients: Nutrients,
    #[serde(default)]
    pub ingredients: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    /// Relevance score, present only on results that came through the text index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_score: Option<f32>,
}

impl FoodRecord {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_category(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.category = Some(id.into());
        self.category_label = Some(label.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_calories(mut self, calories: f64) -> Self {
        self.nutrients.calories = Some(calories);
        self
    }

    pub fn with_protein(mut self, protein: f64) -> Self {
        self.nutrients.protein = Some(protein);
        self
    }

    pub fn with_ingredients<I, S>(mut self, ingredients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ingredients = ingredients.into_iter().map(Into::into).collect();
        self
    }
}

/// An ontology class a food can belong to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FoodCategory {
    pub id: String,
    pub label: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// NUTRIENT FIELD TABLE
// ─────────────────────────────────────────────────────────────────────────────

/// One nutrient column: its storage name plus accessors into `Nutrients`.
///
/// Every layer that moves nutrients through strings or columns (index documents,
/// SQLite rows) walks `NUTRIENT_FIELDS` instead of naming each nutrient by hand.
pub struct NutrientField {
    pub name: &'static str,
    pub get: fn(&Nutrients) -> Option<f64>,
    pub set: fn(&mut Nutrients, f64),
}

impl NutrientField {
    /// Store `value` if it is a valid nutrient amount. Returns whether it was accepted.
    pub fn set_checked(&self, nutrients: &mut Nutrients, value: f64) -> bool {
        if value.is_finite() && value >= 0.0 {
            (self.set)(nutrients, value);
            true
        } else {
            debug!(field = self.name, value, "ignoring out-of-range nutrient value");
            false
        }
    }

    /// Parse a stringified value, ignoring anything that is not a valid amount.
    pub fn parse_into(&self, nutrients: &mut Nutrients, raw: &str) -> bool {
        let raw = raw.trim();
        if raw.is_empty() {
            return false;
        }
        match raw.parse::<f64>() {
            Ok(value) => self.set_checked(nutrients, value),
            Err(_) => {
                debug!(field = self.name, raw, "ignoring unparseable nutrient value");
                false
            }
        }
    }
}

pub const NUTRIENT_FIELDS: &[NutrientField] = &[
    NutrientField { name: "calories", get: |n| n.calories, set: |n, v| n.calories = Some(v) },
    NutrientField { name: "protein", get: |n| n.protein, set: |n, v| n.protein = Some(v) },
    NutrientField { name: "carbohydrates", get: |n| n.carbohydrates, set: |n, v| n.carbohydrates = Some(v) },
    NutrientField { name: "fat", get: |n| n.fat, set: |n, v| n.fat = Some(v) },
    NutrientField { name: "fiber", get: |n| n.fiber, set: |n, v| n.fiber = Some(v) },
    NutrientField { name: "sodium", get: |n| n.sodium, set: |n, v| n.sodium = Some(v) },
    NutrientField { name: "sugar", get: |n| n.sugar, set: |n, v| n.sugar = Some(v) },
];

// ─────────────────────────────────────────────────────────────────────────────
// NUTRIENT RANGE FILTER
// ─────────────────────────────────────────────────────────────────────────────

/// Inclusive calorie/protein bounds.
///
/// A bound only constrains its own nutrient: once a calorie bound is set, records
/// without a calorie value are rejected, but their protein value is irrelevant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NutrientRange {
    pub min_calories: Option<f64>,
    pub max_calories: Option<f64>,
    pub min_protein: Option<f64>,
    pub max_protein: Option<f64>,
}

impl NutrientRange {
    pub fn calories(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min_calories: min, max_calories: max, ..Default::default() }
    }

    pub fn protein(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min_protein: min, max_protein: max, ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        !self.constrains_calories() && !self.constrains_protein()
    }

    pub fn constrains_calories(&self) -> bool {
        self.min_calories.is_some() || self.max_calories.is_some()
    }

    pub fn constrains_protein(&self) -> bool {
        self.min_protein.is_some() || self.max_protein.is_some()
    }

    pub fn admits(&self, nutrients: &Nutrients) -> bool {
        within(nutrients.calories, self.min_calories, self.max_calories)
            && within(nutrients.protein, self.min_protein, self.max_protein)
    }
}

fn within(value: Option<f64>, min: Option<f64>, max: Option<f64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    min.map_or(true, |min| value >= min) && max.map_or(true, |max| value <= max)
}
