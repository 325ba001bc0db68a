//! FoodKG Core - food catalog search and photo recognition
//!
//! This library implements the search pipeline behind the FoodKG service: a Tantivy text
//! index over food records, a hybrid planner that merges it with structured queries against
//! the knowledge graph, and a color-histogram matcher that identifies food categories
//! from uploaded photos.

pub mod config;
pub mod database;
pub mod graph;
pub mod histogram;
pub mod interface;
pub mod matcher;
pub mod models;
pub mod planner;
mod store;
pub mod text_index;

pub use config::FoodKgConfig;
pub use database::SqliteGraph;
pub use graph::{GraphError, GraphFactSource, MemoryGraph};
pub use interface::*;
pub use models::*;
pub use store::FoodKgStore;
