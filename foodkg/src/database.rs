//! SQLite-backed knowledge graph store
//!
//! Foods plus child tables for ingredients and images, with the class and group
//! vocabularies kept in their own tables. Uses r2d2 connection pooling so concurrent
//! searches and recognitions read without blocking each other.

use crate::graph::{GraphFactSource, GraphResult};
use crate::models::{FoodCategory, FoodRecord, ImageRef, NutrientRange, Nutrients, NUTRIENT_FIELDS};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

/// Columns before the nutrient block in every food select
const BASE_COLUMNS: usize = 6;

/// Thread-safe graph store using connection pooling
pub struct SqliteGraph {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteGraph {
    /// Open or create a graph database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> GraphResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA foreign_keys=ON;
            ",
            )?;
            Ok(())
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        let graph = Self { pool };
        graph.setup_schema()?;
        info!(path = %path.as_ref().display(), foods = graph.count_foods()?, "opened graph database");
        Ok(graph)
    }

    /// Open an in-memory graph database
    pub fn open_in_memory() -> GraphResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys=ON;")?;
            Ok(())
        });

        // In-memory needs single connection to maintain state
        let pool = Pool::builder().max_size(1).build(manager)?;

        let graph = Self { pool };
        graph.setup_schema()?;
        Ok(graph)
    }

    fn get_conn(&self) -> GraphResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn setup_schema(&self) -> GraphResult<()> {
        let conn = self.get_conn()?;
        let nutrient_columns: String = NUTRIENT_FIELDS
            .iter()
            .map(|n| format!(",\n                {} REAL", n.name))
            .collect();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS food_groups (
                name TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS foods (
                uri TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                category TEXT REFERENCES categories(id),
                groupName TEXT REFERENCES food_groups(name){nutrient_columns}
            );

            CREATE TABLE IF NOT EXISTS ingredients (
                foodUri TEXT NOT NULL REFERENCES foods(uri) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (foodUri, ordinal)
            );

            CREATE TABLE IF NOT EXISTS images (
                foodUri TEXT NOT NULL REFERENCES foods(uri) ON DELETE CASCADE,
                uri TEXT,
                imagePath TEXT NOT NULL,
                filename TEXT,
                width INTEGER,
                height INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_foods_name ON foods(name);
            CREATE INDEX IF NOT EXISTS idx_foods_category ON foods(category);
            CREATE INDEX IF NOT EXISTS idx_images_food ON images(foodUri);
            "#
        ))?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn insert_category(&self, id: &str, label: &str) -> GraphResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO categories (id, label) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET label = excluded.label",
            params![id, label],
        )?;
        Ok(())
    }

    pub fn insert_group(&self, name: &str) -> GraphResult<()> {
        let conn = self.get_conn()?;
        conn.execute("INSERT OR IGNORE INTO food_groups (name) VALUES (?1)", params![name])?;
        Ok(())
    }

    /// Insert or replace a food together with its ingredients and images.
    /// Its class and group are registered if they are new.
    pub fn insert_food(&self, record: &FoodRecord) -> GraphResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        if let Some(category) = &record.category {
            let label = record.category_label.as_deref().unwrap_or(category);
            tx.execute(
                "INSERT INTO categories (id, label) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET label = excluded.label",
                params![category, label],
            )?;
        }
        if let Some(group) = &record.group {
            tx.execute("INSERT OR IGNORE INTO food_groups (name) VALUES (?1)", params![group])?;
        }

        tx.execute("DELETE FROM ingredients WHERE foodUri = ?1", params![record.uri])?;
        tx.execute("DELETE FROM images WHERE foodUri = ?1", params![record.uri])?;
        tx.execute("DELETE FROM foods WHERE uri = ?1", params![record.uri])?;

        let mut values = vec![
            Value::Text(record.uri.clone()),
            Value::Text(record.name.clone()),
            optional_text(&record.description),
            optional_text(&record.category),
            optional_text(&record.group),
        ];
        values.extend(
            NUTRIENT_FIELDS
                .iter()
                .map(|n| (n.get)(&record.nutrients).map_or(Value::Null, Value::Real)),
        );
        let columns: String = NUTRIENT_FIELDS.iter().map(|n| format!(", {}", n.name)).collect();
        let placeholders: String = (0..values.len()).map(|i| format!("?{}", i + 1)).collect::<Vec<_>>().join(", ");
        tx.execute(
            &format!(
                "INSERT INTO foods (uri, name, description, category, groupName{}) VALUES ({})",
                columns, placeholders
            ),
            params_from_iter(values),
        )?;

        for (ordinal, ingredient) in record.ingredients.iter().enumerate() {
            tx.execute(
                "INSERT INTO ingredients (foodUri, ordinal, name) VALUES (?1, ?2, ?3)",
                params![record.uri, ordinal as i64, ingredient],
            )?;
        }
        for image in &record.images {
            tx.execute(
                "INSERT INTO images (foodUri, uri, imagePath, filename, width, height)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![record.uri, image.uri, image.image_path, image.filename, image.width, image.height],
            )?;
        }

        tx.commit()?;
        debug!(uri = %record.uri, "stored food");
        Ok(())
    }

    /// Insert every record; returns how many were stored
    pub fn import_records(&self, records: &[FoodRecord]) -> GraphResult<usize> {
        for record in records {
            self.insert_food(record)?;
        }
        info!(count = records.len(), "imported foods");
        Ok(records.len())
    }

    pub fn count_foods(&self) -> GraphResult<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM foods", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────────

    fn select_foods(&self, filter: &str, params: Vec<Value>) -> GraphResult<Vec<FoodRecord>> {
        let conn = self.get_conn()?;
        let nutrient_columns: String = NUTRIENT_FIELDS.iter().map(|n| format!(", f.{}", n.name)).collect();
        let sql = format!(
            "SELECT f.uri, f.name, f.description, f.category, c.label, f.groupName{}
             FROM foods f LEFT JOIN categories c ON c.id = f.category
             {}",
            nutrient_columns, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), Self::row_to_food)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn row_to_food(row: &rusqlite::Row) -> rusqlite::Result<FoodRecord> {
        let mut nutrients = Nutrients::default();
        for (i, field) in NUTRIENT_FIELDS.iter().enumerate() {
            if let Some(value) = row.get::<_, Option<f64>>(BASE_COLUMNS + i)? {
                field.set_checked(&mut nutrients, value);
            }
        }
        Ok(FoodRecord {
            uri: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            category: row.get(3)?,
            category_label: row.get(4)?,
            group: row.get(5)?,
            nutrients,
            ..Default::default()
        })
    }
}

fn optional_text(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::Text)
}

impl GraphFactSource for SqliteGraph {
    fn get_all(&self) -> GraphResult<Vec<FoodRecord>> {
        self.select_foods("ORDER BY f.name", Vec::new())
    }

    fn get_by_category(&self, category: &str) -> GraphResult<Vec<FoodRecord>> {
        self.select_foods(
            "WHERE f.category = ?1 ORDER BY f.name",
            vec![Value::Text(category.to_string())],
        )
    }

    fn get_by_nutritional_range(&self, range: &NutrientRange) -> GraphResult<Vec<FoodRecord>> {
        let bounds = [
            ("f.calories >=", range.min_calories),
            ("f.calories <=", range.max_calories),
            ("f.protein >=", range.min_protein),
            ("f.protein <=", range.max_protein),
        ];
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for (condition, bound) in bounds {
            if let Some(bound) = bound {
                params.push(Value::Real(bound));
                clauses.push(format!("{} ?{}", condition, params.len()));
            }
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        self.select_foods(
            &format!("{} ORDER BY f.calories IS NULL, f.calories, f.name", filter),
            params,
        )
    }

    fn get_detail(&self, uri: &str) -> GraphResult<Option<FoodRecord>> {
        let Some(mut record) = self
            .select_foods("WHERE f.uri = ?1", vec![Value::Text(uri.to_string())])?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        record.ingredients = self.get_ingredients(uri)?;
        record.images = self.get_images(uri)?;
        Ok(Some(record))
    }

    fn get_images(&self, uri: &str) -> GraphResult<Vec<ImageRef>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT uri, imagePath, filename, width, height FROM images WHERE foodUri = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![uri], |row| {
            Ok(ImageRef {
                uri: row.get(0)?,
                image_path: row.get(1)?,
                filename: row.get(2)?,
                width: row.get(3)?,
                height: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_ingredients(&self, uri: &str) -> GraphResult<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT name FROM ingredients WHERE foodUri = ?1 ORDER BY ordinal")?;
        let rows = stmt.query_map(params![uri], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_categories(&self) -> GraphResult<Vec<FoodCategory>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT id, label FROM categories ORDER BY label, id")?;
        let rows = stmt.query_map([], |row| Ok(FoodCategory { id: row.get(0)?, label: row.get(1)? }))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_groups(&self) -> GraphResult<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT name FROM food_groups ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn resolve_uri_by_exact_name(&self, name: &str) -> GraphResult<Option<String>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT uri FROM foods WHERE lower(name) = lower(?1) ORDER BY rowid LIMIT 1",
                params![name.trim()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn resolve_uri_by_name_contains(&self, name: &str) -> GraphResult<Option<String>> {
        let needle = name.trim();
        if needle.is_empty() {
            return Ok(None);
        }
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT uri FROM foods WHERE instr(lower(name), lower(?1)) > 0
                 ORDER BY length(name), rowid LIMIT 1",
                params![needle],
                |row| row.get(0),
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SqliteGraph {
        let graph = SqliteGraph::open_in_memory().unwrap();
        graph
            .insert_food(
                &FoodRecord::new("u:banana", "Banana")
                    .with_category("Fruit", "Fruits")
                    .with_group("Plants")
                    .with_calories(89.0)
                    .with_protein(1.1)
                    .with_ingredients(["banana", "peel"]),
            )
            .unwrap();
        graph
            .insert_food(&FoodRecord::new("u:bread", "Bread").with_category("Grain", "Grains").with_calories(265.0))
            .unwrap();
        graph.insert_food(&FoodRecord::new("u:water", "Water")).unwrap();
        graph
    }

    #[test]
    fn test_round_trip_detail() {
        let graph = seeded();
        let mut record = FoodRecord::new("u:pie", "Apple Pie").with_ingredients(["apple", "flour", "butter"]);
        record.images.push(ImageRef {
            image_path: "apple_pie/1.jpg".into(),
            width: Some(640),
            ..Default::default()
        });
        graph.insert_food(&record).unwrap();

        let detail = graph.get_detail("u:pie").unwrap().unwrap();
        assert_eq!(detail.ingredients, vec!["apple", "flour", "butter"]);
        assert_eq!(detail.images.len(), 1);
        assert_eq!(detail.images[0].width, Some(640));
        assert!(graph.get_detail("u:none").unwrap().is_none());
    }

    #[test]
    fn test_reinsert_replaces_children() {
        let graph = seeded();
        graph
            .insert_food(&FoodRecord::new("u:banana", "Banana").with_ingredients(["banana"]))
            .unwrap();
        assert_eq!(graph.get_ingredients("u:banana").unwrap(), vec!["banana"]);
        assert_eq!(graph.count_foods().unwrap(), 3);
    }

    #[test]
    fn test_listing_and_category_label_join() {
        let graph = seeded();
        let all = graph.get_all().unwrap();
        let names: Vec<&str> = all.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Banana", "Bread", "Water"]);
        assert_eq!(all[0].category_label.as_deref(), Some("Fruits"));
        assert_eq!(all[0].nutrients.protein, Some(1.1));

        let grain = graph.get_by_category("Grain").unwrap();
        assert_eq!(grain.len(), 1);
        assert_eq!(grain[0].name, "Bread");
    }

    #[test]
    fn test_nutritional_range() {
        let graph = seeded();
        let hits = graph.get_by_nutritional_range(&NutrientRange::calories(Some(80.0), Some(100.0))).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Banana");

        let any = graph.get_by_nutritional_range(&NutrientRange::calories(Some(0.0), None)).unwrap();
        let names: Vec<&str> = any.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Banana", "Bread"]);
    }

    #[test]
    fn test_vocabularies() {
        let graph = seeded();
        graph.insert_category("Dairy", "Dairy products").unwrap();
        graph.insert_group("Animals").unwrap();
        let labels: Vec<String> = graph.list_categories().unwrap().into_iter().map(|c| c.label).collect();
        assert_eq!(labels, vec!["Dairy products", "Fruits", "Grains"]);
        assert_eq!(graph.list_groups().unwrap(), vec!["Animals", "Plants"]);
    }

    #[test]
    fn test_name_resolution() {
        let graph = seeded();
        graph.insert_food(&FoodRecord::new("u:bb", "Banana Bread")).unwrap();
        assert_eq!(graph.resolve_uri_by_exact_name("banana").unwrap().as_deref(), Some("u:banana"));
        assert_eq!(graph.resolve_uri_by_name_contains("BREAD").unwrap().as_deref(), Some("u:bread"));
        assert_eq!(graph.resolve_uri_by_name_contains("nan").unwrap().as_deref(), Some("u:banana"));
        assert_eq!(graph.resolve_uri_by_exact_name("kiwi").unwrap(), None);
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph").join("foods.db");
        {
            let graph = SqliteGraph::open(&path).unwrap();
            graph.insert_food(&FoodRecord::new("u:1", "Kiwi")).unwrap();
        }
        let graph = SqliteGraph::open(&path).unwrap();
        assert_eq!(graph.count_foods().unwrap(), 1);
    }
}
