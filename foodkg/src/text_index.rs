//! Tantivy text index over food records
//!
//! Each rebuild writes a complete new generation and swaps it in, so readers see either the
//! previous index or the new one. Fields are declared once in `FIELD_SPECS`; `search` and
//! `search_advanced` both walk the analyzed entries to build the boosted disjunction.

use crate::models::{FoodRecord, NutrientField, NutrientRange, Nutrients, NUTRIENT_FIELDS};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{
    AllQuery, BooleanQuery, BoostQuery, FuzzyTermQuery, Occur, Query, RegexQuery, TermQuery,
};
use tantivy::schema::*;
use tantivy::tokenizer::{
    AsciiFoldingFilter, LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer, TokenStream,
};
use tantivy::{DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, Score, TantivyDocument, Term};
use thiserror::Error;
use tracing::{debug, info, warn};

const TOKENIZER_NAME: &str = "food_text";
const GENERATION_PREFIX: &str = "generation-";
const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Prefixes shorter than this never produce suggestions
pub const MIN_AUTOCOMPLETE_LEN: usize = 2;

/// Error type for text index operations
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
    #[error("Directory error: {0}")]
    Directory(#[from] tantivy::directory::error::OpenDirectoryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Another index rebuild is already running")]
    RebuildInProgress,
}

pub type IndexResult<T> = Result<T, IndexError>;

// ─────────────────────────────────────────────────────────────────────────────
// FIELD SCHEMA
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    /// Stored verbatim and matched as a single term
    Exact,
    /// Stored for projection only
    Stored,
    /// Tokenized for ranked search, not stored
    Analyzed,
}

pub(crate) struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub boost: f32,
    pub values: fn(&FoodRecord) -> Vec<String>,
}

pub(crate) const FIELD_SPECS: &[FieldSpec] = &[
    FieldSpec { name: "uri", kind: FieldKind::Exact, boost: 1.0, values: |r| vec![r.uri.clone()] },
    FieldSpec { name: "name", kind: FieldKind::Exact, boost: 1.0, values: |r| vec![r.name.clone()] },
    FieldSpec { name: "category", kind: FieldKind::Exact, boost: 1.0, values: |r| r.category.iter().cloned().collect() },
    FieldSpec { name: "group", kind: FieldKind::Exact, boost: 1.0, values: |r| r.group.iter().cloned().collect() },
    FieldSpec { name: "category_label", kind: FieldKind::Stored, boost: 1.0, values: |r| r.category_label.iter().cloned().collect() },
    FieldSpec { name: "description", kind: FieldKind::Stored, boost: 1.0, values: |r| r.description.iter().cloned().collect() },
    FieldSpec { name: "ingredients", kind: FieldKind::Stored, boost: 1.0, values: |r| r.ingredients.clone() },
    FieldSpec { name: "name_text", kind: FieldKind::Analyzed, boost: 3.0, values: |r| vec![r.name.clone()] },
    FieldSpec { name: "description_text", kind: FieldKind::Analyzed, boost: 2.0, values: |r| r.description.iter().cloned().collect() },
    FieldSpec { name: "category_label_text", kind: FieldKind::Analyzed, boost: 1.0, values: |r| r.category_label.iter().cloned().collect() },
    FieldSpec { name: "ingredients_text", kind: FieldKind::Analyzed, boost: 1.0, values: |r| vec![r.ingredients.join(" ")] },
];

fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    for spec in FIELD_SPECS {
        match spec.kind {
            FieldKind::Exact => {
                builder.add_text_field(spec.name, STRING | STORED);
            }
            FieldKind::Stored => {
                builder.add_text_field(spec.name, STORED);
            }
            FieldKind::Analyzed => {
                let indexing = TextFieldIndexing::default()
                    .set_tokenizer(TOKENIZER_NAME)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions);
                builder.add_text_field(spec.name, TextOptions::default().set_indexing_options(indexing));
            }
        }
    }
    // Nutrients are stringified exact fields
    for nutrient in NUTRIENT_FIELDS {
        builder.add_text_field(nutrient.name, STRING | STORED);
    }
    builder.build()
}

/// Word tokenizer shared by indexing and query analysis
fn food_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(AsciiFoldingFilter)
        .build()
}

fn analyze(text: &str) -> Vec<String> {
    let mut analyzer = food_analyzer();
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while let Some(token) = stream.next() {
        tokens.push(token.text.clone());
    }
    tokens
}

/// Typo budget for a query word. Short words only match by prefix.
pub(crate) fn max_edit_distance(word_len: usize) -> u8 {
    if word_len < 5 {
        0
    } else if word_len <= 8 {
        1
    } else {
        2
    }
}

/// Resolved schema handles for one generation
struct FoodFields {
    uri: Field,
    name: Field,
    description: Field,
    category: Field,
    category_label: Field,
    group: Field,
    ingredients: Field,
    name_text: Field,
    specs: Vec<(&'static FieldSpec, Field)>,
    analyzed: Vec<(Field, f32)>,
    nutrients: Vec<(&'static NutrientField, Field)>,
}

impl FoodFields {
    fn resolve(schema: &Schema) -> IndexResult<Self> {
        let specs = FIELD_SPECS
            .iter()
            .map(|spec| Ok((spec, schema.get_field(spec.name)?)))
            .collect::<IndexResult<Vec<_>>>()?;
        let analyzed = specs
            .iter()
            .filter(|(spec, _)| spec.kind == FieldKind::Analyzed)
            .map(|(spec, field)| (*field, spec.boost))
            .collect();
        let nutrients = NUTRIENT_FIELDS
            .iter()
            .map(|n| Ok((n, schema.get_field(n.name)?)))
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(Self {
            uri: schema.get_field("uri")?,
            name: schema.get_field("name")?,
            description: schema.get_field("description")?,
            category: schema.get_field("category")?,
            category_label: schema.get_field("category_label")?,
            group: schema.get_field("group")?,
            ingredients: schema.get_field("ingredients")?,
            name_text: schema.get_field("name_text")?,
            specs,
            analyzed,
            nutrients,
        })
    }

    fn document(&self, record: &FoodRecord) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        for (spec, field) in &self.specs {
            for value in (spec.values)(record) {
                doc.add_text(*field, &value);
            }
        }
        for (nutrient, field) in &self.nutrients {
            if let Some(value) = (nutrient.get)(&record.nutrients) {
                doc.add_text(*field, value.to_string());
            }
        }
        doc
    }

    fn project(&self, doc: &TantivyDocument, score: Score) -> FoodRecord {
        let text = |field: Field| doc.get_first(field).and_then(|v| v.as_str()).map(str::to_string);
        let mut nutrients = Nutrients::default();
        for (nutrient, field) in &self.nutrients {
            if let Some(raw) = doc.get_first(*field).and_then(|v| v.as_str()) {
                nutrient.parse_into(&mut nutrients, raw);
            }
        }
        FoodRecord {
            uri: text(self.uri).unwrap_or_default(),
            name: text(self.name).unwrap_or_default(),
            description: text(self.description),
            category: text(self.category),
            category_label: text(self.category_label),
            group: text(self.group),
            nutrients,
            ingredients: doc
                .get_all(self.ingredients)
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            images: Vec::new(),
            search_score: Some(score),
        }
    }

    /// Boosted disjunction of every token over every analyzed field
    fn text_query(&self, tokens: &[String]) -> Option<Box<dyn Query>> {
        if tokens.is_empty() {
            return None;
        }
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for (field, boost) in &self.analyzed {
            for token in tokens {
                let term = Term::from_field_text(*field, token);
                let distance = max_edit_distance(token.chars().count());
                let exact: Box<dyn Query> =
                    Box::new(TermQuery::new(term.clone(), IndexRecordOption::WithFreqs));
                let prefix: Box<dyn Query> = Box::new(FuzzyTermQuery::new_prefix(term, distance, true));
                let matched = BooleanQuery::new(vec![(Occur::Should, exact), (Occur::Should, prefix)]);
                clauses.push((Occur::Should, Box::new(BoostQuery::new(Box::new(matched), *boost))));
            }
        }
        Some(Box::new(BooleanQuery::new(clauses)))
    }

    fn exact_filter(field: Field, value: &str) -> (Occur, Box<dyn Query>) {
        let term = Term::from_field_text(field, value);
        (Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GENERATIONS
// ─────────────────────────────────────────────────────────────────────────────

/// One complete, committed index. Never written to after it goes live.
struct Generation {
    number: u64,
    reader: IndexReader,
    fields: FoodFields,
    path: Option<PathBuf>,
    built_at: Option<i64>,
}

impl Generation {
    fn create(number: u64, path: Option<PathBuf>, records: &[FoodRecord]) -> IndexResult<Self> {
        let schema = build_schema();
        let index = match &path {
            Some(path) => {
                if path.exists() {
                    std::fs::remove_dir_all(path)?;
                }
                std::fs::create_dir_all(path)?;
                Index::open_or_create(MmapDirectory::open(path)?, schema.clone())?
            }
            None => Index::create_in_ram(schema.clone()),
        };
        index.tokenizers().register(TOKENIZER_NAME, food_analyzer());
        let fields = FoodFields::resolve(&schema)?;

        // One indexing thread keeps a single segment in insertion order
        let mut writer: IndexWriter = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        for record in records {
            writer.add_document(fields.document(record))?;
        }
        writer.commit()?;
        writer.wait_merging_threads()?;

        let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        Ok(Self {
            number,
            reader,
            fields,
            path,
            built_at: Some(Utc::now().timestamp()),
        })
    }

    /// Reopen a committed on-disk generation; None when the directory holds no usable index.
    fn reopen(number: u64, path: PathBuf) -> Option<Self> {
        let dir = MmapDirectory::open(&path).ok()?;
        if !matches!(Index::exists(&dir), Ok(true)) {
            return None;
        }
        let index = match Index::open(dir) {
            Ok(index) => index,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable index generation");
                return None;
            }
        };
        index.tokenizers().register(TOKENIZER_NAME, food_analyzer());
        let fields = FoodFields::resolve(&index.schema()).ok()?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .ok()?;
        let built_at = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp());
        Some(Self { number, reader, fields, path: Some(path), built_at })
    }

    fn top_docs(&self, query: &dyn Query, limit: usize) -> IndexResult<Vec<FoodRecord>> {
        let searcher = self.reader.searcher();
        // The collector preallocates for the limit; never ask for more than exists
        let limit = limit.min(usize::try_from(searcher.num_docs()).unwrap_or(usize::MAX));
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut hits: Vec<(Score, DocAddress)> = searcher.search(query, &TopDocs::with_limit(limit))?;
        hits.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut records = Vec::with_capacity(hits.len());
        for (score, address) in hits {
            let doc: TantivyDocument = searcher.doc(address)?;
            records.push(self.fields.project(&doc, score));
        }
        Ok(records)
    }
}

fn generation_number(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(GENERATION_PREFIX)?
        .parse()
        .ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// LIVE INDEX HANDLE
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to the live index generation.
///
/// Readers clone the current `Arc<Generation>` and search without holding the lock. Rebuilds
/// are serialized by `rebuild_lock` and fail fast instead of queueing.
pub struct TextIndex {
    root: Option<PathBuf>,
    live: RwLock<Option<Arc<Generation>>>,
    rebuild_lock: Mutex<()>,
}

impl TextIndex {
    /// Open an on-disk index rooted at `root`, reusing the newest valid generation if any.
    pub fn open(root: &Path) -> IndexResult<Self> {
        std::fs::create_dir_all(root)?;
        let mut candidates: Vec<(u64, PathBuf)> = std::fs::read_dir(root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| generation_number(&path).map(|n| (n, path)))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let live = candidates
            .into_iter()
            .find_map(|(number, path)| Generation::reopen(number, path));
        match &live {
            Some(generation) => info!(
                generation = generation.number,
                docs = generation.reader.searcher().num_docs(),
                "opened text index"
            ),
            None => info!(root = %root.display(), "no valid text index generation found"),
        }

        Ok(Self {
            root: Some(root.to_path_buf()),
            live: RwLock::new(live.map(Arc::new)),
            rebuild_lock: Mutex::new(()),
        })
    }

    /// An index that lives only in memory. Starts without a generation.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            live: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Whether a committed generation is live
    pub fn is_valid(&self) -> bool {
        self.live.read().is_some()
    }

    fn current(&self) -> Option<Arc<Generation>> {
        self.live.read().clone()
    }

    /// Replace the index content with exactly one document per record.
    ///
    /// Returns the number of live documents in the new generation.
    pub fn rebuild(&self, records: &[FoodRecord]) -> IndexResult<u64> {
        let _guard = self.rebuild_lock.try_lock().ok_or(IndexError::RebuildInProgress)?;

        #[cfg(feature = "perf-log")]
        let started = std::time::Instant::now();

        let number = self.current().map_or(1, |g| g.number + 1);
        let path = self
            .root
            .as_ref()
            .map(|root| root.join(format!("{}{}", GENERATION_PREFIX, number)));
        info!(generation = number, records = records.len(), "rebuilding text index");

        let generation = Generation::create(number, path, records)?;
        let docs = generation.reader.searcher().num_docs();
        let previous = self.live.write().replace(Arc::new(generation));
        drop(previous);

        if let Some(root) = &self.root {
            remove_stale_generations(root, number);
        }

        #[cfg(feature = "perf-log")]
        debug!(elapsed_ms = started.elapsed().as_secs_f64() * 1000.0, "index rebuild timing");

        info!(generation = number, docs, "text index rebuilt");
        Ok(docs)
    }

    /// Ranked search over the analyzed fields. Blank text or a missing index yields nothing.
    pub fn search(&self, text: &str, max_results: usize) -> IndexResult<Vec<FoodRecord>> {
        let Some(generation) = self.current() else {
            return Ok(Vec::new());
        };
        let Some(query) = generation.fields.text_query(&analyze(text)) else {
            return Ok(Vec::new());
        };
        generation.top_docs(query.as_ref(), max_results)
    }

    /// `search` AND-ed with exact category/group filters, then a calorie post-filter.
    pub fn search_advanced(
        &self,
        text: Option<&str>,
        category: Option<&str>,
        group: Option<&str>,
        min_calories: Option<f64>,
        max_calories: Option<f64>,
        max_results: usize,
    ) -> IndexResult<Vec<FoodRecord>> {
        let Some(generation) = self.current() else {
            return Ok(Vec::new());
        };
        let fields = &generation.fields;

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        match text.map(analyze) {
            Some(tokens) if !tokens.is_empty() => {
                if let Some(query) = fields.text_query(&tokens) {
                    clauses.push((Occur::Must, query));
                }
            }
            // Text present but nothing left after analysis
            Some(_) if text.is_some_and(|t| !t.trim().is_empty()) => return Ok(Vec::new()),
            _ => clauses.push((Occur::Must, Box::new(AllQuery))),
        }
        if let Some(category) = category.map(str::trim).filter(|c| !c.is_empty()) {
            clauses.push(FoodFields::exact_filter(fields.category, category));
        }
        if let Some(group) = group.map(str::trim).filter(|g| !g.is_empty()) {
            clauses.push(FoodFields::exact_filter(fields.group, group));
        }

        let query = BooleanQuery::new(clauses);
        let candidates = generation.top_docs(&query, max_results.saturating_mul(2))?;
        let range = NutrientRange::calories(min_calories, max_calories);
        let fetched = candidates.len();
        let accepted: Vec<FoodRecord> = candidates
            .into_iter()
            .filter(|r| range.admits(&r.nutrients))
            .take(max_results)
            .collect();
        debug!(fetched, accepted = accepted.len(), "advanced search");
        Ok(accepted)
    }

    /// Distinct food names starting with `prefix`, best match first. Never fails.
    pub fn autocomplete(&self, prefix: &str, max_suggestions: usize) -> Vec<String> {
        if prefix.trim().chars().count() < MIN_AUTOCOMPLETE_LEN || max_suggestions == 0 {
            return Vec::new();
        }
        let Some(generation) = self.current() else {
            return Vec::new();
        };
        let sanitized = sanitize_prefix(prefix);
        let tokens = analyze(&sanitized);
        if tokens.is_empty() {
            return Vec::new();
        }

        let query = prefix_query(&generation.fields, &tokens);
        suggestions(&generation, query, &tokens, max_suggestions)
    }

    pub fn stats(&self) -> crate::interface::IndexStats {
        let Some(generation) = self.current() else {
            return crate::interface::IndexStats::default();
        };
        let searcher = generation.reader.searcher();
        let (max_documents, deleted_documents) = searcher
            .segment_readers()
            .iter()
            .fold((0u64, 0u64), |(max, deleted), segment| {
                (max + segment.max_doc() as u64, deleted + segment.num_deleted_docs() as u64)
            });
        crate::interface::IndexStats {
            total_documents: searcher.num_docs(),
            max_documents,
            deleted_documents,
            index_valid: true,
            last_rebuilt_unix: generation.built_at,
        }
    }

    /// Directory of the live generation, if it is on disk
    pub fn live_path(&self) -> Option<PathBuf> {
        self.current().and_then(|g| g.path.clone())
    }
}

/// Lowercase, drop leading wildcards, collapse whitespace
fn sanitize_prefix(prefix: &str) -> String {
    let lowered = prefix.trim().to_lowercase();
    let stripped = lowered.trim_start_matches(['*', '?']);
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Earlier words must match exactly; the last word matches as a prefix or a near-prefix.
fn prefix_query(fields: &FoodFields, tokens: &[String]) -> IndexResult<Box<dyn Query>> {
    let Some((last, leading)) = tokens.split_last() else {
        return Ok(Box::new(BooleanQuery::new(Vec::new())));
    };
    let mut clauses: Vec<(Occur, Box<dyn Query>)> = leading
        .iter()
        .map(|token| {
            let term = Term::from_field_text(fields.name_text, token);
            (Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic)) as Box<dyn Query>)
        })
        .collect();

    let pattern = format!("{}.*", regex::escape(last));
    let regex: Box<dyn Query> = Box::new(RegexQuery::from_pattern(&pattern, fields.name_text)?);
    let term = Term::from_field_text(fields.name_text, last);
    let distance = max_edit_distance(last.chars().count());
    let near: Box<dyn Query> = Box::new(FuzzyTermQuery::new_prefix(term, distance, true));
    clauses.push((
        Occur::Must,
        Box::new(BooleanQuery::new(vec![(Occur::Should, regex), (Occur::Should, near)])),
    ));
    Ok(Box::new(BooleanQuery::new(clauses)))
}

/// Run the prefix query, or an exact match on the same tokens when it could not be built.
/// Names are deduplicated and capped at `max_suggestions`.
fn suggestions(
    generation: &Generation,
    query: IndexResult<Box<dyn Query>>,
    tokens: &[String],
    max_suggestions: usize,
) -> Vec<String> {
    let fetch = max_suggestions.saturating_mul(2);
    let hits = match query {
        Ok(query) => generation.top_docs(query.as_ref(), fetch),
        Err(e) => {
            warn!(tokens = ?tokens, error = %e, "autocomplete query rejected, using exact match");
            generation.top_docs(exact_name_query(&generation.fields, tokens).as_ref(), fetch)
        }
    };
    let hits = match hits {
        Ok(hits) => hits,
        Err(e) => {
            warn!(tokens = ?tokens, error = %e, "autocomplete failed");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    hits.into_iter()
        .map(|r| r.name)
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .take(max_suggestions)
        .collect()
}

fn exact_name_query(fields: &FoodFields, tokens: &[String]) -> Box<dyn Query> {
    let clauses = tokens
        .iter()
        .map(|token| {
            let term = Term::from_field_text(fields.name_text, token);
            (Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic)) as Box<dyn Query>)
        })
        .collect();
    Box::new(BooleanQuery::new(clauses))
}

/// Best-effort removal of every generation directory except `keep`
fn remove_stale_generations(root: &Path, keep: u64) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "cannot list index generations");
            return;
        }
    };
    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        match generation_number(&path) {
            Some(number) if number != keep => {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove old index generation");
                } else {
                    debug!(path = %path.display(), "removed old index generation");
                }
            }
            _ => {}
        }
    }
}
