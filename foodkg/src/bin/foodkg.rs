//! FoodKG command line interface.
//!
//! Seeds the SQLite graph, maintains the text index and runs searches or photo
//! recognition against them.
//!
//! Usage:
//!     foodkg --config foodkg.toml import foods.json
//!     foodkg search --text "ban" --max-calories 100
//!     foodkg recognize photo.jpg --threshold 0.5

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use foodkg::{FoodKgApi, FoodKgConfig, FoodKgStore, FoodRecord, SearchQuery, SqliteGraph};
use foodkg::{SortDirection, SortKey};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Graph database, overriding `database_path` from the config
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a JSON array of food records into the graph database
    Import { file: PathBuf },
    /// Rebuild the text index from the graph
    Reindex,
    /// Search the catalog
    Search {
        #[arg(short, long)]
        text: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        min_calories: Option<f64>,
        #[arg(long)]
        max_calories: Option<f64>,
        #[arg(long)]
        min_protein: Option<f64>,
        #[arg(long)]
        max_protein: Option<f64>,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long)]
        size: Option<usize>,
        /// relevance, name, calories or protein
        #[arg(long, default_value = "relevance")]
        sort: String,
        #[arg(long)]
        desc: bool,
    },
    /// Suggest food names for a prefix
    Autocomplete {
        prefix: String,
        #[arg(short, long, default_value_t = 0)]
        max: usize,
    },
    /// Print index statistics
    Stats,
    /// Identify the food category of a photo
    Recognize {
        image: PathBuf,
        #[arg(short, long)]
        threshold: Option<f64>,
        #[arg(short, long)]
        max: Option<usize>,
    },
    /// Resolve names to food uris; the first resolvable name wins
    Resolve {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

fn parse_sort(raw: &str) -> Result<SortKey> {
    match raw.to_ascii_lowercase().as_str() {
        "relevance" => Ok(SortKey::Relevance),
        "name" => Ok(SortKey::Name),
        "calories" => Ok(SortKey::Calories),
        "protein" => Ok(SortKey::Protein),
        other => anyhow::bail!("Unknown sort key: '{}'. Must be relevance, name, calories or protein.", other),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foodkg=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FoodKgConfig::load(path)?,
        None => FoodKgConfig::default(),
    };
    if let Some(database) = args.database {
        config.database_path = Some(database);
    }
    if config.database_path.is_none() {
        config.database_path = Some(PathBuf::from("./foodkg.db"));
    }

    if let Command::Import { file } = &args.command {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let records: Vec<FoodRecord> =
            serde_json::from_str(&content).with_context(|| "Failed to parse food records")?;
        let database = config.database_path.clone().unwrap_or_default();
        let graph = SqliteGraph::open(&database)
            .with_context(|| format!("Failed to open graph database {}", database.display()))?;
        let count = graph.import_records(&records)?;
        println!("Imported {} foods into {}", count, database.display());
        let store = FoodKgStore::open(config, Arc::new(graph))?;
        // A fresh index was already built from the imported graph
        let docs = if store.indexed_at_startup() {
            store.index_stats().total_documents
        } else {
            store.rebuild_index().await?
        };
        println!("Indexed {} documents", docs);
        return Ok(());
    }

    let store = FoodKgStore::open_with_database(config)?;

    match args.command {
        Command::Import { .. } => {}
        Command::Reindex => {
            let docs = store.rebuild_index().await?;
            println!("Indexed {} documents", docs);
        }
        Command::Search {
            text,
            category,
            group,
            min_calories,
            max_calories,
            min_protein,
            max_protein,
            page,
            size,
            sort,
            desc,
        } => {
            let direction = if desc { SortDirection::Desc } else { SortDirection::Asc };
            let mut query = SearchQuery::default()
                .with_calories(min_calories, max_calories)
                .with_protein(min_protein, max_protein)
                .with_page(page, size.unwrap_or(store.config().search.default_page_size))
                .sorted_by(parse_sort(&sort)?, direction);
            query.query = text;
            query.category = category;
            query.group = group;
            let result = store.search(query).await?;
            print_json(&result)?;
        }
        Command::Autocomplete { prefix, max } => {
            for suggestion in store.autocomplete(&prefix, max) {
                println!("{}", suggestion);
            }
        }
        Command::Stats => {
            print_json(&store.index_stats())?;
            if let Some(location) = store.index_location() {
                println!("Index location: {}", location.display());
            }
        }
        Command::Recognize { image, threshold, max } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read image {}", image.display()))?;
            let threshold = threshold.unwrap_or(store.config().recognition.default_confidence_threshold);
            let max = max.unwrap_or(store.config().recognition.default_max_results);
            let result = store.recognize(bytes, threshold, max).await?;
            print_json(&result)?;
        }
        Command::Resolve { names } => match store.find_food_uri_by_name_variants(&names) {
            Some(uri) => println!("{}", uri),
            None => anyhow::bail!("No food matches {:?}", names),
        },
    }

    Ok(())
}
