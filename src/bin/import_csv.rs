//! Bulk-load a directory of CSV files into Postgres, one table per file.
//!
//! Every column is created as TEXT; the translation pipeline reads types back
//! out of information_schema, so typed loading is a separate concern for
//! whoever curates the dataset.

use anyhow::{bail, Context};
use clap::Parser;
use katana_nlq::config::Config;
use katana_nlq::db;
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::postgres::PgPool;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "import_csv", about = "Import CSV files into the query database")]
struct Args {
    /// Directory containing .csv files (one table per file)
    #[arg(long, default_value = "data")]
    dir: PathBuf,

    /// Drop and recreate each table instead of appending
    #[arg(long)]
    replace: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let pool = db::init_pool(&config.database_url()).await?;

    let mut files: Vec<PathBuf> = std::fs::read_dir(&args.dir)
        .with_context(|| format!("reading directory {}", args.dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .collect();
    files.sort();

    if files.is_empty() {
        bail!("no .csv files found in {}", args.dir.display());
    }

    for path in &files {
        import_file(&pool, path, args.replace).await?;
    }

    info!(files = files.len(), "import complete");
    Ok(())
}

async fn import_file(pool: &PgPool, path: &Path, replace: bool) -> anyhow::Result<()> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("bad file name: {}", path.display()))?;
    let table = normalize_identifier(stem);

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV header row")?
        .iter()
        .map(normalize_identifier)
        .collect();
    if headers.is_empty() {
        warn!(file = %path.display(), "skipping file with no columns");
        return Ok(());
    }

    if replace {
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table))
            .execute(pool)
            .await?;
    }

    let column_defs = headers
        .iter()
        .map(|h| format!("\"{}\" TEXT", h))
        .collect::<Vec<_>>()
        .join(", ");
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        table, column_defs
    ))
    .execute(pool)
    .await?;

    let placeholders = (1..=headers.len())
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let column_list = headers
        .iter()
        .map(|h| format!("\"{}\"", h))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        table, column_list, placeholders
    );

    let mut inserted = 0u64;
    for record in reader.records() {
        let record = record.context("reading CSV record")?;
        let mut insert = sqlx::query(&insert_sql);
        for i in 0..headers.len() {
            let cell = record.get(i).unwrap_or("").trim();
            if cell.is_empty() {
                insert = insert.bind(None::<String>);
            } else {
                insert = insert.bind(cell.to_string());
            }
        }
        insert.execute(pool).await?;
        inserted += 1;
    }

    info!(table = %table, rows = inserted, "table loaded");
    Ok(())
}

/// Lowercase, squeeze non-alphanumeric runs to underscores, and prefix names
/// that start with a digit so they stay valid unquoted identifiers.
fn normalize_identifier(raw: &str) -> String {
    lazy_static! {
        static ref NON_ALNUM: Regex = Regex::new(r"[^a-zA-Z0-9]+").unwrap();
    }
    let squeezed = NON_ALNUM.replace_all(raw.trim(), "_").to_lowercase();
    let trimmed = squeezed.trim_matches('_').to_string();
    let name = if trimmed.is_empty() { "col".to_string() } else { trimmed };
    if name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        format!("t_{}", name)
    } else {
        name
    }
}
