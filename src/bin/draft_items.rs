use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use stac_ingestor::discovery::{draft_item, DatetimeRange};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Range {
    Year,
    Month,
    Day,
}

impl From<Range> for DatetimeRange {
    fn from(r: Range) -> Self {
        match r {
            Range::Year => DatetimeRange::Year,
            Range::Month => DatetimeRange::Month,
            Range::Day => DatetimeRange::Day,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print STAC item drafts for object keys, dating each from its file name"
)]
struct Args {
    /// Collection the items belong to
    #[arg(long)]
    collection: String,

    /// Bucket holding the objects
    #[arg(long)]
    bucket: String,

    /// Period a single date in a file name covers
    #[arg(long, value_enum)]
    datetime_range: Option<Range>,

    /// File with one object key per line (alternative to positional keys)
    #[arg(long)]
    keys_file: Option<PathBuf>,

    /// Object keys
    keys: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let mut keys = args.keys.clone();
    if let Some(path) = &args.keys_file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        keys.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
    }

    let range = args.datetime_range.map(DatetimeRange::from);
    let mut skipped = 0;
    for key in &keys {
        match draft_item(&args.collection, &args.bucket, key, range) {
            Ok(item) => println!("{}", serde_json::to_string(&item)?),
            Err(err) => {
                warn!(%key, error = %err, "skipping key");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, total = keys.len(), "some keys had no usable dates");
    }
    Ok(())
}
