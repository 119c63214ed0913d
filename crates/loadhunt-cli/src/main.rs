//! Command-line entry point for the load/job hunt board.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use loadhunt_adapters::{
    DescriptionFetcher, JobSearchClient, JobSearchConfig, LlmConfig, LlmScorer, MockScorer,
    RecordSource, SampleFileSource, ScoreCollaborator,
};
use loadhunt_core::{RecordFilter, RecordKind, ScoreConfig};
use loadhunt_store::{QueryRequest, RecordStore, ShortlistRequest};
use loadhunt_sync::{
    run_describe_batch, run_ingest, run_score_batch, DescribeRunConfig, IngestConfig,
    ScoreRunConfig,
};
use loadhunt_web::AppState;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loadhunt", about = "Local board for hunting loads and driving jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    /// Database file. Defaults to LOADHUNT_DB_PATH or ./loadhunt.db.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    origin_city: Option<String>,
    #[arg(long)]
    origin_state: Option<String>,
    #[arg(long)]
    dest_city: Option<String>,
    #[arg(long)]
    dest_state: Option<String>,
    #[arg(long)]
    origin_deadhead_max: Option<i64>,
    #[arg(long)]
    dest_deadhead_max: Option<i64>,
    #[arg(long)]
    location: Option<String>,
    /// May be given more than once; every keyword must match the title.
    #[arg(long = "keyword")]
    keywords: Vec<String>,
    #[arg(long)]
    days: Option<i64>,
}

impl FilterArgs {
    fn into_filter(self) -> RecordFilter {
        RecordFilter {
            pickup_date: self.date,
            origin_city: self.origin_city,
            origin_state: self.origin_state,
            dest_city: self.dest_city,
            dest_state: self.dest_state,
            origin_deadhead_max: self.origin_deadhead_max,
            dest_deadhead_max: self.dest_deadhead_max,
            location: self.location,
            keywords: self.keywords,
            days: self.days,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the JSON API server.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Fetch a feed and reconcile it into the store.
    Ingest {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long, value_parser = parse_kind)]
        kind: RecordKind,
        /// Load capture file (loads only).
        #[arg(long)]
        sample: Option<PathBuf>,
        /// Clear existing records of this kind first.
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Tag the best matching records for working.
    Shortlist {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long, value_parser = parse_kind)]
        kind: RecordKind,
        #[arg(long, default_value = "")]
        tag: String,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        replace: bool,
        #[arg(long, default_value_t = 25)]
        limit: i64,
        #[arg(long)]
        only_unscored: bool,
    },
    /// List records, best scores first.
    Query {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long, value_parser = parse_kind)]
        kind: RecordKind,
        #[arg(long)]
        tag: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Backfill descriptions for jobs that arrived without one.
    Describe {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long, default_value_t = 25)]
        limit: i64,
    },
    /// Score every record carrying a tag.
    Score {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long, value_parser = parse_kind)]
        kind: RecordKind,
        #[arg(long)]
        tag: String,
        /// formula, mock, or llm.
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long)]
        instructions: Option<String>,
        /// Rescore rows that already carry a score.
        #[arg(long)]
        rescore: bool,
    },
    /// Ingest, shortlist, and score in one motion.
    Agent {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long, value_parser = parse_kind, default_value = "load")]
        kind: RecordKind,
        #[arg(long)]
        sample: Option<PathBuf>,
        #[arg(long, default_value = "AGENT")]
        tag: String,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value_t = 25)]
        limit: i64,
        #[arg(long)]
        replace: bool,
        /// Use the deterministic offline scorer instead of the LLM.
        #[arg(long)]
        mock: bool,
        #[arg(long)]
        instructions: Option<String>,
    },
}

fn parse_kind(text: &str) -> Result<RecordKind, String> {
    RecordKind::parse(text).ok_or_else(|| format!("expected job or load, got {text:?}"))
}

fn db_path(args: &StoreArgs) -> PathBuf {
    args.db.clone().unwrap_or_else(|| {
        std::env::var("LOADHUNT_DB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("loadhunt.db"))
    })
}

fn build_source(kind: RecordKind, sample: Option<PathBuf>) -> Result<Box<dyn RecordSource>> {
    match kind {
        RecordKind::Load => {
            let path = sample.unwrap_or_else(|| PathBuf::from("sample_loads.json"));
            Ok(Box::new(SampleFileSource::new(path)))
        }
        RecordKind::Job => Ok(Box::new(
            JobSearchClient::new(JobSearchConfig::from_env())
                .context("building job search client")?,
        )),
    }
}

fn build_collaborator(strategy: &str) -> Result<Box<dyn ScoreCollaborator>> {
    match strategy {
        "mock" => Ok(Box::new(MockScorer)),
        "llm" => Ok(Box::new(
            LlmScorer::new(LlmConfig::from_env()).context("building LLM scorer")?,
        )),
        other => bail!("unknown scoring strategy {other:?}"),
    }
}

fn print_records(records: &[loadhunt_core::Record]) {
    for record in records {
        let score = record
            .match_score
            .map(|s| format!("{s:.1}"))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<7} {:<40} {}", record.state, record.key, score);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port } => {
            let state = Arc::new(AppState::from_env());
            loadhunt_web::serve(state, port).await?;
        }
        Command::Ingest {
            store,
            kind,
            sample,
            overwrite,
            max_pages,
        } => {
            let store = RecordStore::open(db_path(&store)).await?;
            let source = build_source(kind, sample)?;
            let mut config = IngestConfig::from_env();
            config.overwrite = overwrite;
            if let Some(pages) = max_pages {
                config.max_pages = pages;
            }
            let summary = run_ingest(&store, source.as_ref(), &config).await?;
            println!(
                "{}: {} pages, {} returned, {} inserted, {} updated, {} in store",
                summary.kind,
                summary.pages_fetched,
                summary.total_returned,
                summary.inserted,
                summary.updated,
                summary.total_in_store,
            );
        }
        Command::Shortlist {
            store,
            kind,
            tag,
            filter,
            replace,
            limit,
            only_unscored,
        } => {
            let store = RecordStore::open(db_path(&store)).await?;
            let mut filter = filter.into_filter();
            if kind == RecordKind::Job && filter.days.is_none() {
                filter.days = Some(7);
            }
            let outcome = store
                .shortlist(
                    kind,
                    &ShortlistRequest {
                        tag,
                        filter,
                        replace,
                        limit,
                        only_unscored,
                    },
                )
                .await?;
            println!(
                "tag {}: {} marked, {} total",
                outcome.tag, outcome.marked, outcome.total_tagged
            );
        }
        Command::Query {
            store,
            kind,
            tag,
            filter,
            limit,
            offset,
        } => {
            let store = RecordStore::open(db_path(&store)).await?;
            let rows = store
                .query(
                    kind,
                    &QueryRequest {
                        tag,
                        filter: filter.into_filter(),
                        limit,
                        offset,
                        ..QueryRequest::default()
                    },
                )
                .await?;
            println!("{} records", rows.len());
            print_records(&rows);
        }
        Command::Describe { store, limit } => {
            let store = RecordStore::open(db_path(&store)).await?;
            let fetcher = DescriptionFetcher::new(std::time::Duration::from_secs(20))
                .context("building description fetcher")?;
            let summary = run_describe_batch(
                &store,
                &fetcher,
                &DescribeRunConfig {
                    limit,
                    ..DescribeRunConfig::default()
                },
            )
            .await?;
            println!(
                "{} considered, {} described, {} skipped",
                summary.considered, summary.described, summary.skipped
            );
        }
        Command::Score {
            store,
            kind,
            tag,
            strategy,
            limit,
            instructions,
            rescore,
        } => {
            let store = RecordStore::open(db_path(&store)).await?;
            let strategy = strategy.unwrap_or_else(|| {
                match kind {
                    RecordKind::Load => "formula",
                    RecordKind::Job => "llm",
                }
                .to_string()
            });
            if strategy == "formula" {
                let outcome = store
                    .score_shortlisted(kind, &tag, !rescore, limit, &ScoreConfig::default())
                    .await?;
                println!("{} of {} scored", outcome.scored, outcome.considered);
            } else {
                let collaborator = build_collaborator(&strategy)?;
                let mut config = ScoreRunConfig {
                    tag,
                    only_unscored: !rescore,
                    limit,
                    ..ScoreRunConfig::default()
                };
                if let Some(text) = instructions {
                    config.instructions = text;
                }
                let summary =
                    run_score_batch(&store, kind, collaborator.as_ref(), &config).await?;
                println!(
                    "tag {}: {} considered, {} scored, {} skipped",
                    summary.tag, summary.considered, summary.scored, summary.skipped
                );
            }
        }
        Command::Agent {
            store,
            kind,
            sample,
            tag,
            filter,
            limit,
            replace,
            mock,
            instructions,
        } => {
            let store = RecordStore::open(db_path(&store)).await?;
            let source = build_source(kind, sample)?;
            let ingest = run_ingest(&store, source.as_ref(), &IngestConfig::from_env()).await?;
            println!(
                "ingested: {} returned, {} inserted, {} updated",
                ingest.total_returned, ingest.inserted, ingest.updated
            );

            let shortlist = store
                .shortlist(
                    kind,
                    &ShortlistRequest {
                        tag: tag.clone(),
                        filter: filter.into_filter(),
                        replace,
                        limit,
                        only_unscored: false,
                    },
                )
                .await?;
            println!(
                "shortlisted {} under {}",
                shortlist.marked, shortlist.tag
            );

            let collaborator = build_collaborator(if mock { "mock" } else { "llm" })?;
            let mut config = ScoreRunConfig {
                tag: shortlist.tag.clone(),
                limit,
                ..ScoreRunConfig::default()
            };
            if let Some(text) = instructions {
                config.instructions = text;
            }
            let summary = run_score_batch(&store, kind, collaborator.as_ref(), &config).await?;
            println!(
                "scored {} of {} ({} skipped)",
                summary.scored, summary.considered, summary.skipped
            );

            let rows = store
                .query(
                    kind,
                    &QueryRequest {
                        tag: Some(shortlist.tag),
                        limit,
                        ..QueryRequest::default()
                    },
                )
                .await?;
            print_records(&rows);
        }
    }
    Ok(())
}
