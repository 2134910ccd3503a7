mod db;
mod hh;
mod okved;
mod registry;
mod settings;
mod skills;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tracing::{info, warn};

use registry::{CodeScope, OkvedFilter, RegistrySource};
use settings::Settings;

#[derive(Parser)]
#[command(name = "hh_etl", about = "Load EGRUL companies and HH vacancies into SQLite")]
struct Cli {
    /// Settings file (default: ./hh_etl.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create tables
    Init,
    /// Load the OKVED classifier JSON
    Okved {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Filter registry dumps by OKVED prefix and load matching companies
    Companies {
        /// A .json file, a directory of .json files or a .zip archive
        #[arg(short, long)]
        source: Option<PathBuf>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Search HH vacancies and load their details
    Vacancies {
        #[command(flatten)]
        search: SearchArgs,
    },
    /// Most common key skills among vacancies of loaded companies
    TopSkills {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// init + okved + companies + vacancies + top-skills
    Run {
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        search: SearchArgs,
    },
    /// Show row counts
    Stats,
}

#[derive(clap::Args)]
struct FilterArgs {
    /// OKVED prefix, e.g. 61 or 61.10
    #[arg(short, long)]
    prefix: Option<String>,
    /// Which codes to match
    #[arg(long, value_enum, default_value_t = CodeScope::Primary)]
    scope: CodeScope,
}

#[derive(clap::Args)]
struct SearchArgs {
    /// Search text
    #[arg(short, long)]
    text: Option<String>,
    /// Number of vacancies to load
    #[arg(long)]
    total: Option<u32>,
    #[arg(long)]
    per_page: Option<u32>,
}

impl FilterArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(prefix) = &self.prefix {
            settings.okved_prefix = prefix.clone();
        }
    }

    fn filter(&self, settings: &Settings) -> OkvedFilter {
        OkvedFilter::new(settings.okved_prefix.clone(), self.scope)
    }
}

impl SearchArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(text) = &self.text {
            settings.search_text = text.clone();
        }
        if let Some(total) = self.total {
            settings.total_vacancies = total;
        }
        if let Some(per_page) = self.per_page {
            settings.per_page = per_page;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    match &cli.command {
        Commands::Okved { file: Some(file) } => settings.okved_file = file.clone(),
        Commands::Companies { source, filter } => {
            if let Some(source) = source {
                settings.registry_source = source.clone();
            }
            filter.apply(&mut settings);
        }
        Commands::Vacancies { search } => search.apply(&mut settings),
        Commands::TopSkills { limit: Some(n) } => settings.top_skills = *n,
        Commands::Run { filter, search } => {
            filter.apply(&mut settings);
            search.apply(&mut settings);
        }
        _ => {}
    }
    settings.validate()?;

    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn, &settings.companies_table)?;
    info!(db = %settings.db_path.display(), "database ready");

    let result = match cli.command {
        Commands::Init => {
            println!("Tables ready in {}", settings.db_path.display());
            Ok(())
        }
        Commands::Okved { .. } => load_okved(&conn, &settings).map(|_| ()),
        Commands::Companies { filter, .. } => {
            let counts = load_companies(&conn, &settings, &filter.filter(&settings))?;
            counts.print();
            Ok(())
        }
        Commands::Vacancies { .. } => {
            let stats = load_vacancies(&conn, &settings).await?;
            print_vacancy_stats(&stats);
            Ok(())
        }
        Commands::TopSkills { .. } => print_top_skills(&conn, &settings),
        Commands::Run { filter, .. } => {
            // Phase 1: classifier (optional)
            if settings.okved_file.is_file() {
                load_okved(&conn, &settings)?;
            } else {
                info!(file = %settings.okved_file.display(), "no classifier file, skipping");
            }

            // Phase 2: companies
            let t_companies = Instant::now();
            let counts = load_companies(&conn, &settings, &filter.filter(&settings))?;
            counts.print();
            println!("Companies loaded in {}", format_duration(t_companies.elapsed()));

            // Phase 3: vacancies
            let t_vacancies = Instant::now();
            let stats = load_vacancies(&conn, &settings).await?;
            print_vacancy_stats(&stats);
            println!("Vacancies loaded in {}", format_duration(t_vacancies.elapsed()));

            // Phase 4: report
            print_top_skills(&conn, &settings)
        }
        Commands::Stats => {
            let s = db::get_stats(&conn, &settings.companies_table)?;
            println!("OKVED:     {}", s.okved);
            println!("Companies: {}", s.companies);
            println!("Vacancies: {}", s.vacancies);
            println!("Matched:   {}", s.matched_vacancies);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn load_okved(conn: &Connection, settings: &Settings) -> Result<usize> {
    let classifier = okved::read_classifier(&settings.okved_file)?;
    let saved = db::insert_okved(conn, &classifier.entries)?;
    println!(
        "Saved {} classifier entries ({} skipped).",
        saved, classifier.skipped
    );
    Ok(saved)
}

#[derive(Default)]
struct CompanyCounts {
    files: usize,
    skipped_files: usize,
    records: usize,
    missing_ogrn: usize,
    saved: usize,
}

impl CompanyCounts {
    fn print(&self) {
        println!(
            "Read {} files ({} skipped), {} records; saved {} companies.",
            self.files, self.skipped_files, self.records, self.saved,
        );
        if self.missing_ogrn > 0 {
            println!("Dropped {} matching records without an OGRN.", self.missing_ogrn);
        }
    }
}

fn load_companies(
    conn: &Connection,
    settings: &Settings,
    filter: &OkvedFilter,
) -> Result<CompanyCounts> {
    let source = RegistrySource::detect(&settings.registry_source)?;
    info!(source = ?source, prefix = filter.prefix(), "loading companies");

    let pb = ProgressBar::new(source.file_count()? as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files")?
            .progress_chars("#>-"),
    );

    let mut counts = CompanyCounts::default();
    let stats = source.for_each_batch(|name, records| {
        let batch = registry::flatten_batch(&records, filter);
        if batch.missing_ogrn > 0 {
            warn!(file = name, dropped = batch.missing_ogrn, "matching records without ogrn");
        }
        let saved = db::insert_companies(conn, &settings.companies_table, &batch.rows)?;
        info!(file = name, records = records.len(), saved, "loaded registry file");
        counts.missing_ogrn += batch.missing_ogrn;
        counts.saved += saved;
        pb.inc(1);
        Ok(())
    })?;
    pb.finish_and_clear();

    counts.files = stats.files;
    counts.skipped_files = stats.skipped;
    counts.records = stats.records;
    Ok(counts)
}

async fn load_vacancies(conn: &Connection, settings: &Settings) -> Result<hh::LoadStats> {
    let client = Arc::new(hh::HhClient::new(settings)?);
    let query = hh::SearchQuery::from_settings(settings);
    println!(
        "Searching {:?} ({} vacancies, {} per page)...",
        query.text, settings.total_vacancies, query.per_page
    );
    hh::load_vacancies(
        conn,
        client,
        &query,
        settings.total_vacancies,
        settings.concurrency,
    )
    .await
}

fn print_vacancy_stats(stats: &hh::LoadStats) {
    println!(
        "Done: {} pages ({} failed), {} vacancies fetched ({} failed), {} saved.",
        stats.pages, stats.failed_pages, stats.fetched, stats.failed, stats.saved
    );
}

fn print_top_skills(conn: &Connection, settings: &Settings) -> Result<()> {
    let top = skills::top_skills(conn, &settings.companies_table, settings.top_skills)?;
    if top.is_empty() {
        println!("No vacancies matched loaded companies.");
        return Ok(());
    }

    println!("{:>3} | {:<32} | {:>5}", "#", "Skill", "Count");
    println!("{}", "-".repeat(46));
    for (i, s) in top.iter().enumerate() {
        println!("{:>3} | {:<32} | {:>5}", i + 1, truncate(&s.skill, 32), s.count);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
