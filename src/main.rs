use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use migration_tracker::{
    import_csv_dir, Dimension, EngineConfig, Period, PeriodRange, ProfileFilter, QueryEngine,
    QueryOutcome, SnapshotFilter,
};

#[derive(Parser, Debug)]
#[command(
    name = "migration-tracker",
    version,
    about = "Tracks companies migrating between the regulated and free energy markets"
)]
struct Cli {
    /// JSON config file (every field optional)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overrides config and MIGRATION_TRACKER_DB
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print every diagnostic, not only the summary
    #[arg(long, global = true)]
    diagnostics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// State (UF), e.g. SP
    #[arg(long)]
    uf: Option<String>,

    #[arg(long)]
    city: Option<String>,

    /// First period, YYYY-MM
    #[arg(long)]
    from: Option<Period>,

    /// Last period, YYYY-MM
    #[arg(long)]
    to: Option<Period>,

    /// Activity code (CNAE)
    #[arg(long)]
    activity: Option<String>,

    /// Company size tier from the registry (porte)
    #[arg(long)]
    size: Option<String>,

    /// SUDESTE, SUL, NORDESTE or NORTE
    #[arg(long)]
    submarket: Option<String>,
}

impl FilterArgs {
    fn periods(&self) -> PeriodRange {
        PeriodRange::new(self.from, self.to)
    }

    fn snapshot_filter(&self) -> SnapshotFilter {
        SnapshotFilter {
            state_uf: self.uf.clone(),
            city: self.city.clone(),
            activity_code: self.activity.clone(),
            size_tier: self.size.clone(),
            submarket: self.submarket.clone(),
            agent_profile: None,
            periods: self.periods(),
        }
    }

    fn profile_filter(&self) -> ProfileFilter {
        ProfileFilter {
            state_uf: self.uf.clone(),
            city: self.city.clone(),
            activity_code: self.activity.clone(),
            size_tier: self.size.clone(),
            submarket: self.submarket.clone(),
            periods: self.periods(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load <table>.csv extracts from a directory into the database
    Import { dir: PathBuf },

    /// Unified profile of one company (root or full CNPJ, any notation)
    Profile { cnpj: String },

    /// Profiles matching location, activity, size, submarket and period filters
    Companies {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Migration events, for one company or for a period range
    Events {
        #[arg(long)]
        root: Option<String>,
        #[arg(long)]
        from: Option<Period>,
        #[arg(long)]
        to: Option<Period>,
    },

    /// Company counts and shares by state, activity_code, size_tier,
    /// agent_profile, submarket or consumption_tier
    Breakdown {
        dimension: Dimension,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Top consumers by accumulated consumption
    Top {
        #[arg(long)]
        n: Option<usize>,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Per-period consumption and migration totals
    Periods {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Migrations within the last N years
    Window {
        #[arg(long)]
        reference: Option<Period>,
        #[arg(long)]
        years: Option<u32>,
    },

    /// Rows loaded in a source table against an expected count
    Progress { table: String, expected: u64 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }

    match cli.command {
        Command::Import { dir } => run_import(&config, &dir),
        command => run_query(QueryEngine::open(config), command, cli.diagnostics),
    }
}

fn run_import(config: &EngineConfig, dir: &Path) -> Result<()> {
    println!("🗄️  Import - CSV extracts → SQLite + WAL");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Reading extracts from {:?}...", dir);
    let mut conn = Connection::open(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;

    let stats = import_csv_dir(&mut conn, dir)?;

    println!("\n💾 Rows inserted:");
    println!("  registry_companies       {:>10}", stats.companies);
    println!("  registry_establishments  {:>10}", stats.establishments);
    println!("  registry_partners        {:>10}", stats.partners);
    println!("  market_load_parcels      {:>10}", stats.load_parcels);
    println!("  market_agent_profiles    {:>10}", stats.agent_profiles);

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if stats.missing_files.is_empty() {
        println!("✅ All five extracts imported into {:?}", config.database_path);
    } else {
        println!("⚠️  Missing extracts: {}", stats.missing_files.join(", "));
    }

    Ok(())
}

fn run_query(engine: QueryEngine, command: Command, verbose: bool) -> Result<()> {
    match command {
        Command::Profile { cnpj } => {
            let outcome = engine.profile_by_root(&cnpj)?;
            match &outcome.data {
                Some(profile) => eprintln!("🏢 {} ({})", profile.display_name(), profile.cnpj_root),
                None => eprintln!("⚠️  No company found for {}", cnpj),
            }
            emit(outcome, verbose)
        }
        Command::Companies { filter } => {
            emit(engine.profiles_by_filter(&filter.profile_filter())?, verbose)
        }
        Command::Events { root: Some(root), .. } => emit(engine.events_for_root(&root)?, verbose),
        Command::Events { root: None, from, to } => {
            emit(engine.events_in_range(PeriodRange::new(from, to))?, verbose)
        }
        Command::Breakdown { dimension, filter } => {
            let outcome = engine.breakdown(dimension, &filter.snapshot_filter())?;
            eprintln!("{}", outcome.data.summary());
            emit(outcome, verbose)
        }
        Command::Top { n, filter } => {
            emit(engine.top_consumers(&filter.snapshot_filter(), n)?, verbose)
        }
        Command::Periods { filter } => {
            emit(engine.period_totals(&filter.snapshot_filter())?, verbose)
        }
        Command::Window { reference, years } => {
            emit(engine.migration_window(reference, years)?, verbose)
        }
        Command::Progress { table, expected } => {
            let p = engine.progress(&table, expected)?;
            let mark = if p.is_complete() { "✅" } else { "⏳" };
            eprintln!("{} {}", mark, p.describe());
            println!("{}", serde_json::to_string_pretty(&p)?);
            Ok(())
        }
        Command::Import { .. } => anyhow::bail!("import does not run through the query engine"),
    }
}

/// Result as pretty JSON on stdout; diagnostics on stderr
fn emit<T: Serialize>(outcome: QueryOutcome<T>, verbose: bool) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&outcome.data)?);

    let summary = outcome.diagnostics.summary();
    if summary.total > 0 {
        eprintln!("{}", summary.describe());
    }
    if summary.has_critical() {
        eprintln!("❌ Critical diagnostics: some source rows were excluded from the result");
    }
    if verbose {
        for d in outcome.diagnostics.entries() {
            eprintln!("  [{:?}] {} {} {}", d.severity, d.kind.as_str(), d.key, d.message);
        }
    }
    if outcome.cancelled {
        eprintln!("⚠️  Query cancelled, results are partial");
    }

    Ok(())
}
