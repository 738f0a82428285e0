// 🔎 Query Engine - read-only query API over the two sources
//
// Every query reads the source tables fresh and runs the pipeline; nothing is
// cached between queries. A missing source table fails the query.

use crate::aggregation::{
    self, text_matches, Breakdown, ConsumerRank, Dimension, MigrationWindowSummary,
    PeriodTotal, SnapshotFilter, TierThresholds,
};
use crate::config::EngineConfig;
use crate::db::{self, SourceTables, SOURCE_TABLES};
use crate::error::{EngineError, EngineResult};
use crate::migration::MigrationEvent;
use crate::normalizer::normalize_cnpj;
use crate::pipeline::{CancellationSource, Pipeline, PipelineOutput, QueryOutcome, RootScope};
use crate::progress::{progress, Progress};
use crate::resolution::UnifiedCompanyProfile;
use crate::temporal::{Period, PeriodRange};
use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ============================================================================
// SOURCE STORE
// ============================================================================

/// Where the five source tables come from
pub trait SourceStore: Send + Sync {
    fn load(&self) -> EngineResult<SourceTables>;
    fn count_rows(&self, table: &str) -> EngineResult<u64>;
}

/// SQLite file opened per query. The engine only ever reads from it.
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        SqliteStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> EngineResult<Connection> {
        if !self.path.exists() {
            return Err(EngineError::source_unavailable(
                &SOURCE_TABLES.join(", "),
                format!("database {:?} not found", self.path),
            ));
        }
        // No CREATE flag: a vanished file must not come back as an empty database
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| EngineError::source_unavailable(&SOURCE_TABLES.join(", "), e))
    }
}

impl SourceStore for SqliteStore {
    fn load(&self) -> EngineResult<SourceTables> {
        let conn = self.open()?;
        db::load_sources(&conn)
    }

    fn count_rows(&self, table: &str) -> EngineResult<u64> {
        let conn = self.open()?;
        Ok(db::count_rows(&conn, table)?.max(0) as u64)
    }
}

/// In-memory tables, used by tests and callers that already hold the rows
impl SourceStore for SourceTables {
    fn load(&self) -> EngineResult<SourceTables> {
        Ok(self.clone())
    }

    fn count_rows(&self, table: &str) -> EngineResult<u64> {
        let count = match table {
            db::REGISTRY_COMPANIES => self.companies.len(),
            db::REGISTRY_ESTABLISHMENTS => self.establishments.len(),
            db::REGISTRY_PARTNERS => self.partners.len(),
            db::MARKET_LOAD_PARCELS => self.load_parcels.len(),
            db::MARKET_AGENT_PROFILES => self.agent_profiles.len(),
            other => return Err(EngineError::InvalidQuery(format!("unknown table `{}`", other))),
        };
        Ok(count as u64)
    }
}

// ============================================================================
// FILTERS
// ============================================================================

/// Profile search: location, activity, size, submarket and observation period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFilter {
    pub state_uf: Option<String>,
    pub city: Option<String>,
    pub activity_code: Option<String>,
    pub size_tier: Option<String>,
    pub submarket: Option<String>,
    pub periods: PeriodRange,
}

impl ProfileFilter {
    pub fn matches(&self, profile: &UnifiedCompanyProfile) -> bool {
        let activity_ok = self
            .activity_code
            .as_deref()
            .map_or(true, |code| profile.has_activity(code));
        let period_ok = (self.periods.from.is_none() && self.periods.to.is_none())
            || profile.observed_in(self.periods.from, self.periods.to);

        text_matches(&self.state_uf, profile.state_uf.as_deref())
            && text_matches(&self.city, profile.city.as_deref())
            && text_matches(&self.size_tier, profile.size_tier.as_deref())
            && text_matches(&self.submarket, profile.submarket.as_deref())
            && activity_ok
            && period_ok
    }
}

// ============================================================================
// QUERY ENGINE
// ============================================================================

pub struct QueryEngine {
    store: Box<dyn SourceStore>,
    config: EngineConfig,
    pipeline: Pipeline,
    cancel: CancellationSource,
}

impl QueryEngine {
    pub fn new<S: SourceStore + 'static>(store: S, config: EngineConfig) -> Self {
        QueryEngine {
            store: Box::new(store),
            pipeline: Pipeline::from_config(&config),
            config,
            cancel: CancellationSource::new(),
        }
    }

    /// Engine over the SQLite file named in the config
    pub fn open(config: EngineConfig) -> Self {
        let store = SqliteStore::new(&config.database_path);
        Self::new(store, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancels the queries running on this engine right now. Queries started
    /// afterwards run normally.
    pub fn cancellation(&self) -> CancellationSource {
        self.cancel.clone()
    }

    fn run(&self, scope: &RootScope) -> EngineResult<QueryOutcome<PipelineOutput>> {
        let token = self.cancel.token();
        let raw = self.store.load()?;
        Ok(self.pipeline.run(&raw, scope, &token))
    }

    fn root_of(cnpj: &str) -> EngineResult<String> {
        normalize_cnpj(cnpj)
            .map(|c| c.root)
            .map_err(|e| EngineError::InvalidQuery(e.to_string()))
    }

    fn thresholds(&self) -> TierThresholds {
        TierThresholds::from(&self.config)
    }

    // ------------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------------

    /// Accepts a root or a full CNPJ in any notation
    pub fn profile_by_root(
        &self,
        cnpj: &str,
    ) -> EngineResult<QueryOutcome<Option<UnifiedCompanyProfile>>> {
        let root = Self::root_of(cnpj)?;
        let outcome = self.run(&RootScope::single(&root))?;
        Ok(outcome.map(|out| out.profiles.into_iter().next()))
    }

    pub fn profiles_by_filter(
        &self,
        filter: &ProfileFilter,
    ) -> EngineResult<QueryOutcome<Vec<UnifiedCompanyProfile>>> {
        let outcome = self.run(&RootScope::All)?;
        Ok(outcome.map(|out| {
            out.profiles
                .into_iter()
                .filter(|p| filter.matches(p))
                .collect()
        }))
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Ascending by period
    pub fn events_for_root(&self, cnpj: &str) -> EngineResult<QueryOutcome<Vec<MigrationEvent>>> {
        let root = Self::root_of(cnpj)?;
        let outcome = self.run(&RootScope::single(&root))?;
        Ok(outcome.map(|out| out.events))
    }

    /// Ascending by (period, cnpj_root)
    pub fn events_in_range(
        &self,
        range: PeriodRange,
    ) -> EngineResult<QueryOutcome<Vec<MigrationEvent>>> {
        let outcome = self.run(&RootScope::All)?;
        Ok(outcome.map(|out| {
            let mut events: Vec<MigrationEvent> = out
                .events
                .into_iter()
                .filter(|e| range.contains(&e.period_observed))
                .collect();
            events.sort_by(|a, b| {
                a.period_observed
                    .cmp(&b.period_observed)
                    .then_with(|| a.cnpj_root.cmp(&b.cnpj_root))
            });
            events
        }))
    }

    // ------------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------------

    pub fn breakdown(
        &self,
        dimension: Dimension,
        filter: &SnapshotFilter,
    ) -> EngineResult<QueryOutcome<Breakdown>> {
        let thresholds = self.thresholds();
        let tolerance = self.config.percentage_tolerance;
        let outcome = self.run(&RootScope::All)?;

        Ok(outcome.map(|out| {
            let result = aggregation::breakdown(&out.snapshots, dimension, filter, &thresholds);
            if !result.is_consistent(tolerance) {
                warn!(
                    dimension = %dimension,
                    sum = result.percentage_sum(),
                    "Breakdown percentages outside tolerance"
                );
            }
            result
        }))
    }

    pub fn period_totals(
        &self,
        filter: &SnapshotFilter,
    ) -> EngineResult<QueryOutcome<Vec<PeriodTotal>>> {
        let outcome = self.run(&RootScope::All)?;
        Ok(outcome.map(|out| aggregation::period_totals(&out.snapshots, &out.events, filter)))
    }

    /// `n` defaults to the configured top_n
    pub fn top_consumers(
        &self,
        filter: &SnapshotFilter,
        n: Option<usize>,
    ) -> EngineResult<QueryOutcome<Vec<ConsumerRank>>> {
        let n = n.unwrap_or(self.config.top_n);
        let thresholds = self.thresholds();
        let outcome = self.run(&RootScope::All)?;
        Ok(outcome.map(|out| aggregation::top_consumers(&out.snapshots, filter, n, &thresholds)))
    }

    /// Reference defaults to the latest period in the data (or today when
    /// there is none); years default to the configured window.
    pub fn migration_window(
        &self,
        reference: Option<Period>,
        years: Option<u32>,
    ) -> EngineResult<QueryOutcome<MigrationWindowSummary>> {
        let years = years.unwrap_or(self.config.migration_window_years);
        let outcome = self.run(&RootScope::All)?;

        Ok(outcome.map(|out| {
            let reference = reference
                .or_else(|| out.snapshots.iter().map(|s| s.period).max())
                .unwrap_or_else(|| Period::from_date(Utc::now().date_naive()));
            let summary = aggregation::migration_window(&out.events, reference, years);
            info!(reference = %reference, "{}", summary.summary());
            summary
        }))
    }

    // ------------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------------

    pub fn progress(&self, table: &str, expected: u64) -> EngineResult<Progress> {
        let current = self.store.count_rows(table)?;
        Ok(progress(current, expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        insert_companies, insert_load_parcels, setup_database, RawCompanyRow,
        RawEstablishmentRow, RawLoadParcelRow,
    };
    use crate::diagnostics::DiagnosticKind;
    use crate::entities::AgentProfile;

    fn parcel(cnpj: &str, period: &str, profile: &str, mwh: Option<&str>) -> RawLoadParcelRow {
        RawLoadParcelRow {
            cnpj_full: cnpj.to_string(),
            period: period.to_string(),
            agent_profile: Some(profile.to_string()),
            consumption_total: mwh.map(str::to_string),
            state_uf: Some("SP".to_string()),
            activity_code: Some("3511501".to_string()),
            ..Default::default()
        }
    }

    fn create_test_engine() -> QueryEngine {
        let tables = SourceTables {
            companies: vec![RawCompanyRow {
                cnpj_root: "00080044".to_string(),
                legal_name: Some("ACME ENERGIA LTDA".to_string()),
                size_tier: Some("Medium".to_string()),
                imported_at: Some("2025-01-10".to_string()),
            }],
            establishments: vec![RawEstablishmentRow {
                cnpj_full: "00080044000199".to_string(),
                state_uf: Some("SP".to_string()),
                primary_activity: Some("3511501".to_string()),
                ..Default::default()
            }],
            load_parcels: vec![
                parcel("00080044000199", "2025-01", "Especial", Some("100")),
                parcel("00080044000199", "2025-02", "Especial", Some("100")),
                parcel("00080044000199", "2025-03", "Livre", Some("120")),
                parcel("11222333000181", "2025-02", "Cativo", Some("700")),
                parcel("11222333000181", "2025-03", "Varejista", None),
            ],
            ..Default::default()
        };
        let config = EngineConfig {
            parallel: false,
            ..Default::default()
        };
        QueryEngine::new(tables, config)
    }

    #[test]
    fn test_profile_by_root_any_notation() {
        let engine = create_test_engine();
        let outcome = engine.profile_by_root("00.080.044/0001-99").unwrap();
        let profile = outcome.data.unwrap();

        assert_eq!(profile.cnpj_root, "00080044");
        assert_eq!(profile.legal_name.as_deref(), Some("ACME ENERGIA LTDA"));
        assert_eq!(profile.current_profile, Some(AgentProfile::FreeConsumer));

        assert!(engine.profile_by_root("99999999").unwrap().data.is_none());
        assert!(matches!(
            engine.profile_by_root("not-a-cnpj"),
            Err(EngineError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_profiles_by_filter() {
        let engine = create_test_engine();
        let filter = ProfileFilter {
            activity_code: Some("3511501".to_string()),
            periods: PeriodRange::new(Some("2025-01".parse().unwrap()), None),
            ..Default::default()
        };
        let profiles = engine.profiles_by_filter(&filter).unwrap().data;
        assert_eq!(profiles.len(), 2);

        let only_january = ProfileFilter {
            periods: PeriodRange::new(None, Some("2025-01".parse().unwrap())),
            ..Default::default()
        };
        let profiles = engine.profiles_by_filter(&only_january).unwrap().data;
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].cnpj_root, "00080044");
    }

    #[test]
    fn test_events_by_root_and_range() {
        let engine = create_test_engine();

        let events = engine.events_for_root("80044").unwrap().data;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_profile, AgentProfile::FreeConsumer);

        let march = "2025-03".parse().unwrap();
        let events = engine
            .events_in_range(PeriodRange::new(Some(march), Some(march)))
            .unwrap()
            .data;
        let roots: Vec<&str> = events.iter().map(|e| e.cnpj_root.as_str()).collect();
        assert_eq!(roots, vec!["00080044", "11222333"]);
    }

    #[test]
    fn test_aggregates() {
        let engine = create_test_engine();

        let by_profile = engine
            .breakdown(Dimension::AgentProfile, &SnapshotFilter::all())
            .unwrap();
        assert!(by_profile.data.is_consistent(0.1));
        assert_eq!(by_profile.data.total_companies, 2);
        assert_eq!(by_profile.diagnostics.count(DiagnosticKind::UnregisteredInSource), 1);

        let top = engine.top_consumers(&SnapshotFilter::all(), Some(1)).unwrap().data;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].cnpj_root, "11222333");

        let totals = engine.period_totals(&SnapshotFilter::all()).unwrap().data;
        assert_eq!(totals.len(), 3);
        assert_eq!(totals[2].migrating_companies, 2);

        let window = engine.migration_window(None, None).unwrap().data;
        assert_eq!(window.events, 2);
        assert_eq!(window.window.to, Some("2025-03".parse().unwrap()));
    }

    #[test]
    fn test_progress_counts_store_rows() {
        let engine = create_test_engine();
        let p = engine.progress(db::MARKET_LOAD_PARCELS, 10).unwrap();
        assert_eq!(p.current, 5);
        assert_eq!(p.percent, 50.0);
        assert!(engine.progress("nope", 10).is_err());
    }

    #[test]
    fn test_cancel_does_not_poison_later_queries() {
        let engine = create_test_engine();
        engine.cancellation().cancel_all();

        let first = engine.profiles_by_filter(&ProfileFilter::default()).unwrap();
        assert!(!first.cancelled);
        assert_eq!(first.data.len(), 2);

        let second = engine.events_for_root("80044").unwrap();
        assert!(!second.cancelled);
        assert_eq!(second.data.len(), 1);

        let third = engine.profile_by_root("11222333").unwrap();
        assert!(!third.cancelled);
        assert!(third.data.is_some());
    }

    #[test]
    fn test_profiles_by_city_size_and_submarket() {
        let mut tables = SourceTables {
            companies: vec![RawCompanyRow {
                cnpj_root: "00080044".to_string(),
                size_tier: Some("Medium".to_string()),
                ..Default::default()
            }],
            establishments: vec![RawEstablishmentRow {
                cnpj_full: "00080044000199".to_string(),
                state_uf: Some("SP".to_string()),
                city: Some("CAMPINAS".to_string()),
                ..Default::default()
            }],
            load_parcels: vec![
                parcel("00080044000199", "2025-01", "Livre", Some("10")),
                parcel("11222333000181", "2025-01", "Livre", Some("10")),
            ],
            ..Default::default()
        };
        tables.load_parcels[0].submarket = Some("SUDESTE".to_string());
        tables.load_parcels[1].submarket = Some("SUL".to_string());
        let engine = QueryEngine::new(
            tables,
            EngineConfig {
                parallel: false,
                ..Default::default()
            },
        );

        let roots = |filter: ProfileFilter| -> Vec<String> {
            engine
                .profiles_by_filter(&filter)
                .unwrap()
                .data
                .into_iter()
                .map(|p| p.cnpj_root)
                .collect()
        };

        let by_city = ProfileFilter {
            city: Some("campinas".to_string()),
            ..Default::default()
        };
        assert_eq!(roots(by_city), vec!["00080044"]);

        let by_size = ProfileFilter {
            size_tier: Some("Medium".to_string()),
            ..Default::default()
        };
        assert_eq!(roots(by_size), vec!["00080044"]);

        let by_submarket = ProfileFilter {
            submarket: Some("SUL".to_string()),
            ..Default::default()
        };
        assert_eq!(roots(by_submarket), vec!["11222333"]);
    }

    #[test]
    fn test_sqlite_store_missing_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE registry_companies (id INTEGER, cnpj_root TEXT, legal_name TEXT, size_tier TEXT, imported_at TEXT);",
            )
            .unwrap();
        }

        let config = EngineConfig {
            database_path: path,
            ..Default::default()
        };
        let engine = QueryEngine::open(config);
        let err = engine.profiles_by_filter(&ProfileFilter::default()).unwrap_err();
        assert!(err.is_fatal_source_failure());
    }

    #[test]
    fn test_sqlite_store_opens_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        {
            let conn = Connection::open(&path).unwrap();
            setup_database(&conn).unwrap();
        }

        let store = SqliteStore::new(&path);
        let conn = store.open().unwrap();
        assert!(conn
            .execute("DELETE FROM registry_companies", [])
            .is_err());
    }

    #[test]
    fn test_sqlite_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        {
            let conn = Connection::open(&path).unwrap();
            setup_database(&conn).unwrap();
            insert_companies(
                &conn,
                &[RawCompanyRow {
                    cnpj_root: "80044".to_string(),
                    ..Default::default()
                }],
            )
            .unwrap();
            insert_load_parcels(&conn, &[parcel("80044000199", "2025-01", "CL", Some("1"))])
                .unwrap();
        }

        let engine = QueryEngine::open(EngineConfig {
            database_path: path,
            parallel: false,
            ..Default::default()
        });
        let profile = engine.profile_by_root("80044").unwrap().data.unwrap();
        assert!(profile.market_participant);
        assert!(!profile.unregistered_in_source);
    }
}
