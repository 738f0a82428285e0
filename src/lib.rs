// Migration Tracker - Core Library
// Reconciles the corporate registry with the energy-market feed and tracks
// companies moving between the regulated and free electricity markets.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod error;
pub mod diagnostics;
pub mod config;
pub mod normalizer;     // Identifier Normalizer
pub mod temporal;       // Monthly periods and ranges
pub mod entities;       // Registry and market records
pub mod db;             // SQLite storage for the five source tables
pub mod sources;        // Normalization, partitioning, fan-out join
pub mod deduplication;  // Deduplicator
pub mod resolution;     // Entity Resolver
pub mod migration;      // Migration Detector
pub mod aggregation;    // Aggregator
pub mod progress;
pub mod pipeline;
pub mod query;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};
pub use diagnostics::{
    Diagnostic, DiagnosticKind, DiagnosticSink, DiagnosticSummary, Severity,
};
pub use config::EngineConfig;
pub use normalizer::{
    format_cnpj, normalize_cnpj, normalize_full_cnpj, normalize_phone, repair_encoding,
    IdentifierError, NormalizedCnpj,
};
pub use temporal::{Period, PeriodRange};
pub use entities::{
    AgentProfile, CompanySnapshot, Establishment, MarketAgentProfile, MarketLoadParcel,
    PartnerRecord, RegistryCompany,
};
pub use db::{
    setup_database, import_csv_dir, load_csv, load_sources, count_rows,
    ImportStats, SourceTables,
};
pub use sources::{fan_out_join, normalize_sources, NormalizedSources, RootPartition};
pub use deduplication::{DedupResult, DeduplicationEngine, JoinedRow};
pub use resolution::{ConsumptionSummary, ContactInfo, EntityResolver, UnifiedCompanyProfile};
pub use migration::{
    transition, MigrationDetector, MigrationDirection, MigrationEvent, PeriodObservation,
    ProfileState, Transition,
};
pub use aggregation::{
    Breakdown, BreakdownGroup, ConsumerRank, ConsumptionTier, Dimension, MigrationWindowSummary,
    PeriodTotal, SnapshotFilter, TierThresholds,
};
pub use progress::{progress, Progress};
pub use pipeline::{
    CancellationSource, CancellationToken, Pipeline, PipelineOutput, QueryOutcome, RootScope,
};
pub use query::{ProfileFilter, QueryEngine, SourceStore, SqliteStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
