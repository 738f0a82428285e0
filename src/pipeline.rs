// ⚙️ Pipeline - raw rows to profiles, snapshots and events
//
// normalize -> partition by cnpj_root -> (fan-out join -> dedup -> resolve ->
// detect) per partition. Partitions share nothing, so they run on the rayon
// pool. Cancellation is checked before each partition starts; finished
// partitions are kept and the outcome is marked cancelled.

use crate::config::EngineConfig;
use crate::db::SourceTables;
use crate::deduplication::DeduplicationEngine;
use crate::diagnostics::DiagnosticSink;
use crate::entities::CompanySnapshot;
use crate::migration::{MigrationDetector, MigrationEvent};
use crate::resolution::{EntityResolver, UnifiedCompanyProfile};
use crate::sources::{fan_out_join, normalize_sources, RootPartition};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

// ============================================================================
// CANCELLATION
// ============================================================================

/// Checked by workers between partitions. Cancelled either directly or by the
/// `CancellationSource` that issued it.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    issued: Option<(Arc<AtomicU64>, u64)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            issued: None,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self
                .issued
                .as_ref()
                .map_or(false, |(epoch, at)| epoch.load(Ordering::Relaxed) != *at)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Issues one token per query. `cancel_all` trips every token issued so far;
/// tokens issued afterwards start clear.
#[derive(Debug, Clone, Default)]
pub struct CancellationSource {
    epoch: Arc<AtomicU64>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            flag: Arc::new(AtomicBool::new(false)),
            issued: Some((self.epoch.clone(), self.epoch.load(Ordering::SeqCst))),
        }
    }

    pub fn cancel_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// Result set plus the diagnostics gathered while producing it
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome<T> {
    pub data: T,
    pub diagnostics: DiagnosticSink,

    /// Some partitions were skipped; `data` covers only the finished ones
    pub cancelled: bool,
}

impl<T> QueryOutcome<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> QueryOutcome<U> {
        QueryOutcome {
            data: f(self.data),
            diagnostics: self.diagnostics,
            cancelled: self.cancelled,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineOutput {
    /// Ascending by cnpj_root
    pub profiles: Vec<UnifiedCompanyProfile>,

    /// Ascending by (cnpj_root, cnpj_full, period)
    pub snapshots: Vec<CompanySnapshot>,

    /// Ascending by (cnpj_root, period)
    pub events: Vec<MigrationEvent>,

    pub partitions_total: usize,
    pub partitions_done: usize,
}

/// Which roots a query needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootScope {
    All,
    Only(BTreeSet<String>),
}

impl RootScope {
    pub fn single(root: &str) -> Self {
        RootScope::Only(std::iter::once(root.to_string()).collect())
    }

    fn includes(&self, root: &str) -> bool {
        match self {
            RootScope::All => true,
            RootScope::Only(roots) => roots.contains(root),
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

struct PartitionResult {
    profile: UnifiedCompanyProfile,
    snapshots: Vec<CompanySnapshot>,
    events: Vec<MigrationEvent>,
    diagnostics: DiagnosticSink,
}

pub struct Pipeline {
    pub parallel: bool,
    dedup: DeduplicationEngine,
    resolver: EntityResolver,
    detector: MigrationDetector,
}

impl Pipeline {
    pub fn new(parallel: bool) -> Self {
        Pipeline {
            parallel,
            dedup: DeduplicationEngine::new(),
            resolver: EntityResolver::new(),
            detector: MigrationDetector::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.parallel)
    }

    pub fn run(
        &self,
        raw: &SourceTables,
        scope: &RootScope,
        cancel: &CancellationToken,
    ) -> QueryOutcome<PipelineOutput> {
        self.run_observed(raw, scope, cancel, |root, done, total| {
            trace!(cnpj_root = root, done, total, "Partition finished")
        })
    }

    /// `on_finished(root, finished_so_far, total)` fires after each partition
    /// completes, on the worker that ran it.
    pub fn run_observed<F>(
        &self,
        raw: &SourceTables,
        scope: &RootScope,
        cancel: &CancellationToken,
        on_finished: F,
    ) -> QueryOutcome<PipelineOutput>
    where
        F: Fn(&str, usize, usize) + Sync,
    {
        let mut diagnostics = DiagnosticSink::new();
        let mut normalization = DiagnosticSink::new();

        let partitions: Vec<RootPartition> = normalize_sources(raw, &mut normalization)
            .into_partitions()
            .into_values()
            .filter(|p| scope.includes(&p.cnpj_root))
            .collect();

        // Rejected rows have no root, so they only belong to unscoped results
        if *scope == RootScope::All {
            diagnostics.merge(normalization);
        }

        let total = partitions.len();
        let finished = AtomicUsize::new(0);
        let guarded = |partition: &RootPartition| {
            if cancel.is_cancelled() {
                return None;
            }
            let result = self.run_partition(partition);
            let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
            on_finished(&partition.cnpj_root, done, total);
            Some(result)
        };

        let results: Vec<Option<PartitionResult>> = if self.parallel {
            partitions.par_iter().map(guarded).collect()
        } else {
            partitions.iter().map(guarded).collect()
        };

        let mut output = PipelineOutput {
            partitions_total: total,
            ..Default::default()
        };

        for result in results.into_iter().flatten() {
            output.partitions_done += 1;
            output.profiles.push(result.profile);
            output.snapshots.extend(result.snapshots);
            output.events.extend(result.events);
            diagnostics.merge(result.diagnostics);
        }

        let cancelled = output.partitions_done < output.partitions_total;
        if cancelled {
            warn!(
                done = output.partitions_done,
                total = output.partitions_total,
                "Pipeline cancelled, returning finished partitions"
            );
        } else {
            info!(
                partitions = output.partitions_total,
                snapshots = output.snapshots.len(),
                events = output.events.len(),
                diagnostics = diagnostics.len(),
                "Pipeline complete"
            );
        }

        QueryOutcome {
            data: output,
            diagnostics,
            cancelled,
        }
    }

    fn run_partition(&self, partition: &RootPartition) -> PartitionResult {
        let mut sink = DiagnosticSink::new();

        let joined = fan_out_join(partition);
        let dedup = self.dedup.collapse(&joined, &mut sink);
        let profile = self.resolver.resolve(partition, &dedup, &mut sink);
        let events = self
            .detector
            .detect(&partition.cnpj_root, &dedup.snapshots, &mut sink);

        debug!(
            cnpj_root = %partition.cnpj_root,
            joined = joined.len(),
            snapshots = dedup.snapshots.len(),
            events = events.len(),
            "Partition processed"
        );

        PartitionResult {
            profile,
            snapshots: dedup.snapshots,
            events,
            diagnostics: sink,
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RawCompanyRow, RawLoadParcelRow};
    use crate::diagnostics::DiagnosticKind;

    fn parcel(cnpj: &str, period: &str, profile: &str, mwh: &str) -> RawLoadParcelRow {
        RawLoadParcelRow {
            cnpj_full: cnpj.to_string(),
            period: period.to_string(),
            agent_profile: Some(profile.to_string()),
            consumption_total: Some(mwh.to_string()),
            ..Default::default()
        }
    }

    fn create_test_tables() -> SourceTables {
        SourceTables {
            companies: vec![RawCompanyRow {
                cnpj_root: "80044".to_string(),
                legal_name: Some("ACME".to_string()),
                ..Default::default()
            }],
            load_parcels: vec![
                parcel("80044000199", "2025-01", "Especial", "10"),
                parcel("80044000199", "2025-02", "Especial", "10"),
                parcel("80044000199", "2025-03", "Livre", "12"),
                parcel("11222333000181", "2025-01", "CL", "5"),
                parcel("XX", "2025-01", "CL", "5"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_pipeline_end_to_end() {
        let outcome = Pipeline::new(false).run(
            &create_test_tables(),
            &RootScope::All,
            &CancellationToken::new(),
        );

        assert!(!outcome.cancelled);
        let output = &outcome.data;
        assert_eq!(output.partitions_total, 2);
        assert_eq!(output.profiles.len(), 2);
        assert_eq!(output.profiles[0].cnpj_root, "00080044");
        assert_eq!(output.snapshots.len(), 4);
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.events[0].period_observed.to_string(), "2025-03");

        assert_eq!(outcome.diagnostics.count(DiagnosticKind::InvalidIdentifier), 1);
        assert_eq!(outcome.diagnostics.count(DiagnosticKind::UnregisteredInSource), 1);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let tables = create_test_tables();
        let token = CancellationToken::new();
        let sequential = Pipeline::new(false).run(&tables, &RootScope::All, &token);
        let parallel = Pipeline::new(true).run(&tables, &RootScope::All, &token);

        assert_eq!(sequential.data.snapshots, parallel.data.snapshots);
        assert_eq!(sequential.data.events, parallel.data.events);
        assert_eq!(sequential.data.profiles, parallel.data.profiles);
    }

    #[test]
    fn test_scoped_run_skips_other_roots() {
        let outcome = Pipeline::new(false).run(
            &create_test_tables(),
            &RootScope::single("11222333"),
            &CancellationToken::new(),
        );

        assert_eq!(outcome.data.profiles.len(), 1);
        assert!(outcome.data.profiles[0].unregistered_in_source);
        assert_eq!(outcome.diagnostics.count(DiagnosticKind::InvalidIdentifier), 0);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();

        let outcome = Pipeline::new(true).run(&create_test_tables(), &RootScope::All, &token);

        assert!(outcome.cancelled);
        assert_eq!(outcome.data.partitions_done, 0);
        assert!(outcome.data.profiles.is_empty());
    }

    #[test]
    fn test_cancel_mid_run_keeps_finished_partitions() {
        let mut tables = create_test_tables();
        tables.load_parcels.push(parcel("99887766000100", "2025-01", "Cativo", "3"));
        tables.load_parcels.push(parcel("99887766000100", "2025-02", "Livre", "3"));

        let pipeline = Pipeline::new(false);
        let full = pipeline.run(&tables, &RootScope::All, &CancellationToken::new());
        assert_eq!(full.data.partitions_total, 3);
        assert!(!full.cancelled);

        let token = CancellationToken::new();
        let partial = pipeline.run_observed(&tables, &RootScope::All, &token, |_, done, _| {
            if done == 2 {
                token.cancel();
            }
        });

        assert!(partial.cancelled);
        assert_eq!(partial.data.partitions_total, 3);
        assert_eq!(partial.data.partitions_done, 2);
        assert_eq!(partial.data.profiles[..], full.data.profiles[..2]);

        let kept: BTreeSet<&str> = partial
            .data
            .profiles
            .iter()
            .map(|p| p.cnpj_root.as_str())
            .collect();
        let expected_events: Vec<MigrationEvent> = full
            .data
            .events
            .iter()
            .filter(|e| kept.contains(e.cnpj_root.as_str()))
            .cloned()
            .collect();
        let expected_snapshots: Vec<CompanySnapshot> = full
            .data
            .snapshots
            .iter()
            .filter(|s| kept.contains(s.cnpj_root.as_str()))
            .cloned()
            .collect();
        assert_eq!(partial.data.events, expected_events);
        assert_eq!(partial.data.snapshots, expected_snapshots);
        assert!(partial.data.events.len() < full.data.events.len());
    }

    #[test]
    fn test_source_tokens_cancel_only_running_queries() {
        let source = CancellationSource::new();
        let running = source.token();
        source.cancel_all();

        assert!(running.is_cancelled());
        assert!(!source.token().is_cancelled());
    }
}
