// 🔍 Deduplication Engine - collapse fan-out join rows
// One snapshot per (cnpj_root, cnpj_full, period); partners and establishments
// kept as distinct sets per root; scalar conflicts resolved by import recency.

use crate::db::{MARKET_LOAD_PARCELS, REGISTRY_COMPANIES};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::entities::{AgentProfile, CompanySnapshot, Establishment, PartnerRecord};
use crate::sources::unknown_import_time;
use crate::temporal::Period;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use tracing::debug;

// ============================================================================
// JOINED ROW (input)
// ============================================================================

/// One row of the parcel x company x establishment x partner join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedRow {
    pub cnpj_root: String,
    pub cnpj_full: String,
    pub period: Period,

    pub agent_profile: Option<AgentProfile>,
    pub consumption_total: Option<f64>,
    pub state_uf: Option<String>,
    pub company_size_tier: Option<String>,
    pub activity_code: Option<String>,
    pub submarket: Option<String>,
    pub city: Option<String>,
    pub migration_marker: Option<NaiveDate>,

    /// Import time of the market parcel
    pub imported_at: DateTime<Utc>,

    /// Import time of the registry company row that supplied the size tier
    pub registry_imported_at: Option<DateTime<Utc>>,

    pub establishment: Option<Establishment>,
    pub partner: Option<PartnerRecord>,
}

type GroupKey = (String, String, Period);

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupResult {
    /// Sorted by (cnpj_root, cnpj_full, period)
    pub snapshots: Vec<CompanySnapshot>,

    /// Distinct partner records per root
    pub partners: BTreeMap<String, Vec<PartnerRecord>>,

    /// Distinct establishments per root
    pub establishments: BTreeMap<String, Vec<Establishment>>,

    pub input_rows: usize,
    pub conflicts: usize,
}

impl DedupResult {
    pub fn summary(&self) -> String {
        format!(
            "Dedup: {} joined rows -> {} snapshots | {} roots | {} conflicting fields",
            self.input_rows,
            self.snapshots.len(),
            self.partners.len().max(self.establishments.len()),
            self.conflicts
        )
    }

    /// Fold another partition's result in. Partitions never share a root.
    pub fn merge(&mut self, other: DedupResult) {
        self.snapshots.extend(other.snapshots);
        self.partners.extend(other.partners);
        self.establishments.extend(other.establishments);
        self.input_rows += other.input_rows;
        self.conflicts += other.conflicts;
    }
}

// ============================================================================
// DEDUPLICATION ENGINE
// ============================================================================

pub struct DeduplicationEngine {
    /// Two consumption values closer than this are the same value (default: 1e-6 MWh)
    pub consumption_tolerance: f64,
}

impl DeduplicationEngine {
    pub fn new() -> Self {
        DeduplicationEngine {
            consumption_tolerance: 1e-6,
        }
    }

    /// Collapse joined rows. Conflicts are reported to `sink`, never fatal.
    pub fn collapse(&self, rows: &[JoinedRow], sink: &mut DiagnosticSink) -> DedupResult {
        let mut groups: BTreeMap<GroupKey, Vec<&JoinedRow>> = BTreeMap::new();
        let mut partners: BTreeMap<String, BTreeSet<PartnerRecord>> = BTreeMap::new();
        let mut establishments: BTreeMap<String, BTreeSet<Establishment>> = BTreeMap::new();

        for row in rows {
            groups
                .entry((row.cnpj_root.clone(), row.cnpj_full.clone(), row.period))
                .or_default()
                .push(row);

            let root_partners = partners.entry(row.cnpj_root.clone()).or_default();
            if let Some(partner) = &row.partner {
                root_partners.insert(partner.clone());
            }
            let root_establishments = establishments.entry(row.cnpj_root.clone()).or_default();
            if let Some(establishment) = &row.establishment {
                root_establishments.insert(establishment.clone());
            }
        }

        let conflicts_before = sink.count(DiagnosticKind::ConflictingField);

        let snapshots: Vec<CompanySnapshot> = groups
            .iter()
            .map(|(key, group)| self.collapse_group(key, group, sink))
            .collect();

        let result = DedupResult {
            snapshots,
            partners: partners
                .into_iter()
                .map(|(root, set)| (root, set.into_iter().collect()))
                .collect(),
            establishments: establishments
                .into_iter()
                .map(|(root, set)| (root, set.into_iter().collect()))
                .collect(),
            input_rows: rows.len(),
            conflicts: sink.count(DiagnosticKind::ConflictingField) - conflicts_before,
        };

        debug!(
            input_rows = result.input_rows,
            snapshots = result.snapshots.len(),
            conflicts = result.conflicts,
            "Fan-out collapsed"
        );

        result
    }

    fn collapse_group(
        &self,
        key: &GroupKey,
        group: &[&JoinedRow],
        sink: &mut DiagnosticSink,
    ) -> CompanySnapshot {
        let (root, full, period) = key;
        let record_key = format!("{}/{}", full, period);
        let market = |row: &JoinedRow| row.imported_at;
        let registry = |row: &JoinedRow| row.registry_imported_at.unwrap_or_else(unknown_import_time);

        let mut ctx = FieldResolver {
            group,
            key: &record_key,
            sink,
        };

        let parcels = MARKET_LOAD_PARCELS;
        let agent_profile = ctx.resolve(
            ("agent_profile", parcels),
            |r| r.agent_profile.clone(),
            market,
            |a, b| a == b,
        );
        let tolerance = self.consumption_tolerance;
        let consumption_total = ctx.resolve(
            ("consumption_total", parcels),
            |r| r.consumption_total,
            market,
            |a, b| (a - b).abs() <= tolerance,
        );
        let state_uf =
            ctx.resolve(("state_uf", parcels), |r| r.state_uf.clone(), market, |a, b| a == b);
        let company_size_tier = ctx.resolve(
            ("company_size_tier", REGISTRY_COMPANIES),
            |r| r.company_size_tier.clone(),
            registry,
            |a, b| a == b,
        );
        let activity_code = ctx.resolve(
            ("activity_code", parcels),
            |r| r.activity_code.clone(),
            market,
            |a, b| a == b,
        );
        let submarket =
            ctx.resolve(("submarket", parcels), |r| r.submarket.clone(), market, |a, b| a == b);
        let migration_marker = ctx.resolve(
            ("migration_marker", parcels),
            |r| r.migration_marker,
            market,
            |a, b| a == b,
        );

        // City is descriptive only; newest value without a conflict report
        let city = newest(group, |r| r.city.clone(), market);

        let imported_at = group
            .iter()
            .map(|r| r.imported_at)
            .max()
            .unwrap_or_else(unknown_import_time);

        CompanySnapshot {
            cnpj_root: root.clone(),
            cnpj_full: full.clone(),
            period: *period,
            agent_profile,
            consumption_total,
            state_uf,
            company_size_tier,
            activity_code,
            submarket,
            city,
            migration_marker,
            imported_at,
        }
    }
}

impl Default for DeduplicationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// FIELD RESOLUTION
// ============================================================================

struct FieldResolver<'a> {
    group: &'a [&'a JoinedRow],
    key: &'a str,
    sink: &'a mut DiagnosticSink,
}

impl<'a> FieldResolver<'a> {
    /// Most recently imported non-null value. More than one distinct non-null
    /// value in the group is a ConflictingField, reported against the table
    /// the field is read from.
    fn resolve<T, V, R, S>(
        &mut self,
        (field, table): (&str, &str),
        value: V,
        recency: R,
        same: S,
    ) -> Option<T>
    where
        T: Clone + Display,
        V: Fn(&JoinedRow) -> Option<T>,
        R: Fn(&JoinedRow) -> DateTime<Utc>,
        S: Fn(&T, &T) -> bool,
    {
        let kept = newest(self.group, &value, &recency)?;

        let mut discarded: Vec<T> = Vec::new();
        for candidate in self.group.iter().filter_map(|r| value(*r)) {
            if !same(&candidate, &kept) && !discarded.iter().any(|d| same(d, &candidate)) {
                discarded.push(candidate);
            }
        }

        if !discarded.is_empty() {
            let dropped: Vec<String> = discarded.iter().map(|d| d.to_string()).collect();
            self.sink.push(
                Diagnostic::new(
                    DiagnosticKind::ConflictingField,
                    table,
                    self.key,
                    format!("{}: kept {}, discarded {}", field, kept, dropped.join(", ")),
                )
                .with_field(field),
            );
        }

        Some(kept)
    }
}

/// Newest non-null value; equal timestamps go to the row loaded last
fn newest<T, V, R>(group: &[&JoinedRow], value: V, recency: R) -> Option<T>
where
    V: Fn(&JoinedRow) -> Option<T>,
    R: Fn(&JoinedRow) -> DateTime<Utc>,
{
    group
        .iter()
        .enumerate()
        .filter_map(|(idx, row)| value(*row).map(|v| ((recency(*row), idx), v)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, v)| v)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap()
    }

    fn create_test_row(full: &str, period: &str) -> JoinedRow {
        JoinedRow {
            cnpj_root: full[..8].to_string(),
            cnpj_full: full.to_string(),
            period: period.parse().unwrap(),
            agent_profile: Some(AgentProfile::SpecialConsumer),
            consumption_total: Some(100.0),
            state_uf: Some("SP".to_string()),
            company_size_tier: None,
            activity_code: None,
            submarket: Some("SUDESTE".to_string()),
            city: None,
            migration_marker: None,
            imported_at: at(1),
            registry_imported_at: None,
            establishment: None,
            partner: None,
        }
    }

    fn partner(id: &str) -> PartnerRecord {
        PartnerRecord {
            cnpj_root: "00080044".to_string(),
            partner_id: id.to_string(),
            partner_name: None,
            partner_role: Some("49".to_string()),
            entry_date: None,
            exit_date: None,
        }
    }

    fn establishment(full: &str) -> Establishment {
        Establishment {
            cnpj_full: full.to_string(),
            trade_name: None,
            primary_activity: None,
            secondary_activities: vec![],
            state_uf: None,
            city: None,
            phone_1: None,
            phone_2: None,
            fax: None,
            email: None,
        }
    }

    #[test]
    fn test_size_tier_conflict_keeps_newest() {
        let mut older = create_test_row("00080044000199", "2025-01");
        older.company_size_tier = Some("Small".to_string());
        older.registry_imported_at = Some(at(1));

        let mut newer = create_test_row("00080044000199", "2025-01");
        newer.company_size_tier = Some("Medium".to_string());
        newer.registry_imported_at = Some(at(5));

        // Input order must not matter
        let mut sink = DiagnosticSink::new();
        let result = DeduplicationEngine::new().collapse(&[newer, older], &mut sink);

        assert_eq!(result.snapshots.len(), 1);
        assert_eq!(result.snapshots[0].company_size_tier.as_deref(), Some("Medium"));
        assert_eq!(result.conflicts, 1);

        let conflicts: Vec<_> = sink.of_kind(DiagnosticKind::ConflictingField).collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field.as_deref(), Some("company_size_tier"));
        assert_eq!(conflicts[0].source_table, REGISTRY_COMPANIES);
        assert_eq!(conflicts[0].key, "00080044000199/2025-01");
        assert!(conflicts[0].message.contains("kept Medium"));
        assert!(conflicts[0].message.contains("Small"));
    }

    #[test]
    fn test_fan_out_collapses_and_keeps_sets() {
        let mut rows = Vec::new();
        for p in ["***111111**", "***222222**"] {
            for e in ["00080044000199", "00080044000270"] {
                let mut row = create_test_row("00080044000199", "2025-01");
                row.partner = Some(partner(p));
                row.establishment = Some(establishment(e));
                rows.push(row);
            }
        }

        let mut sink = DiagnosticSink::new();
        let result = DeduplicationEngine::new().collapse(&rows, &mut sink);

        assert_eq!(result.input_rows, 4);
        assert_eq!(result.snapshots.len(), 1);
        assert_eq!(result.partners["00080044"].len(), 2);
        assert_eq!(result.establishments["00080044"].len(), 2);

        // Repeated identical values are not conflicts
        assert!(sink.is_empty());
    }

    #[test]
    fn test_null_is_not_a_conflicting_value() {
        let mut reported = create_test_row("00080044000199", "2025-01");
        reported.consumption_total = Some(250.0);
        reported.imported_at = at(1);

        let mut missing = create_test_row("00080044000199", "2025-01");
        missing.consumption_total = None;
        missing.imported_at = at(9);

        let mut sink = DiagnosticSink::new();
        let result = DeduplicationEngine::new().collapse(&[reported, missing], &mut sink);

        assert_eq!(result.snapshots[0].consumption_total, Some(250.0));
        assert_eq!(result.snapshots[0].imported_at, at(9));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_market_conflict_uses_parcel_import_time() {
        let mut old = create_test_row("00080044000199", "2025-02");
        old.agent_profile = Some(AgentProfile::Captive);
        old.imported_at = at(2);

        let mut new = create_test_row("00080044000199", "2025-02");
        new.agent_profile = Some(AgentProfile::FreeConsumer);
        new.imported_at = at(3);

        let mut sink = DiagnosticSink::new();
        let result = DeduplicationEngine::new().collapse(&[new, old], &mut sink);

        assert_eq!(result.snapshots[0].agent_profile, Some(AgentProfile::FreeConsumer));
        assert_eq!(sink.count(DiagnosticKind::ConflictingField), 1);
        assert_eq!(sink.entries()[0].source_table, MARKET_LOAD_PARCELS);
    }

    #[test]
    fn test_output_sorted_by_key() {
        let rows = vec![
            create_test_row("00080044000270", "2025-01"),
            create_test_row("00080044000199", "2025-02"),
            create_test_row("00080044000199", "2025-01"),
            create_test_row("00000001000100", "2025-03"),
        ];

        let mut sink = DiagnosticSink::new();
        let result = DeduplicationEngine::new().collapse(&rows, &mut sink);

        let keys: Vec<(String, String)> = result
            .snapshots
            .iter()
            .map(|s| (s.cnpj_full.clone(), s.period.to_string()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("00000001000100".to_string(), "2025-03".to_string()),
                ("00080044000199".to_string(), "2025-01".to_string()),
                ("00080044000199".to_string(), "2025-02".to_string()),
                ("00080044000270".to_string(), "2025-01".to_string()),
            ]
        );
    }

    #[test]
    fn test_equal_timestamps_prefer_later_row() {
        let mut first = create_test_row("00080044000199", "2025-01");
        first.state_uf = Some("RJ".to_string());
        let second = create_test_row("00080044000199", "2025-01");

        let mut sink = DiagnosticSink::new();
        let result = DeduplicationEngine::new().collapse(&[first, second], &mut sink);

        assert_eq!(result.snapshots[0].state_uf.as_deref(), Some("SP"));
        assert_eq!(sink.count(DiagnosticKind::ConflictingField), 1);
    }
}
