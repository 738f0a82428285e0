// 📊 Aggregator - period totals, dimension breakdowns, top consumers
//
// Works on deduplicated snapshots and detected events only. Null consumption
// adds zero to sums and is left out of average denominators.

use crate::config::EngineConfig;
use crate::entities::{AgentProfile, CompanySnapshot};
use crate::migration::{lead_snapshot, MigrationDirection, MigrationEvent};
use crate::temporal::{Period, PeriodRange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Group label for snapshots without a value in the breakdown dimension
pub const NOT_INFORMED: &str = "Não informado";

// ============================================================================
// CONSUMPTION TIER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub large_mwh: f64,
    pub medium_mwh: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        TierThresholds {
            large_mwh: 10_000.0,
            medium_mwh: 5_000.0,
        }
    }
}

impl From<&EngineConfig> for TierThresholds {
    fn from(config: &EngineConfig) -> Self {
        TierThresholds {
            large_mwh: config.large_consumer_mwh,
            medium_mwh: config.medium_consumer_mwh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConsumptionTier {
    Large,
    Medium,
    Small,
    NoInformation,
}

impl ConsumptionTier {
    /// Strictly above a threshold moves up a tier
    pub fn classify(consumption: Option<f64>, thresholds: &TierThresholds) -> Self {
        match consumption {
            None => ConsumptionTier::NoInformation,
            Some(mwh) if mwh > thresholds.large_mwh => ConsumptionTier::Large,
            Some(mwh) if mwh > thresholds.medium_mwh => ConsumptionTier::Medium,
            Some(_) => ConsumptionTier::Small,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConsumptionTier::Large => "Large",
            ConsumptionTier::Medium => "Medium",
            ConsumptionTier::Small => "Small",
            ConsumptionTier::NoInformation => "No information",
        }
    }
}

// ============================================================================
// FILTER & DIMENSION
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFilter {
    pub state_uf: Option<String>,
    pub city: Option<String>,
    pub activity_code: Option<String>,
    pub size_tier: Option<String>,
    pub submarket: Option<String>,
    pub agent_profile: Option<AgentProfile>,
    pub periods: PeriodRange,
}

/// Unset filter matches anything; a set one needs an equal value (trimmed,
/// ASCII case-insensitive). A missing value never matches a set filter.
pub(crate) fn text_matches(want: &Option<String>, have: Option<&str>) -> bool {
    match want {
        Some(want) => have.map_or(false, |have| have.trim().eq_ignore_ascii_case(want.trim())),
        None => true,
    }
}

impl SnapshotFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, snapshot: &CompanySnapshot) -> bool {
        self.periods.contains(&snapshot.period)
            && text_matches(&self.state_uf, snapshot.state_uf.as_deref())
            && text_matches(&self.city, snapshot.city.as_deref())
            && text_matches(&self.activity_code, snapshot.activity_code.as_deref())
            && text_matches(&self.size_tier, snapshot.company_size_tier.as_deref())
            && text_matches(&self.submarket, snapshot.submarket.as_deref())
            && self
                .agent_profile
                .as_ref()
                .map_or(true, |p| snapshot.agent_profile.as_ref() == Some(p))
    }

    pub fn apply<'a>(&self, snapshots: &'a [CompanySnapshot]) -> Vec<&'a CompanySnapshot> {
        snapshots.iter().filter(|s| self.matches(s)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    State,
    ActivityCode,
    SizeTier,
    AgentProfile,
    Submarket,
    ConsumptionTier,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::State => "state",
            Dimension::ActivityCode => "activity_code",
            Dimension::SizeTier => "size_tier",
            Dimension::AgentProfile => "agent_profile",
            Dimension::Submarket => "submarket",
            Dimension::ConsumptionTier => "consumption_tier",
        }
    }

    fn key_of(&self, snapshot: &CompanySnapshot, thresholds: &TierThresholds) -> Option<String> {
        match self {
            Dimension::State => snapshot.state_uf.clone(),
            Dimension::ActivityCode => snapshot.activity_code.clone(),
            Dimension::SizeTier => snapshot.company_size_tier.clone(),
            Dimension::AgentProfile => snapshot.agent_profile.as_ref().map(|p| p.to_string()),
            Dimension::Submarket => snapshot.submarket.clone(),
            Dimension::ConsumptionTier => Some(
                ConsumptionTier::classify(snapshot.consumption_total, thresholds)
                    .label()
                    .to_string(),
            ),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "state" | "uf" | "state_uf" => Ok(Dimension::State),
            "activity" | "activity_code" | "cnae" => Ok(Dimension::ActivityCode),
            "size" | "size_tier" | "porte" => Ok(Dimension::SizeTier),
            "profile" | "agent_profile" => Ok(Dimension::AgentProfile),
            "submarket" | "submercado" => Ok(Dimension::Submarket),
            "tier" | "consumption_tier" => Ok(Dimension::ConsumptionTier),
            other => Err(format!("unknown dimension `{}`", other)),
        }
    }
}

// ============================================================================
// BREAKDOWN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownGroup {
    pub key: String,
    pub companies: usize,
    pub percentage: f64,
    pub consumption_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub dimension: Dimension,
    pub total_companies: usize,
    pub groups: Vec<BreakdownGroup>,
}

impl Breakdown {
    pub fn percentage_sum(&self) -> f64 {
        self.groups.iter().map(|g| g.percentage).sum()
    }

    /// Empty breakdowns are trivially consistent
    pub fn is_consistent(&self, tolerance: f64) -> bool {
        self.groups.is_empty() || (self.percentage_sum() - 100.0).abs() <= tolerance
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Breakdown by {} ({} companies)",
            self.dimension, self.total_companies
        )];
        for group in &self.groups {
            lines.push(format!(
                "  {:<24} {:>6} {:>7.2}%",
                group.key, group.companies, group.percentage
            ));
        }
        lines.join("\n")
    }
}

/// Percentages with two decimals that sum to exactly 100 (largest remainder)
pub fn percentage_shares(counts: &[usize]) -> Vec<f64> {
    let total: u64 = counts.iter().map(|&c| c as u64).sum();
    if total == 0 {
        return vec![0.0; counts.len()];
    }

    // Work in hundredths of a percent
    const SCALE: u64 = 10_000;
    let mut units: Vec<u64> = counts.iter().map(|&c| c as u64 * SCALE / total).collect();
    let mut remainders: Vec<(u64, usize)> = counts
        .iter()
        .enumerate()
        .map(|(i, &c)| (c as u64 * SCALE % total, i))
        .collect();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let missing = SCALE - units.iter().sum::<u64>();
    for &(_, idx) in remainders.iter().take(missing as usize) {
        units[idx] += 1;
    }

    units.into_iter().map(|u| u as f64 / 100.0).collect()
}

/// Company counts per group. Each company lands in exactly one group, taken
/// from its latest snapshot in the filtered set.
pub fn breakdown(
    snapshots: &[CompanySnapshot],
    dimension: Dimension,
    filter: &SnapshotFilter,
    thresholds: &TierThresholds,
) -> Breakdown {
    let mut by_root: BTreeMap<&str, Vec<&CompanySnapshot>> = BTreeMap::new();
    for snapshot in filter.apply(snapshots) {
        by_root.entry(snapshot.cnpj_root.as_str()).or_default().push(snapshot);
    }

    let mut groups: BTreeMap<String, (usize, f64)> = BTreeMap::new();
    for rows in by_root.values() {
        let latest = rows.iter().map(|s| s.period).max();
        let representative = lead_snapshot(
            rows.iter()
                .copied()
                .filter(|s| Some(s.period) == latest),
        );
        let Some(representative) = representative else {
            continue;
        };

        let key = dimension
            .key_of(representative, thresholds)
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| NOT_INFORMED.to_string());

        let entry = groups.entry(key).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += rows.iter().map(|s| s.consumption_or_zero()).sum::<f64>();
    }

    let mut ordered: Vec<(String, usize, f64)> =
        groups.into_iter().map(|(k, (n, c))| (k, n, c)).collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let counts: Vec<usize> = ordered.iter().map(|g| g.1).collect();
    let shares = percentage_shares(&counts);

    Breakdown {
        dimension,
        total_companies: by_root.len(),
        groups: ordered
            .into_iter()
            .zip(shares)
            .map(|((key, companies, consumption_total), percentage)| BreakdownGroup {
                key,
                companies,
                percentage,
                consumption_total,
            })
            .collect(),
    }
}

// ============================================================================
// PERIOD TOTALS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodTotal {
    pub period: Period,
    pub companies_reporting: usize,
    pub consumption_total: f64,
    pub migrating_companies: usize,
    pub migration_events: usize,
    pub migrated_consumption: f64,
}

/// One row per period seen in snapshots or events, ascending.
///
/// Events are kept when their company has at least one snapshot passing the
/// filter, or (with no snapshot at all) when their period is in range.
pub fn period_totals(
    snapshots: &[CompanySnapshot],
    events: &[MigrationEvent],
    filter: &SnapshotFilter,
) -> Vec<PeriodTotal> {
    let filtered = filter.apply(snapshots);
    let matching_roots: BTreeSet<&str> = filtered.iter().map(|s| s.cnpj_root.as_str()).collect();
    let known_roots: BTreeSet<&str> = snapshots.iter().map(|s| s.cnpj_root.as_str()).collect();

    #[derive(Default)]
    struct Acc<'a> {
        reporting: BTreeSet<&'a str>,
        consumption: f64,
        migrating: BTreeSet<&'a str>,
        events: usize,
        migrated: f64,
    }

    let mut periods: BTreeMap<Period, Acc> = BTreeMap::new();

    for snapshot in &filtered {
        let acc = periods.entry(snapshot.period).or_default();
        acc.reporting.insert(snapshot.cnpj_root.as_str());
        acc.consumption += snapshot.consumption_or_zero();
    }

    for event in events {
        let root = event.cnpj_root.as_str();
        let included = if known_roots.contains(root) {
            matching_roots.contains(root) && filter.periods.contains(&event.period_observed)
        } else {
            filter.periods.contains(&event.period_observed)
        };
        if !included {
            continue;
        }
        let acc = periods.entry(event.period_observed).or_default();
        acc.migrating.insert(root);
        acc.events += 1;
        acc.migrated += event.consumption_at_migration.unwrap_or(0.0);
    }

    periods
        .into_iter()
        .map(|(period, acc)| PeriodTotal {
            period,
            companies_reporting: acc.reporting.len(),
            consumption_total: acc.consumption,
            migrating_companies: acc.migrating.len(),
            migration_events: acc.events,
            migrated_consumption: acc.migrated,
        })
        .collect()
}

// ============================================================================
// TOP CONSUMERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRank {
    pub rank: usize,
    pub cnpj_root: String,
    pub total_consumption: f64,
    pub reported_periods: usize,
    pub average_consumption: Option<f64>,
    pub tier: ConsumptionTier,
    pub latest_profile: Option<AgentProfile>,
}

/// Top `n` companies by accumulated consumption; ties by cnpj_root ascending
pub fn top_consumers(
    snapshots: &[CompanySnapshot],
    filter: &SnapshotFilter,
    n: usize,
    thresholds: &TierThresholds,
) -> Vec<ConsumerRank> {
    let mut by_root: BTreeMap<&str, Vec<&CompanySnapshot>> = BTreeMap::new();
    for snapshot in filter.apply(snapshots) {
        by_root.entry(snapshot.cnpj_root.as_str()).or_default().push(snapshot);
    }

    let mut ranked: Vec<ConsumerRank> = by_root
        .into_iter()
        .map(|(root, rows)| {
            let total: f64 = rows.iter().map(|s| s.consumption_or_zero()).sum();
            let reported: BTreeSet<Period> = rows
                .iter()
                .filter(|s| s.consumption_total.is_some())
                .map(|s| s.period)
                .collect();
            let average = if reported.is_empty() {
                None
            } else {
                Some(total / reported.len() as f64)
            };
            let latest = rows.iter().map(|s| s.period).max();
            let latest_profile = lead_snapshot(
                rows.iter()
                    .copied()
                    .filter(|s| Some(s.period) == latest && s.agent_profile.is_some()),
            )
            .and_then(|s| s.agent_profile.clone());

            ConsumerRank {
                rank: 0,
                cnpj_root: root.to_string(),
                total_consumption: total,
                reported_periods: reported.len(),
                average_consumption: average,
                tier: ConsumptionTier::classify(
                    if reported.is_empty() { None } else { Some(total) },
                    thresholds,
                ),
                latest_profile,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.total_consumption
            .partial_cmp(&a.total_consumption)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cnpj_root.cmp(&b.cnpj_root))
    });
    ranked.truncate(n);
    for (idx, rank) in ranked.iter_mut().enumerate() {
        rank.rank = idx + 1;
    }
    ranked
}

// ============================================================================
// MIGRATION WINDOW
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationWindowSummary {
    pub window: PeriodRange,
    pub years: u32,
    pub events: usize,
    pub companies: usize,
    pub into_free_market: usize,
    pub out_of_free_market: usize,
    pub within_free_market: usize,
    pub migrated_consumption: f64,
    pub by_year: BTreeMap<i32, usize>,
}

impl MigrationWindowSummary {
    pub fn summary(&self) -> String {
        format!(
            "Migrations in last {} year(s): {} events, {} companies ({} into free market, {} out)",
            self.years, self.events, self.companies, self.into_free_market, self.out_of_free_market
        )
    }
}

/// Migrations in the `years` years up to and including `reference`
pub fn migration_window(
    events: &[MigrationEvent],
    reference: Period,
    years: u32,
) -> MigrationWindowSummary {
    let window = PeriodRange::trailing_years(reference, years);
    let inside: Vec<&MigrationEvent> = events
        .iter()
        .filter(|e| window.contains(&e.period_observed))
        .collect();

    let count = |direction: MigrationDirection| {
        inside.iter().filter(|e| e.direction == direction).count()
    };

    let mut by_year: BTreeMap<i32, usize> = BTreeMap::new();
    for event in &inside {
        *by_year.entry(event.period_observed.year()).or_default() += 1;
    }

    MigrationWindowSummary {
        window,
        years: years.max(1),
        events: inside.len(),
        companies: inside
            .iter()
            .map(|e| e.cnpj_root.as_str())
            .collect::<BTreeSet<_>>()
            .len(),
        into_free_market: count(MigrationDirection::IntoFreeMarket),
        out_of_free_market: count(MigrationDirection::OutOfFreeMarket),
        within_free_market: count(MigrationDirection::WithinFreeMarket),
        migrated_consumption: inside
            .iter()
            .map(|e| e.consumption_at_migration.unwrap_or(0.0))
            .sum(),
        by_year,
    }
}

// ============================================================================
// TESTS
// ============================================================================
