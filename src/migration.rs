// 🔀 Migration Detector - profile transitions over monthly observations
//
// Per cnpj_root: snapshots are folded into one observation per period, then a
// two-state machine (Unknown / Observed(profile)) walks them in order. A change
// between consecutive observations is a MigrationEvent. Gaps in the series do
// not reset the state.

use crate::db::MARKET_LOAD_PARCELS;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::entities::{AgentProfile, CompanySnapshot};
use crate::temporal::Period;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

// ============================================================================
// OBSERVATIONS
// ============================================================================

/// What one company looked like in one period, across all its establishments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodObservation {
    pub period: Period,

    /// Profile of the lead establishment; None when no establishment reported one
    pub profile: Option<AgentProfile>,

    /// Sum over establishments; None when none reported consumption
    pub consumption: Option<f64>,

    pub lead_cnpj_full: String,
    pub establishments: usize,

    /// Declared migration date carried by any establishment in this period
    pub marker: Option<NaiveDate>,
}

impl PeriodObservation {
    pub fn marker_in_period(&self) -> bool {
        self.marker
            .map(|date| Period::from_date(date) == self.period)
            .unwrap_or(false)
    }
}

/// Greatest consumption wins (absent counts as zero); ties go to the lowest cnpj_full
fn lead_order(a: &CompanySnapshot, b: &CompanySnapshot) -> Ordering {
    a.consumption_or_zero()
        .partial_cmp(&b.consumption_or_zero())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.cnpj_full.cmp(&a.cnpj_full))
}

/// Establishment that speaks for the company in a period
pub fn lead_snapshot<'a, I>(snapshots: I) -> Option<&'a CompanySnapshot>
where
    I: IntoIterator<Item = &'a CompanySnapshot>,
{
    snapshots.into_iter().max_by(|a, b| lead_order(a, b))
}

/// Fold snapshots (any order, any number of establishments) into ascending
/// per-period observations.
pub fn observe(snapshots: &[CompanySnapshot]) -> Vec<PeriodObservation> {
    let mut by_period: BTreeMap<Period, Vec<&CompanySnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        by_period.entry(snapshot.period).or_default().push(snapshot);
    }

    by_period
        .into_iter()
        .filter_map(|(period, mut group)| {
            group.sort_by(|a, b| a.cnpj_full.cmp(&b.cnpj_full));

            let lead_any = lead_snapshot(group.iter().copied())?;
            let lead = lead_snapshot(group.iter().copied().filter(|s| s.agent_profile.is_some()))
                .unwrap_or(lead_any);

            let reported: Vec<f64> = group.iter().filter_map(|s| s.consumption_total).collect();
            let consumption = if reported.is_empty() {
                None
            } else {
                Some(reported.iter().sum::<f64>())
            };

            let marker = group
                .iter()
                .filter_map(|s| s.migration_marker)
                .find(|date| Period::from_date(*date) == period)
                .or_else(|| group.iter().filter_map(|s| s.migration_marker).max());

            Some(PeriodObservation {
                period,
                profile: lead.agent_profile.clone(),
                consumption,
                lead_cnpj_full: lead.cnpj_full.clone(),
                establishments: group.len(),
                marker,
            })
        })
        .collect()
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileState {
    Unknown,
    Observed(AgentProfile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: AgentProfile,
    pub to: AgentProfile,
}

/// Advance the machine by one observed profile.
///
/// Unknown -> Observed(p) never transitions. Observed(a) -> Observed(b)
/// transitions exactly when a != b.
pub fn transition(
    state: &ProfileState,
    observed: &AgentProfile,
) -> (ProfileState, Option<Transition>) {
    let next = ProfileState::Observed(observed.clone());
    match state {
        ProfileState::Observed(previous) if previous != observed => (
            next,
            Some(Transition {
                from: previous.clone(),
                to: observed.clone(),
            }),
        ),
        _ => (next, None),
    }
}

// ============================================================================
// MIGRATION EVENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationDirection {
    IntoFreeMarket,
    OutOfFreeMarket,
    WithinFreeMarket,
    Other,
}

impl MigrationDirection {
    pub fn classify(from: &AgentProfile, to: &AgentProfile) -> Self {
        match (from.is_free_market(), to.is_free_market()) {
            (false, true) => MigrationDirection::IntoFreeMarket,
            (true, false) => MigrationDirection::OutOfFreeMarket,
            (true, true) => MigrationDirection::WithinFreeMarket,
            (false, false) => MigrationDirection::Other,
        }
    }
}

/// Derived, immutable. Recomputing from the same data yields the same event_id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEvent {
    pub event_id: String,
    pub cnpj_root: String,
    pub from_profile: AgentProfile,
    pub to_profile: AgentProfile,
    pub period_observed: Period,
    pub consumption_at_migration: Option<f64>,
    pub direction: MigrationDirection,
    pub marker_date: Option<NaiveDate>,
}

impl MigrationEvent {
    fn new(cnpj_root: &str, change: Transition, observation: &PeriodObservation) -> Self {
        MigrationEvent {
            event_id: event_fingerprint(
                cnpj_root,
                &change.from,
                &change.to,
                observation.period,
            ),
            cnpj_root: cnpj_root.to_string(),
            direction: MigrationDirection::classify(&change.from, &change.to),
            from_profile: change.from,
            to_profile: change.to,
            period_observed: observation.period,
            consumption_at_migration: observation.consumption,
            marker_date: observation.marker,
        }
    }
}

fn event_fingerprint(root: &str, from: &AgentProfile, to: &AgentProfile, period: Period) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}|{}", root, from, to, period).as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct MigrationDetector;

impl MigrationDetector {
    pub fn new() -> Self {
        MigrationDetector
    }

    /// Events for one company, ascending by period
    pub fn detect(
        &self,
        cnpj_root: &str,
        snapshots: &[CompanySnapshot],
        sink: &mut DiagnosticSink,
    ) -> Vec<MigrationEvent> {
        self.detect_observations(cnpj_root, &observe(snapshots), sink)
    }

    pub fn detect_observations(
        &self,
        cnpj_root: &str,
        observations: &[PeriodObservation],
        sink: &mut DiagnosticSink,
    ) -> Vec<MigrationEvent> {
        let mut state = ProfileState::Unknown;
        let mut events = Vec::new();

        for observation in observations {
            let change = match &observation.profile {
                Some(profile) => {
                    let (next, change) = transition(&state, profile);
                    state = next;
                    change
                }
                // Nothing observed this period; state carries over the gap
                None => None,
            };

            match change {
                Some(change) => events.push(MigrationEvent::new(cnpj_root, change, observation)),
                None if observation.marker_in_period() => {
                    sink.push(
                        Diagnostic::new(
                            DiagnosticKind::InconsistentMigrationMarker,
                            MARKET_LOAD_PARCELS,
                            &format!("{}/{}", cnpj_root, observation.period),
                            format!(
                                "migration date {} declared but profile unchanged ({})",
                                observation
                                    .marker
                                    .map(|d| d.to_string())
                                    .unwrap_or_default(),
                                observation
                                    .profile
                                    .as_ref()
                                    .map(|p| p.label().to_string())
                                    .unwrap_or_else(|| "not reported".to_string())
                            ),
                        )
                        .with_field("migration_marker"),
                    );
                }
                None => {}
            }
        }

        if !events.is_empty() {
            debug!(cnpj_root, events = events.len(), "Migrations detected");
        }

        events
    }
}

impl Default for MigrationDetector {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
