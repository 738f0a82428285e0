// 🧩 Entity Resolver - one UnifiedCompanyProfile per cnpj_root
//
// Outer join of the registry side and the market side of a partition.
// Registry wins for legal and contact attributes, the market wins for profile
// and consumption. Neither side missing is an error: registry-only companies
// are kept as non-participants, market-only companies are kept and flagged.

use crate::db::{MARKET_AGENT_PROFILES, MARKET_LOAD_PARCELS};
use crate::deduplication::DedupResult;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::entities::{AgentProfile, CompanySnapshot, Establishment, PartnerRecord};
use crate::migration::{lead_snapshot, observe, PeriodObservation};
use crate::normalizer::format_cnpj;
use crate::sources::RootPartition;
use crate::temporal::Period;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// PROFILE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub phone_1: Option<String>,
    pub phone_2: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
}

/// Null consumption counts as zero in `total` and is left out of `average`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionSummary {
    pub total: f64,
    pub periods_observed: usize,
    pub reported_periods: usize,
    pub average: Option<f64>,
    pub latest: Option<f64>,
    pub latest_period: Option<Period>,
}

impl ConsumptionSummary {
    pub fn from_observations(observations: &[PeriodObservation]) -> Self {
        let reported: Vec<f64> = observations.iter().filter_map(|o| o.consumption).collect();
        let total: f64 = reported.iter().sum();
        let latest = observations.last();

        ConsumptionSummary {
            total,
            periods_observed: observations.len(),
            reported_periods: reported.len(),
            average: if reported.is_empty() {
                None
            } else {
                Some(total / reported.len() as f64)
            },
            latest: latest.and_then(|o| o.consumption),
            latest_period: latest.map(|o| o.period),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileObservation {
    pub period: Period,
    pub profile: Option<AgentProfile>,
    pub consumption: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedCompanyProfile {
    pub cnpj_root: String,

    /// Masked head-office CNPJ, when an establishment is known
    pub cnpj_display: Option<String>,

    // Registry side
    pub legal_name: Option<String>,
    pub trade_name: Option<String>,
    pub size_tier: Option<String>,
    pub primary_activity: Option<String>,
    pub secondary_activities: Vec<String>,
    pub contact: ContactInfo,

    /// Current and former partners; former ones carry an exit date
    pub partners: Vec<PartnerRecord>,
    pub active_partners: usize,
    pub establishments: Vec<Establishment>,

    // Reported by both sides; registry first
    pub state_uf: Option<String>,
    pub city: Option<String>,

    // Market side
    pub market_name: Option<String>,
    pub agent_code: Option<String>,
    pub current_profile: Option<AgentProfile>,
    pub profile_history: Vec<ProfileObservation>,
    pub trc: Option<f64>,
    pub tggc: Option<f64>,
    pub consumption: ConsumptionSummary,
    pub market_activity_code: Option<String>,
    pub submarket: Option<String>,

    /// Present in the market feed at all
    pub market_participant: bool,

    /// In the market feed, absent from the registry
    pub unregistered_in_source: bool,
}

impl UnifiedCompanyProfile {
    pub fn display_name(&self) -> &str {
        self.trade_name
            .as_deref()
            .or(self.legal_name.as_deref())
            .or(self.market_name.as_deref())
            .unwrap_or(&self.cnpj_root)
    }

    pub fn has_activity(&self, code: &str) -> bool {
        let code = code.trim();
        self.primary_activity.as_deref() == Some(code)
            || self.secondary_activities.iter().any(|c| c == code)
            || self.market_activity_code.as_deref() == Some(code)
    }

    pub fn observed_in(&self, from: Option<Period>, to: Option<Period>) -> bool {
        self.profile_history.iter().any(|o| {
            from.map_or(true, |f| o.period >= f) && to.map_or(true, |t| o.period <= t)
        })
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct EntityResolver;

impl EntityResolver {
    pub fn new() -> Self {
        EntityResolver
    }

    /// Resolve one partition. `dedup` is the Deduplicator's output for the
    /// same partition.
    pub fn resolve(
        &self,
        partition: &RootPartition,
        dedup: &DedupResult,
        sink: &mut DiagnosticSink,
    ) -> UnifiedCompanyProfile {
        let root = partition.cnpj_root.as_str();
        let owned: Vec<CompanySnapshot> = dedup
            .snapshots
            .iter()
            .filter(|s| s.cnpj_root == root)
            .cloned()
            .collect();
        let observations = observe(&owned);

        // Registry side: newest company row, head office establishment
        let company = partition.companies.iter().max_by_key(|c| c.imported_at);

        let establishments: Vec<Establishment> = partition
            .establishments
            .iter()
            .chain(dedup.establishments.get(root).into_iter().flatten())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let partners: Vec<PartnerRecord> = partition
            .partners
            .iter()
            .chain(dedup.partners.get(root).into_iter().flatten())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let head = establishments
            .iter()
            .find(|e| e.is_head_office())
            .or_else(|| establishments.first());

        // Market side
        let agent = partition.agent_profiles.iter().max_by_key(|a| a.imported_at);
        let latest_period = owned.iter().map(|s| s.period).max();
        let latest_snapshot = lead_snapshot(owned.iter().filter(|s| Some(s.period) == latest_period));

        let current_profile = observations
            .iter()
            .rev()
            .find_map(|o| o.profile.clone())
            .or_else(|| agent.and_then(|a| a.profile.clone()));

        let market_participant = partition.has_market();
        let unregistered_in_source = market_participant && !partition.has_registry();

        if unregistered_in_source {
            let table = if partition.parcels.is_empty() {
                MARKET_AGENT_PROFILES
            } else {
                MARKET_LOAD_PARCELS
            };
            sink.push(Diagnostic::new(
                DiagnosticKind::UnregisteredInSource,
                table,
                root,
                "market participant has no registry record".to_string(),
            ));
        }

        UnifiedCompanyProfile {
            cnpj_root: root.to_string(),
            cnpj_display: head.map(|e| format_cnpj(&e.cnpj_full)),
            legal_name: company.and_then(|c| c.legal_name.clone()),
            trade_name: head.and_then(|e| e.trade_name.clone()),
            size_tier: company.and_then(|c| c.size_tier.clone()),
            primary_activity: head.and_then(|e| e.primary_activity.clone()),
            secondary_activities: head
                .map(|e| e.secondary_activities.clone())
                .unwrap_or_default(),
            contact: head
                .map(|e| ContactInfo {
                    phone_1: e.phone_1.clone(),
                    phone_2: e.phone_2.clone(),
                    fax: e.fax.clone(),
                    email: e.email.clone(),
                })
                .unwrap_or_default(),
            state_uf: head
                .and_then(|e| e.state_uf.clone())
                .or_else(|| latest_snapshot.and_then(|s| s.state_uf.clone())),
            city: head
                .and_then(|e| e.city.clone())
                .or_else(|| latest_snapshot.and_then(|s| s.city.clone())),
            active_partners: partners.iter().filter(|p| p.is_active()).count(),
            partners,
            establishments,
            market_name: agent.and_then(|a| a.legal_name.clone()),
            agent_code: agent.and_then(|a| a.agent_code.clone()),
            current_profile,
            profile_history: observations
                .iter()
                .map(|o| ProfileObservation {
                    period: o.period,
                    profile: o.profile.clone(),
                    consumption: o.consumption,
                })
                .collect(),
            trc: agent.and_then(|a| a.trc),
            tggc: agent.and_then(|a| a.tggc),
            consumption: ConsumptionSummary::from_observations(&observations),
            market_activity_code: latest_snapshot.and_then(|s| s.activity_code.clone()),
            submarket: latest_snapshot.and_then(|s| s.submarket.clone()),
            market_participant,
            unregistered_in_source,
        }
    }
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self::new()
    }
}
