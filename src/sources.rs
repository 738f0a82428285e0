// 🧹 Source normalization - raw storage rows into typed, root-keyed records
//
// Every CNPJ goes through the normalizer here. Rows whose key cannot be
// normalized are dropped from the joins and reported as InvalidIdentifier;
// everything else is parsed leniently (bad numbers and dates become None).

use crate::db::{
    RawAgentProfileRow, RawCompanyRow, RawEstablishmentRow, RawLoadParcelRow, RawPartnerRow,
    SourceTables, MARKET_AGENT_PROFILES, MARKET_LOAD_PARCELS, REGISTRY_COMPANIES,
    REGISTRY_ESTABLISHMENTS, REGISTRY_PARTNERS,
};
use crate::deduplication::JoinedRow;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::entities::{
    AgentProfile, Establishment, MarketAgentProfile, MarketLoadParcel, PartnerRecord,
    RegistryCompany,
};
use crate::normalizer::{
    clean_text, normalize_cnpj, normalize_full_cnpj, normalize_phone, repair_encoding,
    IdentifierError, NormalizedCnpj,
};
use crate::temporal::Period;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

// ============================================================================
// LENIENT VALUE PARSING
// ============================================================================

/// Import time for rows that carry none. Sorts before every real timestamp.
pub fn unknown_import_time() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

/// Decimal in either "1234.56" or Brazilian "1.234,56" notation
pub fn parse_decimal(raw: Option<&str>) -> Option<f64> {
    let value = clean_text(raw)?;
    let normalized = if value.contains(',') {
        value.replace('.', "").replace(',', ".")
    } else {
        value
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Registry dates: YYYY-MM-DD, DD/MM/YYYY, YYYYMMDD. Zeroed dates mean unknown.
pub fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let value = clean_text(raw)?;
    if value.chars().all(|c| c == '0') {
        return None;
    }
    if value.len() == 8 && value.chars().all(|c| c.is_ascii_digit()) {
        let year = value[..4].parse().ok()?;
        let month = value[4..6].parse().ok()?;
        let day = value[6..].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    let head = value.get(..10).unwrap_or(&value);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%d/%m/%Y"))
        .ok()
}

pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let value = clean_text(raw)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&value, format) {
            return Some(naive.and_utc());
        }
    }
    parse_date(Some(&value))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn import_time(raw: Option<&str>) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(unknown_import_time)
}

fn registry_text(raw: Option<&str>) -> Option<String> {
    clean_text(raw).map(|text| repair_encoding(&text))
}

fn activity_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|list| {
        list.split([',', ';'])
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn report_invalid(sink: &mut DiagnosticSink, table: &str, raw: &str, error: IdentifierError) {
    sink.push(
        Diagnostic::new(
            DiagnosticKind::InvalidIdentifier,
            table,
            raw,
            format!("record excluded: {}", error),
        )
        .with_field("cnpj"),
    );
}

fn root_of(raw: &str, table: &str, sink: &mut DiagnosticSink) -> Option<NormalizedCnpj> {
    match normalize_cnpj(raw) {
        Ok(cnpj) => Some(cnpj),
        Err(e) => {
            report_invalid(sink, table, raw, e);
            None
        }
    }
}

fn full_of(raw: &str, table: &str, sink: &mut DiagnosticSink) -> Option<NormalizedCnpj> {
    match normalize_full_cnpj(raw) {
        Ok(cnpj) => Some(cnpj),
        Err(e) => {
            report_invalid(sink, table, raw, e);
            None
        }
    }
}

// ============================================================================
// NORMALIZED SOURCES
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NormalizedSources {
    pub companies: Vec<RegistryCompany>,
    pub establishments: Vec<Establishment>,
    pub partners: Vec<PartnerRecord>,
    pub parcels: Vec<MarketLoadParcel>,
    pub agent_profiles: Vec<MarketAgentProfile>,
}

/// Normalize all five tables. Never fails: bad rows go to the sink.
pub fn normalize_sources(raw: &SourceTables, sink: &mut DiagnosticSink) -> NormalizedSources {
    let sources = NormalizedSources {
        companies: raw
            .companies
            .iter()
            .filter_map(|row| normalize_company(row, sink))
            .collect(),
        establishments: raw
            .establishments
            .iter()
            .filter_map(|row| normalize_establishment(row, sink))
            .collect(),
        partners: raw
            .partners
            .iter()
            .filter_map(|row| normalize_partner(row, sink))
            .collect(),
        parcels: raw
            .load_parcels
            .iter()
            .filter_map(|row| normalize_parcel(row, sink))
            .collect(),
        agent_profiles: raw
            .agent_profiles
            .iter()
            .filter_map(|row| normalize_agent_profile(row, sink))
            .collect(),
    };

    debug!(
        companies = sources.companies.len(),
        establishments = sources.establishments.len(),
        partners = sources.partners.len(),
        parcels = sources.parcels.len(),
        agent_profiles = sources.agent_profiles.len(),
        "Sources normalized"
    );

    sources
}

pub fn normalize_company(row: &RawCompanyRow, sink: &mut DiagnosticSink) -> Option<RegistryCompany> {
    let cnpj = root_of(&row.cnpj_root, REGISTRY_COMPANIES, sink)?;
    Some(RegistryCompany {
        cnpj_root: cnpj.root,
        legal_name: registry_text(row.legal_name.as_deref()),
        size_tier: clean_text(row.size_tier.as_deref()),
        imported_at: import_time(row.imported_at.as_deref()),
    })
}

pub fn normalize_establishment(
    row: &RawEstablishmentRow,
    sink: &mut DiagnosticSink,
) -> Option<Establishment> {
    let cnpj = full_of(&row.cnpj_full, REGISTRY_ESTABLISHMENTS, sink)?;
    Some(Establishment {
        cnpj_full: cnpj.full.unwrap_or_default(),
        trade_name: registry_text(row.trade_name.as_deref()),
        primary_activity: clean_text(row.primary_activity.as_deref()),
        secondary_activities: activity_list(row.secondary_activities.as_deref()),
        state_uf: clean_text(row.state_uf.as_deref()).map(|uf| uf.to_uppercase()),
        city: registry_text(row.city.as_deref()),
        phone_1: normalize_phone(row.area_code_1.as_deref(), row.phone_1.as_deref()),
        phone_2: normalize_phone(row.area_code_2.as_deref(), row.phone_2.as_deref()),
        fax: normalize_phone(row.fax_area_code.as_deref(), row.fax.as_deref()),
        email: clean_text(row.email.as_deref()).map(|e| e.to_lowercase()),
    })
}

pub fn normalize_partner(row: &RawPartnerRow, sink: &mut DiagnosticSink) -> Option<PartnerRecord> {
    let cnpj = root_of(&row.cnpj_root, REGISTRY_PARTNERS, sink)?;
    Some(PartnerRecord {
        cnpj_root: cnpj.root,
        partner_id: row.partner_id.trim().to_string(),
        partner_name: registry_text(row.partner_name.as_deref()),
        partner_role: clean_text(row.partner_role.as_deref()),
        entry_date: parse_date(row.entry_date.as_deref()),
        exit_date: parse_date(row.exit_date.as_deref()),
    })
}

pub fn normalize_parcel(
    row: &RawLoadParcelRow,
    sink: &mut DiagnosticSink,
) -> Option<MarketLoadParcel> {
    let cnpj = full_of(&row.cnpj_full, MARKET_LOAD_PARCELS, sink)?;

    // The period is half of the record key; without it the row cannot be placed
    let period = match row.period.parse::<Period>() {
        Ok(period) => period,
        Err(e) => {
            sink.push(
                Diagnostic::new(
                    DiagnosticKind::InvalidIdentifier,
                    MARKET_LOAD_PARCELS,
                    &format!("{}/{}", row.cnpj_full, row.period),
                    format!("record excluded: {}", e),
                )
                .with_field("period"),
            );
            return None;
        }
    };

    Some(MarketLoadParcel {
        cnpj_root: cnpj.root,
        cnpj_full: cnpj.full.unwrap_or_default(),
        period,
        agent_profile: row.agent_profile.as_deref().and_then(AgentProfile::parse),
        consumption_total: parse_decimal(row.consumption_total.as_deref()),
        state_uf: clean_text(row.state_uf.as_deref()).map(|uf| uf.to_uppercase()),
        city: registry_text(row.city.as_deref()),
        submarket: clean_text(row.submarket.as_deref()).map(|s| s.to_uppercase()),
        activity_code: clean_text(row.activity_code.as_deref()),
        migration_marker: parse_date(row.migration_marker.as_deref()),
        imported_at: import_time(row.imported_at.as_deref()),
    })
}

pub fn normalize_agent_profile(
    row: &RawAgentProfileRow,
    sink: &mut DiagnosticSink,
) -> Option<MarketAgentProfile> {
    let cnpj = root_of(&row.cnpj_root, MARKET_AGENT_PROFILES, sink)?;
    Some(MarketAgentProfile {
        cnpj_root: cnpj.root,
        agent_code: clean_text(row.agent_code.as_deref()),
        legal_name: registry_text(row.legal_name.as_deref()),
        profile: row.profile.as_deref().and_then(AgentProfile::parse),
        trc: parse_decimal(row.trc.as_deref()),
        tggc: parse_decimal(row.tggc.as_deref()),
        imported_at: import_time(row.imported_at.as_deref()),
    })
}

// ============================================================================
// PARTITIONS
// ============================================================================

/// Everything both sources know about one legal entity
#[derive(Debug, Clone, Default)]
pub struct RootPartition {
    pub cnpj_root: String,
    pub companies: Vec<RegistryCompany>,
    pub establishments: Vec<Establishment>,
    pub partners: Vec<PartnerRecord>,
    pub parcels: Vec<MarketLoadParcel>,
    pub agent_profiles: Vec<MarketAgentProfile>,
}

impl RootPartition {
    fn new(cnpj_root: &str) -> Self {
        RootPartition {
            cnpj_root: cnpj_root.to_string(),
            ..Default::default()
        }
    }

    pub fn has_registry(&self) -> bool {
        !self.companies.is_empty() || !self.establishments.is_empty()
    }

    pub fn has_market(&self) -> bool {
        !self.parcels.is_empty() || !self.agent_profiles.is_empty()
    }
}

impl NormalizedSources {
    /// Split by cnpj_root. Partitions share nothing and can be processed independently.
    pub fn into_partitions(self) -> BTreeMap<String, RootPartition> {
        let mut partitions: BTreeMap<String, RootPartition> = BTreeMap::new();

        fn slot<'a>(
            partitions: &'a mut BTreeMap<String, RootPartition>,
            root: &str,
        ) -> &'a mut RootPartition {
            partitions
                .entry(root.to_string())
                .or_insert_with(|| RootPartition::new(root))
        }

        for company in self.companies {
            slot(&mut partitions, &company.cnpj_root.clone()).companies.push(company);
        }
        for establishment in self.establishments {
            let root = establishment.cnpj_root().to_string();
            slot(&mut partitions, &root).establishments.push(establishment);
        }
        for partner in self.partners {
            slot(&mut partitions, &partner.cnpj_root.clone()).partners.push(partner);
        }
        for parcel in self.parcels {
            slot(&mut partitions, &parcel.cnpj_root.clone()).parcels.push(parcel);
        }
        for profile in self.agent_profiles {
            slot(&mut partitions, &profile.cnpj_root.clone()).agent_profiles.push(profile);
        }

        partitions
    }
}

// ============================================================================
// FAN-OUT JOIN
// ============================================================================

/// parcels x registry company rows x partners on cnpj_root, and each parcel
/// to its own establishment on cnpj_full.
///
/// This is the shape the market and registry extracts produce when joined, and
/// it is the Deduplicator's input. Establishments without a parcel never enter
/// the join; they reach the profile through the partition itself.
pub fn fan_out_join(partition: &RootPartition) -> Vec<JoinedRow> {
    let companies: Vec<Option<&RegistryCompany>> = optional_all(&partition.companies);
    let partners: Vec<Option<&PartnerRecord>> = optional_all(&partition.partners);

    let by_full: BTreeMap<&str, &Establishment> = partition
        .establishments
        .iter()
        .map(|e| (e.cnpj_full.as_str(), e))
        .collect();

    let mut rows = Vec::with_capacity(partition.parcels.len() * companies.len() * partners.len());

    for parcel in &partition.parcels {
        let own = by_full.get(parcel.cnpj_full.as_str()).copied();

        let state_uf = parcel
            .state_uf
            .clone()
            .or_else(|| own.and_then(|e| e.state_uf.clone()));
        let activity_code = parcel
            .activity_code
            .clone()
            .or_else(|| own.and_then(|e| e.primary_activity.clone()));
        let city = parcel.city.clone().or_else(|| own.and_then(|e| e.city.clone()));

        for company in &companies {
            for partner in &partners {
                rows.push(JoinedRow {
                    cnpj_root: parcel.cnpj_root.clone(),
                    cnpj_full: parcel.cnpj_full.clone(),
                    period: parcel.period,
                    agent_profile: parcel.agent_profile.clone(),
                    consumption_total: parcel.consumption_total,
                    state_uf: state_uf.clone(),
                    company_size_tier: company.and_then(|c| c.size_tier.clone()),
                    activity_code: activity_code.clone(),
                    submarket: parcel.submarket.clone(),
                    city: city.clone(),
                    migration_marker: parcel.migration_marker,
                    imported_at: parcel.imported_at,
                    registry_imported_at: company.map(|c| c.imported_at),
                    establishment: own.cloned(),
                    partner: partner.cloned(),
                });
            }
        }
    }

    rows
}

/// Outer-join helper: an empty side still contributes one "nothing" row
fn optional_all<T>(items: &[T]) -> Vec<Option<&T>> {
    if items.is_empty() {
        vec![None]
    } else {
        items.iter().map(Some).collect()
    }
}
