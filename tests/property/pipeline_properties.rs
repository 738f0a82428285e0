use chrono::{TimeZone, Utc};
use migration_tracker::aggregation::percentage_shares;
use migration_tracker::{
    normalize_cnpj, AgentProfile, CompanySnapshot, DeduplicationEngine, DiagnosticSink,
    JoinedRow, MigrationDetector, PartnerRecord, Period,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

const ROOT: &str = "00080044";

fn profile_strategy() -> impl Strategy<Value = AgentProfile> {
    prop_oneof![
        Just(AgentProfile::Captive),
        Just(AgentProfile::FreeConsumer),
        Just(AgentProfile::SpecialConsumer),
        Just(AgentProfile::Retailer),
    ]
}

fn period_at(offset: u32) -> Period {
    let mut period = Period::new(2020, 1).unwrap();
    for _ in 0..offset {
        period = period.next();
    }
    period
}

fn snapshot(period: Period, profile: AgentProfile) -> CompanySnapshot {
    CompanySnapshot {
        cnpj_root: ROOT.to_string(),
        cnpj_full: format!("{}000199", ROOT),
        period,
        agent_profile: Some(profile),
        consumption_total: Some(10.0),
        state_uf: Some("SP".to_string()),
        company_size_tier: None,
        activity_code: None,
        submarket: None,
        city: None,
        migration_marker: None,
        imported_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn joined(branch: u8, period: Period, partner: Option<u8>, second: u32) -> JoinedRow {
    JoinedRow {
        cnpj_root: ROOT.to_string(),
        cnpj_full: format!("{}{:04}99", ROOT, branch),
        period,
        agent_profile: Some(AgentProfile::FreeConsumer),
        consumption_total: Some(5.0),
        state_uf: Some("MG".to_string()),
        company_size_tier: None,
        activity_code: None,
        submarket: None,
        city: None,
        migration_marker: None,
        imported_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, second % 60).unwrap(),
        registry_imported_at: None,
        establishment: None,
        partner: partner.map(|id| PartnerRecord {
            cnpj_root: ROOT.to_string(),
            partner_id: format!("***{:03}***", id),
            partner_name: None,
            partner_role: None,
            entry_date: None,
            exit_date: None,
        }),
    }
}

// ── Migration detection ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn single_observation_never_emits_event(profile in profile_strategy(), offset in 0u32..60) {
        let mut sink = DiagnosticSink::new();
        let events = MigrationDetector::new().detect(ROOT, &[snapshot(period_at(offset), profile)], &mut sink);
        prop_assert!(events.is_empty());
    }

    #[test]
    fn constant_profile_emits_nothing(profile in profile_strategy(), months in 1u32..36) {
        let history: Vec<CompanySnapshot> = (0..months)
            .map(|m| snapshot(period_at(m), profile.clone()))
            .collect();
        let mut sink = DiagnosticSink::new();
        let events = MigrationDetector::new().detect(ROOT, &history, &mut sink);
        prop_assert!(events.is_empty());
    }

    #[test]
    fn events_match_profile_changes(profiles in prop::collection::vec(profile_strategy(), 1..24)) {
        let history: Vec<CompanySnapshot> = profiles
            .iter()
            .enumerate()
            .map(|(m, p)| snapshot(period_at(m as u32), p.clone()))
            .collect();
        let expected = profiles.windows(2).filter(|w| w[0] != w[1]).count();

        let mut sink = DiagnosticSink::new();
        let events = MigrationDetector::new().detect(ROOT, &history, &mut sink);

        prop_assert_eq!(events.len(), expected);
        for event in &events {
            prop_assert_ne!(&event.from_profile, &event.to_profile);
        }
        prop_assert!(events.windows(2).all(|w| w[0].period_observed < w[1].period_observed));
    }
}

// ── Deduplication ─────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn collapse_yields_one_snapshot_per_establishment_period(
        rows in prop::collection::vec((0u8..4, 0u32..6, prop::option::of(0u8..8), 0u32..120), 1..40)
    ) {
        let joined_rows: Vec<JoinedRow> = rows
            .iter()
            .map(|&(branch, offset, partner, second)| joined(branch, period_at(offset), partner, second))
            .collect();

        let distinct_keys: BTreeSet<(String, Period)> = joined_rows
            .iter()
            .map(|r| (r.cnpj_full.clone(), r.period))
            .collect();
        let distinct_partners: BTreeSet<PartnerRecord> = joined_rows
            .iter()
            .filter_map(|r| r.partner.clone())
            .collect();

        let mut sink = DiagnosticSink::new();
        let result = DeduplicationEngine::new().collapse(&joined_rows, &mut sink);

        prop_assert_eq!(result.snapshots.len(), distinct_keys.len());
        prop_assert_eq!(result.input_rows, joined_rows.len());

        let kept: BTreeSet<PartnerRecord> = result
            .partners
            .get(ROOT)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        prop_assert_eq!(kept, distinct_partners);

        // Identical scalar values across the fan-out never conflict
        prop_assert_eq!(result.conflicts, 0);
    }
}

// ── Aggregation ───────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn percentage_shares_sum_to_hundred(counts in prop::collection::vec(1usize..10_000, 1..30)) {
        let shares = percentage_shares(&counts);
        let sum: f64 = shares.iter().sum();
        prop_assert_eq!(shares.len(), counts.len());
        prop_assert!((sum - 100.0).abs() <= 0.1, "shares summed to {}", sum);
    }
}

// ── Identifier normalization ──────────────────────────────────────────────

proptest! {
    #[test]
    fn canonical_full_cnpj_is_fixed_point(digits in "[0-9]{14}") {
        let normalized = normalize_cnpj(&digits).unwrap();
        prop_assert_eq!(normalized.full.as_deref(), Some(digits.as_str()));
        prop_assert_eq!(&normalized.root, &digits[..8]);

        let again = normalize_cnpj(normalized.full.as_deref().unwrap()).unwrap();
        prop_assert_eq!(again, normalized);
    }

    #[test]
    fn masked_notation_matches_bare_digits(digits in "[0-9]{14}") {
        let masked = format!(
            "{}.{}.{}/{}-{}",
            &digits[..2], &digits[2..5], &digits[5..8], &digits[8..12], &digits[12..]
        );
        prop_assert_eq!(normalize_cnpj(&masked).unwrap(), normalize_cnpj(&digits).unwrap());
    }
}
