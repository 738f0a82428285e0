// Company entities - registry side and per-period market snapshots
//
// Identity is the CNPJ root (legal entity). An establishment is one 14-digit
// CNPJ under that root. A snapshot is what the market feed said about one
// establishment in one reporting month.

use crate::entities::AgentProfile;
use crate::temporal::Period;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// REGISTRY COMPANY (legal entity)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryCompany {
    pub cnpj_root: String,
    pub legal_name: Option<String>,

    /// Company size tier (porte): micro, small, medium, large...
    pub size_tier: Option<String>,

    pub imported_at: DateTime<Utc>,
}

// ============================================================================
// ESTABLISHMENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Establishment {
    pub cnpj_full: String,
    pub trade_name: Option<String>,
    pub primary_activity: Option<String>,
    pub secondary_activities: Vec<String>,
    pub state_uf: Option<String>,
    pub city: Option<String>,

    /// "(area) number", already normalized
    pub phone_1: Option<String>,
    pub phone_2: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
}

impl Establishment {
    pub fn cnpj_root(&self) -> &str {
        &self.cnpj_full[..crate::normalizer::ROOT_LEN.min(self.cnpj_full.len())]
    }

    /// Head office establishments carry branch number 0001
    pub fn is_head_office(&self) -> bool {
        self.cnpj_full.get(8..12) == Some("0001")
    }
}

// ============================================================================
// COMPANY SNAPSHOT
// ============================================================================

/// One establishment's market state in one reporting period.
///
/// `(cnpj_full, period)` is unique after deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanySnapshot {
    pub cnpj_root: String,
    pub cnpj_full: String,
    pub period: Period,
    pub agent_profile: Option<AgentProfile>,

    /// None means "not reported", which is not the same as zero
    pub consumption_total: Option<f64>,

    pub state_uf: Option<String>,
    pub company_size_tier: Option<String>,
    pub activity_code: Option<String>,
    pub submarket: Option<String>,
    pub city: Option<String>,

    /// Explicit migration date (data_migracao) when the source supplies one
    pub migration_marker: Option<NaiveDate>,

    pub imported_at: DateTime<Utc>,
}

impl CompanySnapshot {
    /// Consumption for summation: absent counts as zero
    pub fn consumption_or_zero(&self) -> f64 {
        self.consumption_total.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_establishment_root_and_head_office() {
        let est = Establishment {
            cnpj_full: "00080044000199".to_string(),
            trade_name: None,
            primary_activity: None,
            secondary_activities: vec![],
            state_uf: None,
            city: None,
            phone_1: None,
            phone_2: None,
            fax: None,
            email: None,
        };
        assert_eq!(est.cnpj_root(), "00080044");
        assert!(est.is_head_office());

        let branch = Establishment {
            cnpj_full: "00080044000270".to_string(),
            ..est
        };
        assert!(!branch.is_head_office());
    }

    #[test]
    fn test_snapshot_consumption_or_zero() {
        let snapshot = CompanySnapshot {
            cnpj_root: "00080044".to_string(),
            cnpj_full: "00080044000199".to_string(),
            period: "2025-03".parse().unwrap(),
            agent_profile: Some(AgentProfile::FreeConsumer),
            consumption_total: None,
            state_uf: None,
            company_size_tier: None,
            activity_code: None,
            submarket: None,
            city: None,
            migration_marker: NaiveDate::from_ymd_opt(2025, 3, 1),
            imported_at: Utc::now(),
        };
        assert_eq!(snapshot.consumption_or_zero(), 0.0);

        let reported = CompanySnapshot {
            consumption_total: Some(42.5),
            ..snapshot
        };
        assert_eq!(reported.consumption_or_zero(), 42.5);
    }
}
