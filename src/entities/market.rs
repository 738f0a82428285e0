// Market-feed entities (clearinghouse side)

use crate::entities::AgentProfile;
use crate::temporal::Period;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One load-consumption parcel: one establishment, one reference month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketLoadParcel {
    pub cnpj_root: String,
    pub cnpj_full: String,
    pub period: Period,
    pub agent_profile: Option<AgentProfile>,
    pub consumption_total: Option<f64>,
    pub state_uf: Option<String>,
    pub city: Option<String>,
    pub submarket: Option<String>,
    pub activity_code: Option<String>,
    pub migration_marker: Option<NaiveDate>,
    pub imported_at: DateTime<Utc>,
}

/// Agent registration with its profile classification and guarantee metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAgentProfile {
    pub cnpj_root: String,
    pub agent_code: Option<String>,
    pub legal_name: Option<String>,
    pub profile: Option<AgentProfile>,

    /// TRC / TGGC capacity and guarantee metrics
    pub trc: Option<f64>,
    pub tggc: Option<f64>,

    pub imported_at: DateTime<Utc>,
}
