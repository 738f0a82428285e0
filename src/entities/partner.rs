// Partner - ownership / representation link of a company (quadro de socios)
//
// Records are historical facts. A partner who left keeps its row with an
// exit date; nothing here is ever deleted.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartnerRecord {
    pub cnpj_root: String,

    /// CPF (masked in the public extract) or CNPJ of the partner
    pub partner_id: String,

    pub partner_name: Option<String>,

    /// Qualification code (e.g. 49 = managing partner)
    pub partner_role: Option<String>,

    pub entry_date: Option<NaiveDate>,

    /// None means still active
    pub exit_date: Option<NaiveDate>,
}

impl PartnerRecord {
    pub fn is_active(&self) -> bool {
        self.exit_date.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partner(entry: Option<NaiveDate>, exit: Option<NaiveDate>) -> PartnerRecord {
        PartnerRecord {
            cnpj_root: "00080044".to_string(),
            partner_id: "***123456**".to_string(),
            partner_name: Some("MARIA SILVA".to_string()),
            partner_role: Some("49".to_string()),
            entry_date: entry,
            exit_date: exit,
        }
    }

    #[test]
    fn test_active_partner() {
        let p = partner(NaiveDate::from_ymd_opt(2010, 5, 1), None);
        assert!(p.is_active());
    }

    #[test]
    fn test_former_partner_kept() {
        let p = partner(
            NaiveDate::from_ymd_opt(2010, 5, 1),
            NaiveDate::from_ymd_opt(2015, 5, 1),
        );
        assert!(!p.is_active());
        assert_eq!(p.exit_date, NaiveDate::from_ymd_opt(2015, 5, 1));
    }
}
