// Agent Profile - typed market participation classification
//
// The clearinghouse labels participants with free text ("Consumidor Livre"),
// English labels from analysts ("Free") or profile abbreviations ("CL", "VAR1").
// Everything is folded into one enum so the migration state machine compares
// values, not strings.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AgentProfile {
    /// Regulated (captive) consumer served by the local distributor
    Captive,

    /// Free consumer (consumidor livre)
    FreeConsumer,

    /// Special consumer (consumidor especial, incentivized sources)
    SpecialConsumer,

    /// Retail trader representing smaller consumers (varejista)
    Retailer,

    /// Generator / producer
    Generator,

    /// Anything the source sends that we do not recognize, kept verbatim
    Other(String),
}

impl AgentProfile {
    /// Parse a raw profile value. Blank input yields None.
    pub fn parse(raw: &str) -> Option<AgentProfile> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let upper = trimmed.to_uppercase();

        let by_keyword = if upper.contains("VAREJ") || upper.contains("RETAIL") {
            Some(AgentProfile::Retailer)
        } else if upper.contains("ESPECIAL") || upper.contains("SPECIAL") {
            Some(AgentProfile::SpecialConsumer)
        } else if upper.contains("LIVRE") || upper.contains("FREE") {
            Some(AgentProfile::FreeConsumer)
        } else if upper.contains("CATIV")
            || upper.contains("CAPTIVE")
            || upper.contains("REGULAD")
            || upper.contains("REGULATED")
        {
            Some(AgentProfile::Captive)
        } else if upper.contains("GERA") || upper.contains("GENERAT") || upper.contains("PRODUTOR") {
            Some(AgentProfile::Generator)
        } else {
            None
        };

        if let Some(profile) = by_keyword {
            return Some(profile);
        }

        Some(Self::from_code(&upper).unwrap_or_else(|| AgentProfile::Other(trimmed.to_string())))
    }

    /// Profile abbreviations: CL, CE, and V*/L*/E*/G* prefixed short codes
    fn from_code(upper: &str) -> Option<AgentProfile> {
        let is_code = upper.len() <= 4 && upper.chars().all(|c| c.is_ascii_alphanumeric());
        if !is_code {
            return None;
        }

        match upper {
            "CL" => return Some(AgentProfile::FreeConsumer),
            "CE" => return Some(AgentProfile::SpecialConsumer),
            "CC" => return Some(AgentProfile::Captive),
            _ => {}
        }

        match upper.chars().next() {
            Some('V') => Some(AgentProfile::Retailer),
            Some('L') => Some(AgentProfile::FreeConsumer),
            Some('E') => Some(AgentProfile::SpecialConsumer),
            Some('G') => Some(AgentProfile::Generator),
            _ => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            AgentProfile::Captive => "Captive",
            AgentProfile::FreeConsumer => "Free",
            AgentProfile::SpecialConsumer => "Special",
            AgentProfile::Retailer => "Retailer",
            AgentProfile::Generator => "Generator",
            AgentProfile::Other(raw) => raw,
        }
    }

    /// Buys energy in the free contracting environment
    pub fn is_free_market(&self) -> bool {
        matches!(
            self,
            AgentProfile::FreeConsumer | AgentProfile::SpecialConsumer | AgentProfile::Retailer
        )
    }
}

impl fmt::Display for AgentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<AgentProfile> for String {
    fn from(profile: AgentProfile) -> String {
        profile.label().to_string()
    }
}

impl From<String> for AgentProfile {
    fn from(raw: String) -> AgentProfile {
        AgentProfile::parse(&raw).unwrap_or(AgentProfile::Other(raw))
    }
}
