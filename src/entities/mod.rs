// Entity Models
// Registry side (company, establishment, partner) and market side (parcel,
// agent profile). Identity is always the canonical CNPJ root.

pub mod agent_profile;
pub mod company;
pub mod market;
pub mod partner;

pub use agent_profile::AgentProfile;
pub use company::{CompanySnapshot, Establishment, RegistryCompany};
pub use market::{MarketAgentProfile, MarketLoadParcel};
pub use partner::PartnerRecord;
