pub mod caveat;
pub mod identity;
pub mod interaction;
pub mod macaroon;
pub mod session;

pub use caveat::{Condition, ConditionError, ParsedCondition};
pub use identity::{Identity, IdentityUpdate, ProviderIdentity};
pub use interaction::{InteractionKind, InteractionKinds};
pub use macaroon::Macaroon;
pub use session::{DischargeFailure, Protocol, WaitId, WaitState};
