//! Discharge outcome counters.
//!
//! Exported through whatever recorder `main` installed; without one these
//! are no-ops.

use metrics::counter;

pub const OUTCOME_INTERACTION_REQUIRED: &str = "interaction_required";
pub const OUTCOME_DISCHARGED: &str = "discharged";
pub const OUTCOME_DENIED: &str = "denied";
pub const OUTCOME_ERRORED: &str = "errored";
pub const OUTCOME_METHOD_NOT_SUPPORTED: &str = "method_not_supported";

pub fn record_discharge_outcome(outcome: &'static str) {
    counter!("discharge_outcomes_total", "outcome" => outcome).increment(1);
}

pub fn record_login_attempt(provider: &str, outcome: &'static str) {
    counter!(
        "login_attempts_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
