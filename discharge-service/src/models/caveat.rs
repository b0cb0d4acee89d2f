//! Third-party caveat conditions understood by the discharger.
//!
//! Conditions are fixed strings, not a policy language. A leading `<`
//! marks a request from an older client and selects the legacy flow.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::session::Protocol;

pub const LEGACY_MARKER: char = '<';

const IS_AUTHENTICATED_USER: &str = "is-authenticated-user";
const IS_MEMBER_OF: &str = "is-member-of";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("caveat not recognized: {0:?}")]
    NotRecognized(String),

    #[error("is-member-of requires at least one group")]
    NoGroups,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Condition {
    IsAuthenticatedUser { domain: Option<String> },
    IsMemberOf { groups: Vec<String> },
}

impl Condition {
    /// Domain a provider must be configured with to serve this condition.
    pub fn domain(&self) -> Option<&str> {
        match self {
            Condition::IsAuthenticatedUser { domain } => domain.as_deref(),
            Condition::IsMemberOf { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Condition::IsAuthenticatedUser { .. } => IS_AUTHENTICATED_USER,
            Condition::IsMemberOf { .. } => IS_MEMBER_OF,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::IsAuthenticatedUser { domain: None } => f.write_str(IS_AUTHENTICATED_USER),
            Condition::IsAuthenticatedUser {
                domain: Some(domain),
            } => write!(f, "{} @{}", IS_AUTHENTICATED_USER, domain),
            Condition::IsMemberOf { groups } => write!(f, "{} {}", IS_MEMBER_OF, groups.join(" ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCondition {
    pub legacy: bool,
    pub condition: Condition,
}

impl ParsedCondition {
    pub fn protocol(&self) -> Protocol {
        if self.legacy {
            Protocol::Legacy
        } else {
            Protocol::Modern
        }
    }
}

impl fmt::Display for ParsedCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.legacy {
            write!(f, "{}", LEGACY_MARKER)?;
        }
        self.condition.fmt(f)
    }
}

impl FromStr for ParsedCondition {
    type Err = ConditionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        // The marker is the only thing that separates the two flows.
        let (legacy, rest) = match raw.strip_prefix(LEGACY_MARKER) {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if rest.starts_with(char::is_whitespace) {
            return Err(ConditionError::NotRecognized(raw.to_string()));
        }

        let mut words = rest.split_whitespace();
        let condition = match words.next() {
            Some(IS_AUTHENTICATED_USER) => {
                let domain = match (words.next(), words.next()) {
                    (None, _) => None,
                    (Some(arg), None) => match arg.strip_prefix('@') {
                        Some(domain) if !domain.is_empty() => Some(domain.to_string()),
                        _ => return Err(ConditionError::NotRecognized(raw.to_string())),
                    },
                    _ => return Err(ConditionError::NotRecognized(raw.to_string())),
                };
                Condition::IsAuthenticatedUser { domain }
            }
            Some(IS_MEMBER_OF) => {
                let groups: Vec<String> = words.map(str::to_string).collect();
                if groups.is_empty() {
                    return Err(ConditionError::NoGroups);
                }
                Condition::IsMemberOf { groups }
            }
            _ => return Err(ConditionError::NotRecognized(raw.to_string())),
        };

        Ok(Self { legacy, condition })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_condition_selects_modern_flow() {
        let parsed: ParsedCondition = "is-authenticated-user".parse().unwrap();
        assert!(!parsed.legacy);
        assert_eq!(parsed.protocol(), Protocol::Modern);
        assert_eq!(parsed.condition, Condition::IsAuthenticatedUser { domain: None });
    }

    #[test]
    fn marker_selects_legacy_flow() {
        let parsed: ParsedCondition = "<is-authenticated-user".parse().unwrap();
        assert!(parsed.legacy);
        assert_eq!(parsed.protocol(), Protocol::Legacy);
        assert_eq!(parsed.to_string(), "<is-authenticated-user");
    }

    #[test]
    fn domain_qualifier() {
        let parsed: ParsedCondition = "is-authenticated-user @test2".parse().unwrap();
        assert_eq!(parsed.condition.domain(), Some("test2"));

        assert!("is-authenticated-user test2".parse::<ParsedCondition>().is_err());
        assert!("is-authenticated-user @".parse::<ParsedCondition>().is_err());
    }

    #[test]
    fn membership_condition() {
        let parsed: ParsedCondition = "<is-member-of test1 admins".parse().unwrap();
        assert!(parsed.legacy);
        assert_eq!(
            parsed.condition,
            Condition::IsMemberOf {
                groups: vec!["test1".to_string(), "admins".to_string()]
            }
        );
        assert_eq!(
            "is-member-of".parse::<ParsedCondition>(),
            Err(ConditionError::NoGroups)
        );
    }

    #[test]
    fn unknown_conditions_are_rejected() {
        for raw in ["", "<", "is-ok", " is-authenticated-user", "<<is-authenticated-user"] {
            assert!(
                matches!(
                    raw.parse::<ParsedCondition>(),
                    Err(ConditionError::NotRecognized(_))
                ),
                "{raw:?} should not parse"
            );
        }
    }
}
