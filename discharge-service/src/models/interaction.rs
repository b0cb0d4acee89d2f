//! Interaction kinds: the protocol shapes a login can take.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionKind {
    /// A person logs in through pages served by the discharger.
    BrowserRedirect,
    /// A program signs the visit URL and fetches it directly.
    SignedRequest,
    /// Username and password posted by the client itself.
    LegacyForm,
}

pub type InteractionKinds = BTreeSet<InteractionKind>;

impl InteractionKind {
    pub const ALL: [InteractionKind; 3] = [
        InteractionKind::SignedRequest,
        InteractionKind::BrowserRedirect,
        InteractionKind::LegacyForm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::BrowserRedirect => "browser-redirect",
            InteractionKind::SignedRequest => "signed-request",
            InteractionKind::LegacyForm => "legacy-form",
        }
    }

    /// Dispatch priority, lowest first: non-interactive before interactive,
    /// modern before legacy.
    pub fn priority(&self) -> u8 {
        match self {
            InteractionKind::SignedRequest => 0,
            InteractionKind::BrowserRedirect => 1,
            InteractionKind::LegacyForm => 2,
        }
    }

    /// Path segment of the per-provider interaction endpoint.
    pub fn endpoint(&self) -> &'static str {
        match self {
            InteractionKind::BrowserRedirect => "browser",
            InteractionKind::SignedRequest => "signed",
            InteractionKind::LegacyForm => "form",
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InteractionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "browser-redirect" => Ok(InteractionKind::BrowserRedirect),
            "signed-request" => Ok(InteractionKind::SignedRequest),
            "legacy-form" => Ok(InteractionKind::LegacyForm),
            _ => Err(format!("Invalid interaction kind: {}", s)),
        }
    }
}

/// Parse a comma separated capability list such as
/// `signed-request, browser-redirect`. Unknown names are skipped so newer
/// clients can advertise kinds this server does not know.
pub fn parse_kind_list(value: &str) -> InteractionKinds {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in InteractionKind::ALL {
            assert_eq!(kind.as_str().parse::<InteractionKind>(), Ok(kind));
        }
    }

    #[test]
    fn capability_list_ignores_unknown_kinds() {
        let kinds = parse_kind_list("signed-request, carrier-pigeon,,browser-redirect");
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&InteractionKind::SignedRequest));
        assert!(kinds.contains(&InteractionKind::BrowserRedirect));
    }

    #[test]
    fn all_is_in_priority_order() {
        let priorities: Vec<u8> = InteractionKind::ALL.iter().map(|k| k.priority()).collect();
        assert_eq!(priorities, vec![0, 1, 2]);
    }
}
