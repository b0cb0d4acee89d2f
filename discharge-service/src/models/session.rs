use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::macaroon::Macaroon;

/// Which login protocol a session belongs to. Legacy sessions are
/// consumed by the first successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Legacy,
    Modern,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Legacy => "legacy",
            Protocol::Modern => "modern",
        }
    }
}

/// Opaque, unguessable wait-token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitId(String);

impl WaitId {
    const BYTES: usize = 16;

    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WaitId {
    type Err = InvalidWaitId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == Self::BYTES * 2
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidWaitId)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed wait id")]
pub struct InvalidWaitId;

/// Terminal failure recorded against a session, replayed to every poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DischargeFailure {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitState {
    Pending,
    Succeeded(Macaroon),
    Failed(DischargeFailure),
}

impl WaitState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WaitState::Pending)
    }
}
