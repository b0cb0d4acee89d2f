//! Caveat decoding and discharge minting.
//!
//! A third-party caveat id is `base64url(json{condition, nonce}) "." hex(mac)`
//! sealed by the relying party with the key it shares with this service.
//! The discharge root key is derived from that key and the caveat id, so it
//! never travels.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::models::macaroon::{hmac_sha256, DECLARED_PREFIX, TIME_BEFORE_PREFIX};
use crate::models::{ConditionError, Macaroon, ParsedCondition};

const ROOT_KEY_LABEL: &[u8] = b"discharge-root-key";

#[derive(Debug, Error)]
pub enum BakeryError {
    #[error("invalid caveat id: {0}")]
    InvalidCaveat(String),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("cannot mint discharge: {0}")]
    Mint(String),
}

#[derive(Serialize, Deserialize)]
struct SealedCaveat {
    condition: String,
    nonce: String,
}

#[derive(Debug, Clone)]
pub struct DecodedCaveat {
    pub caveat_id: Vec<u8>,
    pub condition: ParsedCondition,
}

/// What a discharge asserts about the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub username: String,
    pub groups: Option<Vec<String>>,
}

pub trait Minter: Send + Sync {
    fn decode_caveat(&self, caveat_id: &[u8]) -> Result<DecodedCaveat, BakeryError>;

    fn mint(&self, caveat_id: &[u8], assertion: &Assertion) -> Result<Macaroon, BakeryError>;
}

pub struct Bakery {
    location: String,
    shared_key: SecretVec<u8>,
    expiry: Duration,
}

impl Bakery {
    pub fn new(location: impl Into<String>, shared_key: Vec<u8>, expiry: Duration) -> Self {
        Self {
            location: location.into(),
            shared_key: SecretVec::new(shared_key),
            expiry,
        }
    }

    /// Relying-party half: seal `condition` into a caveat id.
    pub fn seal_caveat(shared_key: &[u8], condition: &str) -> Vec<u8> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = SealedCaveat {
            condition: condition.to_string(),
            nonce: hex::encode(nonce),
        };
        // Serializing two strings cannot fail.
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&sealed).unwrap_or_default());
        let mac = hmac_sha256(shared_key, payload.as_bytes());
        format!("{}.{}", payload, hex::encode(mac)).into_bytes()
    }

    pub fn discharge_root_key(shared_key: &[u8], caveat_id: &[u8]) -> [u8; 32] {
        let mut data = Vec::with_capacity(ROOT_KEY_LABEL.len() + caveat_id.len());
        data.extend_from_slice(ROOT_KEY_LABEL);
        data.extend_from_slice(caveat_id);
        hmac_sha256(shared_key, &data)
    }
}

impl Minter for Bakery {
    fn decode_caveat(&self, caveat_id: &[u8]) -> Result<DecodedCaveat, BakeryError> {
        let raw = std::str::from_utf8(caveat_id)
            .map_err(|_| BakeryError::InvalidCaveat("not utf-8".to_string()))?;
        let (payload, mac) = raw
            .split_once('.')
            .ok_or_else(|| BakeryError::InvalidCaveat("missing signature".to_string()))?;

        let mac = hex::decode(mac).map_err(|_| BakeryError::InvalidCaveat("malformed signature".to_string()))?;
        let expected = hmac_sha256(self.shared_key.expose_secret(), payload.as_bytes());
        if mac.len() != expected.len() || !bool::from(expected[..].ct_eq(&mac[..])) {
            return Err(BakeryError::InvalidCaveat("signature mismatch".to_string()));
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload.as_bytes())
            .map_err(|_| BakeryError::InvalidCaveat("malformed payload".to_string()))?;
        let sealed: SealedCaveat =
            serde_json::from_slice(&json).map_err(|e| BakeryError::InvalidCaveat(e.to_string()))?;

        Ok(DecodedCaveat {
            caveat_id: caveat_id.to_vec(),
            condition: sealed.condition.parse()?,
        })
    }

    fn mint(&self, caveat_id: &[u8], assertion: &Assertion) -> Result<Macaroon, BakeryError> {
        if assertion.username.is_empty() || assertion.username.contains(char::is_whitespace) {
            return Err(BakeryError::Mint(format!(
                "cannot assert username {:?}",
                assertion.username
            )));
        }
        let expiry = chrono::Duration::from_std(self.expiry)
            .map_err(|e| BakeryError::Mint(e.to_string()))?;

        let root_key = Self::discharge_root_key(self.shared_key.expose_secret(), caveat_id);
        let mut macaroon = Macaroon::new(&root_key, caveat_id.to_vec(), self.location.clone());
        macaroon.add_first_party_caveat(format!("{}username {}", DECLARED_PREFIX, assertion.username));
        if let Some(groups) = &assertion.groups {
            macaroon.add_first_party_caveat(format!("{}groups {}", DECLARED_PREFIX, groups.join(" ")));
        }
        macaroon.add_first_party_caveat(format!(
            "{}{}",
            TIME_BEFORE_PREFIX,
            (chrono::Utc::now() + expiry).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));
        Ok(macaroon)
    }
}
