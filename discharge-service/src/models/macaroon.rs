//! Minimal HMAC-SHA256 macaroon.
//!
//! `sig0 = HMAC(root_key, identifier)` and `sig_i = HMAC(sig_{i-1}, caveat_i)`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const DECLARED_PREFIX: &str = "declared ";
pub const TIME_BEFORE_PREFIX: &str = "time-before ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macaroon {
    pub location: String,
    #[serde(with = "base64url")]
    pub identifier: Vec<u8>,
    pub caveats: Vec<String>,
    #[serde(serialize_with = "hex_encode", deserialize_with = "hex_decode")]
    pub signature: [u8; 32],
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

impl Macaroon {
    pub fn new(root_key: &[u8], identifier: Vec<u8>, location: impl Into<String>) -> Self {
        let signature = hmac_sha256(root_key, &identifier);
        Self {
            location: location.into(),
            identifier,
            caveats: Vec::new(),
            signature,
        }
    }

    pub fn add_first_party_caveat(&mut self, caveat: impl Into<String>) {
        let caveat = caveat.into();
        self.signature = hmac_sha256(&self.signature, caveat.as_bytes());
        self.caveats.push(caveat);
    }

    /// Recompute the chain from `root_key` and compare in constant time.
    pub fn verify(&self, root_key: &[u8]) -> bool {
        let mut sig = hmac_sha256(root_key, &self.identifier);
        for caveat in &self.caveats {
            sig = hmac_sha256(&sig, caveat.as_bytes());
        }
        sig[..].ct_eq(&self.signature[..]).into()
    }

    /// Value of the first `declared <key> <value>` caveat.
    pub fn declared(&self, key: &str) -> Option<&str> {
        self.caveats.iter().find_map(|caveat| {
            let rest = caveat.strip_prefix(DECLARED_PREFIX)?;
            let (k, v) = rest.split_once(' ')?;
            (k == key).then_some(v)
        })
    }

    pub fn expiry(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.caveats.iter().find_map(|caveat| {
            let raw = caveat.strip_prefix(TIME_BEFORE_PREFIX)?;
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|t| t.with_timezone(&chrono::Utc))
        })
    }
}

mod base64url {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        URL_SAFE_NO_PAD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn hex_encode<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

fn hex_decode<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
    let raw = String::deserialize(d)?;
    let mut out = [0u8; 32];
    hex::decode_to_slice(raw, &mut out).map_err(serde::de::Error::custom)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_verifies_only_with_root_key() {
        let mut m = Macaroon::new(b"root", b"caveat-id".to_vec(), "https://idm.example");
        m.add_first_party_caveat("declared username test");
        assert!(m.verify(b"root"));
        assert!(!m.verify(b"other"));
    }

    #[test]
    fn tampered_caveat_breaks_signature() {
        let mut m = Macaroon::new(b"root", b"id".to_vec(), "loc");
        m.add_first_party_caveat("declared username test");
        m.caveats[0] = "declared username admin@idm".to_string();
        assert!(!m.verify(b"root"));
    }

    #[test]
    fn declared_values() {
        let mut m = Macaroon::new(b"root", b"id".to_vec(), "loc");
        m.add_first_party_caveat("declared username test");
        m.add_first_party_caveat("declared groups test1 test2");
        assert_eq!(m.declared("username"), Some("test"));
        assert_eq!(m.declared("groups"), Some("test1 test2"));
        assert_eq!(m.declared("email"), None);
    }

    #[test]
    fn survives_json() {
        let mut m = Macaroon::new(b"root", vec![0, 255, 10], "loc");
        m.add_first_party_caveat("time-before 2030-01-01T00:00:00Z");
        let json = serde_json::to_string(&m).unwrap();
        let back: Macaroon = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert!(back.verify(b"root"));
        assert!(back.expiry().is_some());
    }
}
