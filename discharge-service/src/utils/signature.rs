//! Ed25519 request signatures used by headless agents.
//!
//! The signed message is `METHOD "\n" url-without-query "\n" sorted-query`,
//! where the sorted query omits the `signature` parameter itself.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use reqwest::Url;
use thiserror::Error;

pub const SIGNATURE_PARAM: &str = "signature";
pub const USERNAME_PARAM: &str = "username";
pub const PUBLIC_KEY_PARAM: &str = "public_key";
pub const TIMESTAMP_PARAM: &str = "timestamp";

/// Signed requests older (or further in the future) than this are refused.
pub const MAX_SIGNATURE_AGE_SECONDS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentSignatureError {
    #[error("missing {0} parameter")]
    Missing(&'static str),

    #[error("malformed {0} parameter")]
    Malformed(&'static str),

    #[error("signature expired")]
    Expired,

    #[error("signature verification failed")]
    BadSignature,
}

/// Fields a verified agent request asserts.
#[derive(Debug, Clone)]
pub struct AgentClaim {
    pub username: String,
    pub public_key: VerifyingKey,
    pub timestamp: i64,
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

pub fn decode_public_key(raw: &str) -> Result<VerifyingKey, AgentSignatureError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.trim().as_bytes())
        .map_err(|_| AgentSignatureError::Malformed(PUBLIC_KEY_PARAM))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AgentSignatureError::Malformed(PUBLIC_KEY_PARAM))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| AgentSignatureError::Malformed(PUBLIC_KEY_PARAM))
}

pub fn canonical_request(method: &str, url: &Url) -> String {
    let mut base = url.clone();
    base.set_query(None);
    base.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != SIGNATURE_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}\n{}\n{}", method.to_uppercase(), base.as_str(), query)
}

/// Add agent claims and a detached signature to `url`'s query.
pub fn sign_url(key: &SigningKey, username: &str, method: &str, url: &mut Url, timestamp: i64) {
    url.query_pairs_mut()
        .append_pair(USERNAME_PARAM, username)
        .append_pair(PUBLIC_KEY_PARAM, &encode_public_key(&key.verifying_key()))
        .append_pair(TIMESTAMP_PARAM, &timestamp.to_string());

    let signature = key.sign(canonical_request(method, url).as_bytes());
    url.query_pairs_mut()
        .append_pair(SIGNATURE_PARAM, &URL_SAFE_NO_PAD.encode(signature.to_bytes()));
}

/// Verify the signature on `url` and return what it asserts. Only the
/// signature is checked here; whether the key belongs to the user is up to
/// the caller.
pub fn verify_url(method: &str, url: &Url, now: i64) -> Result<AgentClaim, AgentSignatureError> {
    let param = |name: &'static str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .ok_or(AgentSignatureError::Missing(name))
    };

    let username = param(USERNAME_PARAM)?;
    let public_key = decode_public_key(&param(PUBLIC_KEY_PARAM)?)?;
    let timestamp: i64 = param(TIMESTAMP_PARAM)?
        .parse()
        .map_err(|_| AgentSignatureError::Malformed(TIMESTAMP_PARAM))?;
    let signature = URL_SAFE_NO_PAD
        .decode(param(SIGNATURE_PARAM)?.as_bytes())
        .map_err(|_| AgentSignatureError::Malformed(SIGNATURE_PARAM))?;
    let signature =
        Signature::from_slice(&signature).map_err(|_| AgentSignatureError::Malformed(SIGNATURE_PARAM))?;

    if (now - timestamp).abs() > MAX_SIGNATURE_AGE_SECONDS {
        return Err(AgentSignatureError::Expired);
    }

    public_key
        .verify(canonical_request(method, url).as_bytes(), &signature)
        .map_err(|_| AgentSignatureError::BadSignature)?;

    Ok(AgentClaim {
        username,
        public_key,
        timestamp,
    })
}
