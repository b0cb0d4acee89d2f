//! OAuth 1.0 request signing (HMAC-SHA1, RFC 5849).

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_METHOD: &str = "HMAC-SHA1";

/// Consumer and (optional) token credentials of one OAuth party.
#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: SecretString,
    pub token: Option<String>,
    pub token_secret: Option<SecretString>,
}

impl OAuthCredentials {
    pub fn consumer(key: impl Into<String>, secret: SecretString) -> Self {
        Self {
            consumer_key: key.into(),
            consumer_secret: secret,
            token: None,
            token_secret: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, secret: SecretString) -> Self {
        self.token = Some(token.into());
        self.token_secret = Some(secret);
        self
    }
}

/// RFC 3986 unreserved characters pass through, everything else is escaped.
pub fn percent_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// `METHOD&base-url&normalized-params`. Query parameters of `url` and
/// `extra` (form body) parameters are included; `oauth_signature` is not.
pub fn signature_base_string(
    method: &str,
    url: &Url,
    oauth_params: &BTreeMap<String, String>,
    extra: &[(String, String)],
) -> String {
    let mut base_url = url.clone();
    base_url.set_query(None);
    base_url.set_fragment(None);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (percent_encode(&k), percent_encode(&v)))
        .chain(
            extra
                .iter()
                .map(|(k, v)| (percent_encode(k), percent_encode(v))),
        )
        .chain(
            oauth_params
                .iter()
                .filter(|(k, _)| k.as_str() != "oauth_signature")
                .map(|(k, v)| (percent_encode(k), percent_encode(v))),
        )
        .collect();
    params.sort();

    let normalized = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(base_url.as_str()),
        percent_encode(&normalized)
    )
}

fn signing_key(consumer_secret: &str, token_secret: Option<&str>) -> String {
    format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret.unwrap_or(""))
    )
}

pub fn sign(
    base_string: &str,
    consumer_secret: &str,
    token_secret: Option<&str>,
) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha1::new_from_slice(signing_key(consumer_secret, token_secret).as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(base_string.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Produce the `Authorization: OAuth ...` header value for a request.
pub fn authorization_header(
    credentials: &OAuthCredentials,
    method: &str,
    url: &Url,
    extra: &[(String, String)],
) -> Result<String, anyhow::Error> {
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    let timestamp = chrono::Utc::now().timestamp().to_string();
    authorization_header_at(credentials, method, url, extra, &timestamp, &nonce)
}

pub fn authorization_header_at(
    credentials: &OAuthCredentials,
    method: &str,
    url: &Url,
    extra: &[(String, String)],
    timestamp: &str,
    nonce: &str,
) -> Result<String, anyhow::Error> {
    let mut params = BTreeMap::new();
    params.insert("oauth_consumer_key".to_string(), credentials.consumer_key.clone());
    params.insert("oauth_nonce".to_string(), nonce.to_string());
    params.insert("oauth_signature_method".to_string(), SIGNATURE_METHOD.to_string());
    params.insert("oauth_timestamp".to_string(), timestamp.to_string());
    params.insert("oauth_version".to_string(), "1.0".to_string());
    if let Some(token) = &credentials.token {
        params.insert("oauth_token".to_string(), token.clone());
    }

    let base = signature_base_string(method, url, &params, extra);
    let signature = sign(
        &base,
        credentials.consumer_secret.expose_secret(),
        credentials.token_secret.as_ref().map(|s| s.expose_secret().as_str()),
    )?;
    params.insert("oauth_signature".to_string(), signature);

    let fields = params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("OAuth {}", fields))
}

/// Parse `OAuth k="v", ...` into its parameters. `realm` is dropped.
pub fn parse_authorization_header(header: &str) -> Option<BTreeMap<String, String>> {
    let rest = header.trim().strip_prefix("OAuth ")?;
    let mut params = BTreeMap::new();
    for field in rest.split(',') {
        let (k, v) = field.trim().split_once('=')?;
        let v = v.trim().strip_prefix('"')?.strip_suffix('"')?;
        let k = urlencoding::decode(k.trim()).ok()?.into_owned();
        if k == "realm" {
            continue;
        }
        params.insert(k, urlencoding::decode(v).ok()?.into_owned());
    }
    Some(params)
}

/// Check a received request's signature against the expected secrets.
pub fn verify(
    method: &str,
    url: &Url,
    params: &BTreeMap<String, String>,
    extra: &[(String, String)],
    consumer_secret: &str,
    token_secret: Option<&str>,
) -> bool {
    let Some(received) = params.get("oauth_signature") else {
        return false;
    };
    if params.get("oauth_signature_method").map(String::as_str) != Some(SIGNATURE_METHOD) {
        return false;
    }
    let base = signature_base_string(method, url, params, extra);
    let Ok(expected) = sign(&base, consumer_secret, token_secret) else {
        return false;
    };
    expected.len() == received.len() && bool::from(expected.as_bytes().ct_eq(received.as_bytes()))
}
