//! Wire shapes shared by the handlers and the client visitors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::models::Macaroon;

/// Structured error body: a stable machine code plus a human message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Info", default, skip_serializing_if = "Option::is_none")]
    pub info: Option<InteractionInfo>,
}

/// Sent with `interaction required`: where to log in and where to wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionInfo {
    #[serde(rename = "WaitID")]
    pub wait_id: String,
    #[serde(rename = "WaitURL")]
    pub wait_url: String,
    #[serde(rename = "VisitURL")]
    pub visit_url: String,
    /// Interaction kind name -> visit URL.
    #[serde(rename = "InteractionMethods")]
    pub interaction_methods: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DischargeResponse {
    #[serde(rename = "Macaroon")]
    pub macaroon: Macaroon,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DischargeForm {
    /// base64url caveat id.
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub waitid: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub waitid: String,
    #[serde(default)]
    pub return_to: Option<String>,
}

/// Submitted by the HTML login page and by legacy form clients.
#[derive(Deserialize, Serialize, Validate)]
pub struct LoginForm {
    #[validate(length(min = 1, max = 256))]
    pub username: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
}

impl std::fmt::Debug for LoginForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginForm")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_required_body_shape() {
        let mut methods = BTreeMap::new();
        methods.insert("browser-redirect".to_string(), "http://idm/login/test/browser?waitid=1".to_string());
        let body = ErrorResponse {
            code: "interaction required".to_string(),
            message: "interaction required".to_string(),
            info: Some(InteractionInfo {
                wait_id: "1".to_string(),
                wait_url: "http://idm/wait-token?waitid=1".to_string(),
                visit_url: "http://idm/login/test/browser?waitid=1".to_string(),
                interaction_methods: methods,
            }),
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Code"], "interaction required");
        assert_eq!(json["Info"]["WaitID"], "1");
        assert!(json["Info"]["InteractionMethods"]["browser-redirect"].is_string());
    }

    #[test]
    fn plain_errors_omit_info() {
        let body = ErrorResponse {
            code: "not found".to_string(),
            message: "wait id not found".to_string(),
            info: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("Info").is_none());
    }

    #[test]
    fn login_form_debug_hides_password() {
        let form = LoginForm {
            username: "test".to_string(),
            password: "testpassword".to_string(),
        };
        assert!(!format!("{:?}", form).contains("testpassword"));
    }
}
