//! Interaction endpoints: one per interaction kind, plus discovery.

use askama::Template;
use reqwest::Url;
use secrecy::SecretString;
use service_core::axum::{
    extract::{OriginalUri, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    Json,
};
use std::collections::BTreeMap;

use crate::{
    dtos::{LoginForm, LoginQuery},
    models::{InteractionKind, WaitId},
    services::{Credentials, DischargeError, SignedRequest},
    utils::ValidatedForm,
    AppState,
};

fn parse_wait_id(raw: &str) -> Result<WaitId, DischargeError> {
    raw.parse()
        .map_err(|_| DischargeError::BadRequest("malformed wait id".to_string()))
}

fn password(form: LoginForm) -> Credentials {
    Credentials::Password {
        username: form.username,
        password: SecretString::new(form.password),
    }
}

#[derive(Template)]
#[template(path = "login.html")]
struct LoginPage<'a> {
    provider: &'a str,
    action: &'a str,
    error: Option<&'a str>,
}

fn login_page(provider: &str, action: &str, error: Option<&str>) -> Result<String, DischargeError> {
    LoginPage {
        provider,
        action,
        error,
    }
    .render()
    .map_err(|e| DischargeError::Internal(anyhow::anyhow!("cannot render login page: {}", e)))
}

/// Only same-site destinations are followed after a browser login.
fn safe_return_to(location: &str, return_to: &str) -> bool {
    (return_to.starts_with('/') && !return_to.starts_with("//"))
        || return_to == location
        || return_to.starts_with(&format!("{}/", location))
}

/// Render the login form for a pending session.
pub async fn browser_login_page(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<LoginQuery>,
    OriginalUri(uri): OriginalUri,
) -> Result<Html<String>, DischargeError> {
    let wait_id = parse_wait_id(&query.waitid)?;
    state.discharger.sessions().context(&wait_id)?;
    if state.discharger.registry().get(&provider).is_none() {
        return Err(DischargeError::NotFound(format!(
            "identity provider {:?} not found",
            provider
        )));
    }
    Ok(Html(login_page(&provider, &uri.to_string(), None)?))
}

/// Browser-redirect callback: the form submission that resolves the
/// wait-token.
pub async fn browser_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<LoginQuery>,
    OriginalUri(uri): OriginalUri,
    ValidatedForm(form): ValidatedForm<LoginForm>,
) -> Response {
    let wait_id = match parse_wait_id(&query.waitid) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match state
        .discharger
        .authenticate(&wait_id, &provider, InteractionKind::BrowserRedirect, password(form))
        .await
    {
        Ok(_) => match query.return_to {
            Some(target) if safe_return_to(state.discharger.location(), &target) => {
                Redirect::to(&target).into_response()
            }
            Some(_) => DischargeError::BadRequest("return_to is not allowed".to_string()).into_response(),
            None => Html("<!DOCTYPE html><p>Login successful. You may close this window.</p>".to_string())
                .into_response(),
        },
        Err(err) => {
            let message = err.public_message();
            match login_page(&provider, &uri.to_string(), Some(&message)) {
                Ok(page) => (err.status(), Html(page)).into_response(),
                Err(_) => err.into_response(),
            }
        }
    }
}

/// Legacy form login: `{}` on success or a structured error.
pub async fn legacy_form_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<LoginQuery>,
    ValidatedForm(form): ValidatedForm<LoginForm>,
) -> Result<Json<serde_json::Value>, DischargeError> {
    let wait_id = parse_wait_id(&query.waitid)?;
    state
        .discharger
        .authenticate(&wait_id, &provider, InteractionKind::LegacyForm, password(form))
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn signed(
    state: &AppState,
    provider: &str,
    waitid: &str,
    uri: &service_core::axum::http::Uri,
    headers: &HeaderMap,
) -> Result<StatusCode, DischargeError> {
    let wait_id = parse_wait_id(waitid)?;
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = Url::parse(&format!("{}{}", state.discharger.location(), path_and_query))
        .map_err(|e| DischargeError::BadRequest(format!("invalid request url: {}", e)))?;
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    state
        .discharger
        .authenticate(
            &wait_id,
            provider,
            InteractionKind::SignedRequest,
            Credentials::Signed(SignedRequest {
                method: "GET".to_string(),
                url,
                authorization,
            }),
        )
        .await?;
    Ok(StatusCode::OK)
}

/// Signed-request login: 200 with an empty body on success.
pub async fn signed_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<LoginQuery>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<StatusCode, DischargeError> {
    signed(&state, &provider, &query.waitid, &uri, &headers).await
}

/// Signed request addressed to the first configured agent provider.
pub async fn legacy_agent_login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<StatusCode, DischargeError> {
    let agent = state
        .discharger
        .registry()
        .first_agent()
        .ok_or_else(|| DischargeError::NotFound("no agent provider configured".to_string()))?;
    signed(&state, agent.name(), &query.waitid, &uri, &headers).await
}

/// Login-methods discovery for headless clients.
pub async fn login_methods(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    Json(state.discharger.login_methods())
}
