use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use service_core::axum::{extract::State, http::HeaderMap, Form, Json};

use crate::{
    dtos::{DischargeForm, DischargeResponse},
    models::interaction::parse_kind_list,
    services::{DischargeError, DischargeRequest, DischargeStart},
    AppState,
};

/// Client capabilities, e.g. `signed-request, browser-redirect`.
pub const INTERACTION_KINDS_HEADER: &str = "x-interaction-kinds";

/// Discharge a third-party caveat, or say how to log in first.
pub async fn discharge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<DischargeForm>,
) -> Result<Json<DischargeResponse>, DischargeError> {
    let caveat_id = URL_SAFE_NO_PAD
        .decode(form.id.trim().as_bytes())
        .map_err(|_| DischargeError::BadRequest("caveat id is not base64url".to_string()))?;

    let client_kinds = headers
        .get(INTERACTION_KINDS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(parse_kind_list);

    match state.discharger.start(DischargeRequest {
        caveat_id,
        client_kinds,
    })? {
        DischargeStart::Discharged(macaroon) => Ok(Json(DischargeResponse { macaroon })),
        DischargeStart::InteractionRequired(info) => {
            Err(DischargeError::InteractionRequired(Box::new(info)))
        }
    }
}
