use service_core::axum::{
    extract::{Query, State},
    Json,
};

use crate::{
    dtos::{DischargeResponse, WaitQuery},
    models::WaitId,
    services::DischargeError,
    AppState,
};

/// Long-poll a login session. Serves both `/wait` (legacy) and
/// `/wait-token`; the session itself knows which protocol it belongs to.
pub async fn wait(
    State(state): State<AppState>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<DischargeResponse>, DischargeError> {
    let wait_id: WaitId = query
        .waitid
        .parse()
        .map_err(|e: crate::models::session::InvalidWaitId| DischargeError::BadRequest(e.to_string()))?;

    let macaroon = state.discharger.wait(&wait_id).await?;
    Ok(Json(DischargeResponse { macaroon }))
}
