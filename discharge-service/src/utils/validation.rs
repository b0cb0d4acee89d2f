use service_core::axum::{
    extract::{FromRequest, Request},
    response::{IntoResponse, Response},
    Form,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::services::DischargeError;

/// Form body that has passed `validator` checks.
pub struct ValidatedForm<T>(pub T);

#[service_core::axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedForm<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Form(value) = Form::<T>::from_request(req, state).await.map_err(|e| {
            DischargeError::BadRequest(format!("Form parse error: {}", e)).into_response()
        })?;

        value.validate().map_err(|e| {
            DischargeError::BadRequest(format!("Validation error: {}", e)).into_response()
        })?;

        Ok(ValidatedForm(value))
    }
}
