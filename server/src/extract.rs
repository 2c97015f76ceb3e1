//! Request body extractors that fail with taxonomy errors.
//!
//! axum's own `Json` and `Form` rejections produce plain-text bodies. These
//! wrappers turn them into [`AppError`]s so clients always receive the
//! structured error body:
//!
//! - a body over the size limit becomes `FileTooLarge` (413)
//! - anything else (bad content type, malformed or mistyped data) becomes
//!   `Validation` (400)

use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::{Form, Json};

use crate::error::AppError;

/// JSON body extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

/// URL-encoded form body extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedForm<T>(pub T);

fn rejection_error(status: StatusCode, detail: String) -> AppError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::file_too_large(detail)
    } else {
        AppError::validation(detail)
    }
}

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(rejection_error(rejection.status(), rejection.body_text())),
        }
    }
}

impl<T, S> FromRequest<S> for ValidatedForm<T>
where
    Form<T>: FromRequest<S, Rejection = FormRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Form::<T>::from_request(req, state).await {
            Ok(Form(value)) => Ok(Self(value)),
            Err(rejection) => Err(rejection_error(rejection.status(), rejection.body_text())),
        }
    }
}
