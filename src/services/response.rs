//! Status-code contract for the API boundary
//!
//! Maps service errors and outcomes onto HTTP responses so every handler
//! reports the same status for the same failure. Best-effort warnings travel
//! in the body and as a count header.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::error::HandReceiptError;

use super::property_service::BatchStatus;

/// Header carrying the number of non-fatal warnings
pub const WARNINGS_HEADER: HeaderName = HeaderName::from_static("x-handreceipt-warnings");

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Build a JSON response with 200 OK status
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

/// Build a JSON response with 201 Created status
pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

/// Status code for an error kind
pub fn status_for_error(error: &HandReceiptError) -> StatusCode {
    match error {
        HandReceiptError::InvalidInput(_)
        | HandReceiptError::DuplicateSerial(_)
        | HandReceiptError::Json(_) => StatusCode::BAD_REQUEST,
        HandReceiptError::Unauthorized(_) => StatusCode::FORBIDDEN,
        HandReceiptError::NotFound(_) => StatusCode::NOT_FOUND,
        HandReceiptError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert an error to an HTTP response
pub fn error_response(error: HandReceiptError) -> Response<Full<Bytes>> {
    let status = status_for_error(&error);
    let message = match &error {
        HandReceiptError::NotFound(msg)
        | HandReceiptError::InvalidInput(msg)
        | HandReceiptError::Unauthorized(msg)
        | HandReceiptError::Conflict(msg) => msg.clone(),
        HandReceiptError::DuplicateSerial(serial) => format!(
            "A property with serial number {} already exists; \
             verify the serial or request a transfer from its holder",
            serial
        ),
        _ => error.to_string(),
    };

    json_response(status, &serde_json::json!({ "error": message }))
}

/// Status code for a batch import outcome
pub fn status_for_batch(status: BatchStatus) -> StatusCode {
    match status {
        BatchStatus::Created => StatusCode::CREATED,
        BatchStatus::PartialSuccess => StatusCode::PARTIAL_CONTENT,
        BatchStatus::Failed => StatusCode::BAD_REQUEST,
    }
}

/// Attach the warning count header to a success response
pub fn with_warnings(
    mut response: Response<Full<Bytes>>,
    warnings: &[String],
) -> Response<Full<Bytes>> {
    if !warnings.is_empty() {
        response
            .headers_mut()
            .insert(WARNINGS_HEADER, HeaderValue::from(warnings.len()));
    }
    response
}

/// Wrap a service result into an HTTP response
pub fn from_result<T: Serialize>(result: Result<T, HandReceiptError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap a create result into an HTTP response with 201 Created
pub fn from_create_result<T: Serialize>(
    result: Result<T, HandReceiptError>,
) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => created(&value),
        Err(e) => error_response(e),
    }
}
