//! API middleware: JSON content-type enforcement and response headers.

use axum::{
    extract::Request,
    http::{
        header::{HeaderName, HeaderValue, CONTENT_TYPE},
        Method, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use super::ApiResponse;

/// POST, PUT and PATCH requests must carry `Content-Type: application/json`.
pub async fn content_type_validation(req: Request, next: Next) -> Response {
    if matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH) {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let rejection = match content_type {
            Some(ct) if ct.contains("application/json") => None,
            Some(_) => Some(("Content-Type must be application/json", "UNSUPPORTED_MEDIA_TYPE")),
            None => Some(("Content-Type header is required for this request", "MISSING_CONTENT_TYPE")),
        };
        if let Some((message, code)) = rejection {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Json(ApiResponse::<()>::error_with_code(message, code)),
            )
                .into_response();
        }
    }
    next.run(req).await
}

/// Echo or assign `x-request-id` and add the API version header.
pub async fn api_version_headers(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    let _ = headers.try_insert(HeaderName::from_static("x-api-version"), HeaderValue::from_static("1.0"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        let _ = headers.try_insert(HeaderName::from_static("x-request-id"), value);
    }
    let _ = headers.try_insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );

    response
}
