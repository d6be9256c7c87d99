use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use errly_protocol::HttpErrorEnvelope;

use crate::errors::HttpError;

pub type HttpResponse = Response;
pub type HttpResult<T> = Result<T, HttpError>;

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(HttpErrorEnvelope {
                code: self.code().to_owned(),
                message: self.to_string(),
                details: None,
            }),
        )
            .into_response()
    }
}

pub fn json_ok<T: serde::Serialize>(status: StatusCode, body: T) -> Response {
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn assert_error_response(response: Response, expected_status: StatusCode, expected_code: &str) {
        assert_eq!(response.status(), expected_status);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: HttpErrorEnvelope = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.code, expected_code);
    }

    #[tokio::test]
    async fn bad_request_maps_to_400_with_bad_request_code() {
        let response = HttpError::BadRequest("missing field".to_owned()).into_response();
        assert_error_response(response, StatusCode::BAD_REQUEST, "BAD_REQUEST").await;
    }

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let response = HttpError::NotFound("no such group".to_owned()).into_response();
        assert_error_response(response, StatusCode::NOT_FOUND, "NOT_FOUND").await;
    }

    #[tokio::test]
    async fn internal_maps_to_500() {
        let response = HttpError::Internal("db unavailable".to_owned()).into_response();
        assert_error_response(response, StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR").await;
    }
}
