use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Echo server error carrying the plain-text message sent to the client.
///
/// 5xx errors are logged with structured fields when converted into a
/// response.
#[derive(Debug)]
pub struct EchoError {
    pub status: StatusCode,
    pub message: String,
    pub source: Option<anyhow::Error>,
}

impl EchoError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 500 whose client message is the source error's text
    pub fn internal(source: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: source.to_string(),
            source: Some(source),
        }
    }
}

impl IntoResponse for EchoError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = self.status.as_u16(),
                message = %self.message,
                error = ?self.source,
                "Server error"
            );
        }

        // Plain text, newline terminated
        (self.status, format!("{}\n", self.message)).into_response()
    }
}
