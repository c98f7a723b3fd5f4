use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::Value;

use super::error::EchoError;
use super::{json, EchoState};

/// Echo back a JSON object.
///
/// Only the first JSON value of the body is decoded and whatever follows it
/// is ignored. An empty body and any value that is not an object are
/// acknowledged with an empty 200.
pub async fn echo(body: Bytes) -> Result<Response, EchoError> {
    if body.iter().all(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r')) {
        return Ok(StatusCode::OK.into_response());
    }

    let mut deserializer = serde_json::Deserializer::from_slice(&body);
    let value =
        Value::deserialize(&mut deserializer).map_err(|err| EchoError::bad_request(err.to_string()))?;

    match value {
        Value::Object(_) => {
            let encoded =
                json::to_string(&value).map_err(|err| EchoError::bad_request(err.to_string()))?;
            Ok(([(header::CONTENT_TYPE, "application/json")], encoded).into_response())
        }
        _ => Ok(StatusCode::OK.into_response()),
    }
}

pub async fn hello(State(state): State<EchoState>) -> Result<String, EchoError> {
    let host = (state.hostname)().map_err(|err| EchoError::internal(err.into()))?;
    Ok(format!("Hello World from {} from v3", host))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use tower::ServiceExt; // for `oneshot`

    use super::super::router;
    use super::*;

    fn state(hostname: &'static str) -> EchoState {
        EchoState {
            hostname: Arc::new(move || -> io::Result<String> { Ok(hostname.to_string()) }),
        }
    }

    async fn send(state: EchoState, method: &str, uri: &str, body: &str) -> (StatusCode, Option<String>, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_echo_object() {
        let (status, content_type, body) =
            send(state("web"), "POST", "/echo", r#"{"b": 2, "a": [1, "x"]}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(body, r#"{"a":[1,"x"],"b":2}"#);
    }

    #[tokio::test]
    async fn test_echo_empty_body() {
        let (status, _, body) = send(state("web"), "POST", "/echo", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        let (status, _, body) = send(state("web"), "POST", "/echo", "  \n").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_echo_non_object_values_are_acknowledged() {
        for payload in ["[1, 2]", "\"text\"", "42", "null"] {
            let (status, content_type, body) = send(state("web"), "POST", "/echo", payload).await;
            assert_eq!(status, StatusCode::OK, "payload {}", payload);
            assert_ne!(content_type.as_deref(), Some("application/json"));
            assert!(body.is_empty(), "payload {}", payload);
        }
    }

    #[tokio::test]
    async fn test_echo_only_first_value_is_read() {
        let (status, _, body) = send(state("web"), "POST", "/echo", r#"{"a":1} {"b":2}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_echo_numbers_rendered_as_float64() {
        let cases = [
            (r#"{"a":1.0}"#, r#"{"a":1}"#),
            (r#"{"a":1e2}"#, r#"{"a":100}"#),
            (r#"{"n":18446744073709551616}"#, r#"{"n":18446744073709552000}"#),
            (r#"{"tiny":1e-7,"huge":1e21}"#, r#"{"huge":1e+21,"tiny":1e-7}"#),
        ];
        for (payload, expected) in cases {
            let (status, _, body) = send(state("web"), "POST", "/echo", payload).await;
            assert_eq!(status, StatusCode::OK, "payload {}", payload);
            assert_eq!(body, expected, "payload {}", payload);
        }
    }

    #[tokio::test]
    async fn test_echo_escapes_markup() {
        let (_, _, body) = send(state("web"), "POST", "/echo", r#"{"h":"<b>&"}"#).await;
        assert_eq!(body, r#"{"h":"\u003cb\u003e\u0026"}"#);
    }

    #[tokio::test]
    async fn test_echo_ignores_bytes_after_first_value() {
        let (status, _, body) = send(state("web"), "POST", "/echo", "42x").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        let (status, _, body) = send(state("web"), "POST", "/echo", r#"{"a":1}garbage"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_echo_malformed_json() {
        let (status, _, body) = send(state("web"), "POST", "/echo", r#"{"a": "#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.trim().is_empty());
    }

    #[tokio::test]
    async fn test_hello_reports_hostname() {
        let (status, _, body) = send(state("web-1"), "GET", "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello World from web-1 from v3");

        let (_, _, body) = send(state("web-1"), "GET", "/any/other/path", "").await;
        assert_eq!(body, "Hello World from web-1 from v3");
    }

    #[tokio::test]
    async fn test_hello_hostname_failure() {
        let failing = EchoState {
            hostname: Arc::new(|| -> io::Result<String> {
                Err(io::Error::new(io::ErrorKind::NotFound, "no hostname"))
            }),
        };
        let (status, _, body) = send(failing, "GET", "/", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "no hostname\n");
    }
}
