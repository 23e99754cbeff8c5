//! Response writers for the proxy's own (non-forwarded) answers.

use bytes::Bytes;
use http::{header, StatusCode};
use pingora_error::{ErrorType::InternalError, OrErr, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::Serialize;

const APPLICATION_JSON: &str = "application/json";

/// Structured JSON error body shared by the catch-all responses.
pub fn error_body(error: &str, message: &str) -> String {
    serde_json::json!({ "error": error, "message": message }).to_string()
}

/// Writes a JSON error response and closes the stream.
pub async fn send_json_error(
    session: &mut Session,
    status: StatusCode,
    error: &str,
    message: &str,
) -> Result<()> {
    let body = error_body(error, message);
    send_json_bytes(session, status, body.into_bytes()).await
}

/// Serialises `data` and writes it as a JSON response.
pub async fn send_json<T: Serialize>(
    session: &mut Session,
    status: StatusCode,
    data: &T,
) -> Result<()> {
    let body = serde_json::to_vec(data)
        .or_err_with(InternalError, || "serializing response body")?;
    send_json_bytes(session, status, body).await
}

/// Writes `204 No Content` with an empty body.
pub async fn send_no_content(session: &mut Session) -> Result<()> {
    let resp = ResponseHeader::build(StatusCode::NO_CONTENT, None)?;
    session.write_response_header(Box::new(resp), true).await?;
    Ok(())
}

async fn send_json_bytes(session: &mut Session, status: StatusCode, body: Vec<u8>) -> Result<()> {
    let mut resp = ResponseHeader::build(status, None)?;
    resp.insert_header(header::CONTENT_TYPE, APPLICATION_JSON)?;
    resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
    session.write_response_header(Box::new(resp), false).await?;
    session
        .write_response_body(Some(Bytes::from(body)), true)
        .await?;
    Ok(())
}
