//! Transport-neutral contract between the upload state machine and the wire.

use crate::client::request::UploadPayload;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Bytes handed to the transport so far for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

pub type ProgressSink = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// A completed exchange with a 2xx status.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub status: u16,
    pub body: Value,
}

/// Every way a single send can end badly, classified at the transport edge.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("server responded with status {status}")]
    Server { status: u16, body: Value },
}

#[async_trait]
pub trait TransferChannel: Send + Sync {
    /// Send one whole payload. Must stop promptly when `cancel` fires and
    /// fail with [`TransferError::Timeout`] once `timeout` elapses.
    async fn send(
        &self,
        payload: &UploadPayload,
        progress: ProgressSink,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<ParsedResponse, TransferError>;
}

/// Interpret a response body, tolerating servers that do not answer JSON.
///
/// A body that does not parse is replaced by `{success: true}` for 2xx
/// statuses and by an `{error}` object naming the status otherwise.
pub fn parse_response(
    status: u16,
    reason: &str,
    body: &[u8],
) -> Result<ParsedResponse, TransferError> {
    let success = (200..300).contains(&status);
    let parsed = serde_json::from_slice::<Value>(body)
        .ok()
        .filter(|v| v.is_object());
    let body = match parsed {
        Some(value) => value,
        None if success => json!({ "success": true }),
        None => json!({ "error": format!("Server returned status {}: {}", status, reason) }),
    };

    if success {
        Ok(ParsedResponse { status, body })
    } else {
        Err(TransferError::Server { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_bodies_pass_through() {
        let ok = parse_response(200, "OK", br#"{"success":true,"paper":{"year":2023}}"#).unwrap();
        assert_eq!(ok.body["paper"]["year"], 2023);

        let Err(TransferError::Server { status, body }) =
            parse_response(500, "Internal Server Error", br#"{"error":"boom","fileUrl":"u"}"#)
        else {
            panic!("expected server error");
        };
        assert_eq!(status, 500);
        assert_eq!(body["fileUrl"], "u");
    }

    #[test]
    fn non_json_bodies_are_synthesized() {
        let ok = parse_response(200, "OK", b"<html>done</html>").unwrap();
        assert_eq!(ok.body, json!({ "success": true }));

        let Err(TransferError::Server { status, body }) =
            parse_response(504, "Gateway Timeout", b"upstream timed out")
        else {
            panic!("expected server error");
        };
        assert_eq!(status, 504);
        assert_eq!(body["error"], "Server returned status 504: Gateway Timeout");
    }
}
