//! UploadClient: validates a single paper upload and drives it through a
//! [`TransferChannel`] with bounded automatic retry.
//!
//! ```text
//! Idle -> Validating -> Transferring -> Succeeded
//!                            |      \-> Failed
//!                            v
//!                         Retrying -> Transferring
//! ```
//!
//! Every attempt re-sends the whole file. Only network errors, timeouts and
//! 500/502/503/504 responses are retried; a 500 that reports the object was
//! stored (`fileUrl`) is not, so a retry never records the paper twice.

use crate::{
    client::{
        request::{UploadPayload, UploadRequest, ValidationError},
        transfer::{ProgressSink, TransferChannel, TransferError, TransferProgress},
    },
    models::paper::Paper,
};
use chrono::{Datelike, Utc};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Total attempts per logical upload, the first one included.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubled for each later retry.
pub const BASE_BACKOFF: Duration = Duration::from_millis(2000);

/// Files above this size get the long transfer timeout.
pub const LARGE_FILE_THRESHOLD: u64 = 50 * 1024 * 1024;

const LARGE_FILE_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

pub fn transfer_timeout(size: u64) -> Duration {
    if size > LARGE_FILE_THRESHOLD {
        LARGE_FILE_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    }
}

/// Delay inserted before retry `retry` (1-based): 2 s, then 4 s.
pub fn backoff_delay(retry: u32) -> Duration {
    BASE_BACKOFF * 2u32.pow(retry.saturating_sub(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Validating,
    Transferring,
    /// Waiting `delay` before attempt `attempt` (0-based).
    Retrying {
        attempt: u32,
        delay: Duration,
    },
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed { reason: String, retryable: bool },
}

/// Bookkeeping for one send of the payload.
#[derive(Debug, Clone)]
pub struct TransferAttempt {
    pub index: u32,
    pub started_at: Instant,
    pub bytes_sent: u64,
    pub outcome: AttemptOutcome,
}

/// Progress of the attempt with index `attempt`, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub attempt: u32,
    pub percent: u8,
}

#[derive(Debug, Error)]
pub enum FailureKind {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("network error: {0}")]
    Network(String),
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error("server responded with {status}: {}", .message.as_deref().unwrap_or("no message"))]
    Server {
        status: u16,
        message: Option<String>,
        details: Option<String>,
        /// Set when the object was stored but its record was not.
        file_url: Option<String>,
    },
    #[error("upload cancelled")]
    Cancelled,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Network(_) | FailureKind::Timeout(_) => true,
            FailureKind::Server {
                status, file_url, ..
            } => file_url.is_none() && matches!(status, 500 | 502 | 503 | 504),
            FailureKind::Validation(_) | FailureKind::Cancelled => false,
        }
    }
}

impl From<TransferError> for FailureKind {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Network(message) => FailureKind::Network(message),
            TransferError::Timeout(after) => FailureKind::Timeout(after),
            TransferError::Cancelled => FailureKind::Cancelled,
            TransferError::Server { status, body } => {
                let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
                FailureKind::Server {
                    status,
                    message: text("error"),
                    details: text("details"),
                    file_url: text("fileUrl"),
                }
            }
        }
    }
}

/// A logical upload that ended without success.
#[derive(Debug, Error)]
#[error("upload failed after {attempts} attempt(s): {kind}")]
pub struct UploadFailure {
    pub kind: FailureKind,
    pub attempts: u32,
}

impl UploadFailure {
    /// The failure was transient but the attempt budget ran out.
    pub fn exhausted(&self) -> bool {
        self.kind.is_retryable() && self.attempts >= MAX_ATTEMPTS
    }

    /// Text shown to the person uploading.
    pub fn user_message(&self) -> String {
        let message = match &self.kind {
            FailureKind::Validation(err) => err.to_string(),
            FailureKind::Cancelled => "File upload was cancelled".to_string(),
            FailureKind::Timeout(_) => "The upload took too long and timed out. Please try again \
                 with a smaller file or check your connection."
                .to_string(),
            FailureKind::Network(_) => {
                "Network error occurred during upload. Please try again.".to_string()
            }
            FailureKind::Server {
                status,
                message,
                details,
                file_url,
            } => server_message(
                *status,
                message.as_deref(),
                details.as_deref(),
                file_url.as_deref(),
            ),
        };

        if self.exhausted() {
            format!("{} (gave up after {} attempts)", message, self.attempts)
        } else {
            message
        }
    }
}

fn server_message(
    status: u16,
    message: Option<&str>,
    details: Option<&str>,
    file_url: Option<&str>,
) -> String {
    if let Some(url) = file_url {
        return format!(
            "Your file was uploaded but couldn't be saved in our records. It is stored at {}.",
            url
        );
    }

    let text = format!("{} {}", message.unwrap_or(""), details.unwrap_or("")).to_lowercase();
    if text.contains("storage") {
        if text.contains("bucket") {
            "Storage configuration error: The storage bucket is not properly configured. \
             Please contact support."
                .to_string()
        } else {
            "Storage error: The file couldn't be saved. Please try again or contact support."
                .to_string()
        }
    } else if text.contains("database") {
        "Database error: Your file was uploaded but couldn't be saved in our records. \
         Please try again."
            .to_string()
    } else if status == 413 {
        "The file is too large for the server to process. Please try a smaller file.".to_string()
    } else if status == 502 || status == 504 {
        "The server took too long to respond. This might happen with large files. \
         Please try again."
            .to_string()
    } else {
        details
            .or(message)
            .unwrap_or("Failed to upload paper")
            .to_string()
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    /// The recorded paper, when the server returned one.
    pub paper: Option<Paper>,
    pub body: Value,
    pub attempts: u32,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// One upload form's worth of state. Methods take `&mut self`, so at most
/// one transfer can be in flight per client; use [`Self::cancel_token`] to
/// abort from elsewhere.
pub struct UploadClient<C: TransferChannel + ?Sized> {
    channel: Arc<C>,
    state: UploadState,
    pending: Option<UploadPayload>,
    attempts: Vec<TransferAttempt>,
    cancel: CancellationToken,
    on_progress: Option<ProgressCallback>,
}

impl<C: TransferChannel + ?Sized> UploadClient<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            state: UploadState::Idle,
            pending: None,
            attempts: Vec::new(),
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    pub fn on_progress(mut self, callback: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn attempts(&self) -> &[TransferAttempt] {
        &self.attempts
    }

    /// Token that aborts the current upload, including a pending backoff.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Back to `Idle` with a fresh cancellation token.
    pub fn reset(&mut self) {
        self.state = UploadState::Idle;
        self.pending = None;
        self.attempts.clear();
        self.cancel = CancellationToken::new();
    }

    pub fn validate(&mut self, request: &UploadRequest) -> Result<(), UploadFailure> {
        self.validate_at(request, Utc::now().year())
    }

    /// Validate against an explicit current year. A client in a terminal
    /// state is reset first.
    pub fn validate_at(
        &mut self,
        request: &UploadRequest,
        current_year: i32,
    ) -> Result<(), UploadFailure> {
        if matches!(self.state, UploadState::Succeeded | UploadState::Failed) {
            self.reset();
        }
        self.state = UploadState::Validating;

        match request.validate(current_year) {
            Ok(payload) => {
                debug!(file = %payload.file.name, size = payload.file.size, "upload request valid");
                self.pending = Some(payload);
                self.state = UploadState::Transferring;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "upload request rejected");
                self.pending = None;
                Err(self.fail(err.into(), 0))
            }
        }
    }

    /// Validate then submit.
    pub async fn upload(
        &mut self,
        request: &UploadRequest,
    ) -> Result<UploadReceipt, UploadFailure> {
        self.validate(request)?;
        self.submit().await
    }

    /// Send the validated payload, retrying transient failures with backoff.
    pub async fn submit(&mut self) -> Result<UploadReceipt, UploadFailure> {
        let Some(payload) = self.pending.take() else {
            return Err(UploadFailure {
                kind: ValidationError::NothingToSubmit.into(),
                attempts: 0,
            });
        };
        let timeout = transfer_timeout(payload.file.size);
        let cancel = self.cancel.clone();
        self.attempts.clear();

        for index in 0..MAX_ATTEMPTS {
            if index > 0 {
                let delay = backoff_delay(index);
                self.state = UploadState::Retrying {
                    attempt: index,
                    delay,
                };
                warn!(
                    attempt = index + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upload after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(self.fail(FailureKind::Cancelled, index)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(self.fail(FailureKind::Cancelled, index));
            }

            self.state = UploadState::Transferring;
            self.attempts.push(TransferAttempt {
                index,
                started_at: Instant::now(),
                bytes_sent: 0,
                outcome: AttemptOutcome::Pending,
            });
            info!(
                attempt = index + 1,
                file = %payload.file.name,
                ?timeout,
                "upload attempt started"
            );

            let sent = Arc::new(AtomicU64::new(0));
            let percent = Arc::new(AtomicU8::new(0));
            self.emit(Progress {
                attempt: index,
                percent: 0,
            });
            let sink = self.progress_sink(index, sent.clone(), percent.clone());

            let result = self
                .channel
                .send(&payload, sink, cancel.clone(), timeout)
                .await;
            let bytes_sent = sent.load(Ordering::Relaxed);

            match result {
                Ok(response) => {
                    if percent.fetch_max(100, Ordering::Relaxed) < 100 {
                        self.emit(Progress {
                            attempt: index,
                            percent: 100,
                        });
                    }
                    self.finish_attempt(bytes_sent, AttemptOutcome::Succeeded);
                    self.state = UploadState::Succeeded;

                    let paper = response
                        .body
                        .get("paper")
                        .cloned()
                        .and_then(|p| serde_json::from_value::<Paper>(p).ok());
                    info!(attempts = index + 1, status = response.status, "upload succeeded");
                    return Ok(UploadReceipt {
                        paper,
                        body: response.body,
                        attempts: index + 1,
                    });
                }
                Err(err) => {
                    let kind = FailureKind::from(err);
                    let retryable = kind.is_retryable();
                    self.finish_attempt(
                        bytes_sent,
                        AttemptOutcome::Failed {
                            reason: kind.to_string(),
                            retryable,
                        },
                    );
                    if !retryable || index + 1 == MAX_ATTEMPTS {
                        return Err(self.fail(kind, index + 1));
                    }
                    warn!(attempt = index + 1, error = %kind, "upload attempt failed");
                }
            }
        }

        // The loop returns on its last iteration.
        Err(self.fail(FailureKind::Network("no attempt was made".into()), MAX_ATTEMPTS))
    }

    fn progress_sink(
        &self,
        attempt: u32,
        sent: Arc<AtomicU64>,
        percent: Arc<AtomicU8>,
    ) -> ProgressSink {
        let callback = self.on_progress.clone();
        Arc::new(move |progress: TransferProgress| {
            sent.fetch_max(progress.bytes_sent, Ordering::Relaxed);
            let current = percent_of(progress.bytes_sent, progress.total_bytes);
            let previous = percent.fetch_max(current, Ordering::Relaxed);
            if current > previous {
                if let Some(callback) = &callback {
                    callback(Progress {
                        attempt,
                        percent: current,
                    });
                }
            }
        })
    }

    fn emit(&self, progress: Progress) {
        if let Some(callback) = &self.on_progress {
            callback(progress);
        }
    }

    fn finish_attempt(&mut self, bytes_sent: u64, outcome: AttemptOutcome) {
        if let Some(attempt) = self.attempts.last_mut() {
            attempt.bytes_sent = bytes_sent;
            attempt.outcome = outcome;
        }
    }

    fn fail(&mut self, kind: FailureKind, attempts: u32) -> UploadFailure {
        self.state = UploadState::Failed;
        let failure = UploadFailure { kind, attempts };
        error!(attempts, error = %failure.kind, "upload failed");
        failure
    }
}

fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (sent.min(total) * 100 / total) as u8
}
