//! Client side of the upload pipeline: request validation, the transport
//! contract and its HTTP implementation, and the retrying state machine.

pub mod http_transport;
pub mod request;
pub mod transfer;
pub mod upload_client;

pub use http_transport::HttpTransferChannel;
pub use request::{DocumentFile, SubjectRef, UploadRequest};
pub use upload_client::{UploadClient, UploadFailure, UploadState};
