//! Upload requests and the checks they pass before anything is sent.

use crate::models::paper::{YearError, parse_year};
use bytes::Bytes;
use std::{io, path::PathBuf};
use thiserror::Error;

/// The only document type accepted for upload.
pub const ACCEPTED_CONTENT_TYPE: &str = "application/pdf";

/// Hard ceiling on a single document.
pub const MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1024;

/// Where the document bytes come from. A path is re-opened on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFile {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub source: FileSource,
}

impl DocumentFile {
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            content_type: content_type.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    /// Describe a file on disk; only its metadata is read here.
    pub async fn from_path(
        path: impl Into<PathBuf>,
        content_type: impl Into<String>,
    ) -> io::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            content_type: content_type.into(),
            size: metadata.len(),
            source: FileSource::Path(path),
        })
    }
}

/// The subject picked for an upload, as the catalogue describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRef {
    pub id: String,
    pub has_subcategories: bool,
}

/// Form state as entered by the user; nothing is guaranteed yet.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub file: Option<DocumentFile>,
    pub subject: Option<SubjectRef>,
    pub sub_category_id: Option<String>,
    pub year: Option<String>,
    pub topic: Option<String>,
}

/// A request that passed validation and can be sent as-is on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPayload {
    pub file: DocumentFile,
    pub subject_id: String,
    pub sub_category_id: Option<String>,
    pub year: i32,
    pub topic: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please fill all required fields")]
    MissingFields,
    #[error("Please select a subcategory")]
    MissingSubCategory,
    #[error("Please upload a PDF file only")]
    InvalidFileType { content_type: String },
    #[error("Please upload a file smaller than 50MB")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("Invalid year: {0}")]
    InvalidYear(#[from] YearError),
    #[error("No validated upload is pending")]
    NothingToSubmit,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl UploadRequest {
    /// Check the request in the order a user fixes the form: required
    /// fields, subcategory, file type, file size, year.
    pub fn validate(&self, current_year: i32) -> Result<UploadPayload, ValidationError> {
        let (Some(file), Some(subject), Some(year)) =
            (&self.file, &self.subject, non_blank(&self.year))
        else {
            return Err(ValidationError::MissingFields);
        };
        if subject.id.trim().is_empty() {
            return Err(ValidationError::MissingFields);
        }

        let sub_category_id = non_blank(&self.sub_category_id);
        if subject.has_subcategories && sub_category_id.is_none() {
            return Err(ValidationError::MissingSubCategory);
        }

        if file.content_type != ACCEPTED_CONTENT_TYPE {
            return Err(ValidationError::InvalidFileType {
                content_type: file.content_type.clone(),
            });
        }
        if file.size > MAX_UPLOAD_SIZE {
            return Err(ValidationError::FileTooLarge {
                size: file.size,
                limit: MAX_UPLOAD_SIZE,
            });
        }

        let year = parse_year(&year, current_year)?;

        Ok(UploadPayload {
            file: file.clone(),
            subject_id: subject.id.trim().to_string(),
            sub_category_id,
            year,
            topic: non_blank(&self.topic),
        })
    }
}
