//! Represents an uploaded exam paper and the rules shared by client and server
//! for its year and stored object key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// Earliest exam year accepted for a paper.
pub const MIN_YEAR: i32 = 2000;

/// Fallback used when the uploaded part carries no file name.
const DEFAULT_FILE_NAME: &str = "document.pdf";

/// A persisted paper record.
///
/// Created exactly once, after the object it points at has been written.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Paper {
    pub id: Uuid,
    pub year: i32,
    pub topic: Option<String>,

    /// Public URL of the stored object.
    pub file_url: String,

    pub subject_id: String,
    pub sub_category_id: Option<String>,

    /// Caller that uploaded the paper.
    pub user_id: Uuid,

    pub created_at: DateTime<Utc>,
}

/// Fields needed to insert a new paper.
#[derive(Clone, Debug)]
pub struct NewPaper {
    pub year: i32,
    pub topic: Option<String>,
    pub file_url: String,
    pub subject_id: String,
    pub sub_category_id: Option<String>,
    pub user_id: Uuid,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum YearError {
    #[error("year is required")]
    Missing,
    #[error("year `{0}` must be a 4-digit number")]
    Malformed(String),
    #[error("year {year} must be between {min} and {max}")]
    OutOfRange { year: i32, min: i32, max: i32 },
}

/// Parse a user-supplied year string.
///
/// Accepts exactly four ASCII digits within `[MIN_YEAR, current_year]`.
pub fn parse_year(raw: &str, current_year: i32) -> Result<i32, YearError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(YearError::Missing);
    }
    if trimmed.len() != 4 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(YearError::Malformed(trimmed.to_string()));
    }
    let year: i32 = trimmed
        .parse()
        .map_err(|_| YearError::Malformed(trimmed.to_string()))?;
    if !(MIN_YEAR..=current_year).contains(&year) {
        return Err(YearError::OutOfRange {
            year,
            min: MIN_YEAR,
            max: current_year,
        });
    }
    Ok(year)
}

/// Replace every character outside `[A-Za-z0-9.-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() {
        return DEFAULT_FILE_NAME.to_string();
    }
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the storage key for an upload: `<unix millis>_<sanitized name>`.
pub fn object_key(original_name: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}",
        now.timestamp_millis(),
        sanitize_file_name(original_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_year_accepts_range_bounds() {
        assert_eq!(parse_year("2000", 2024), Ok(2000));
        assert_eq!(parse_year(" 2024 ", 2024), Ok(2024));
    }

    #[test]
    fn parse_year_rejects_bad_input() {
        assert_eq!(parse_year("", 2024), Err(YearError::Missing));
        assert_eq!(
            parse_year("23", 2024),
            Err(YearError::Malformed("23".into()))
        );
        assert_eq!(
            parse_year("20x3", 2024),
            Err(YearError::Malformed("20x3".into()))
        );
        assert_eq!(
            parse_year("1999", 2024),
            Err(YearError::OutOfRange {
                year: 1999,
                min: 2000,
                max: 2024
            })
        );
        assert!(matches!(
            parse_year("2025", 2024),
            Err(YearError::OutOfRange { year: 2025, .. })
        ));
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(
            sanitize_file_name("Maths Paper (final) #2.pdf"),
            "Maths_Paper__final___2.pdf"
        );
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("résumé.pdf"), "r_sum_.pdf");
        assert_eq!(sanitize_file_name("   "), "document.pdf");
    }

    #[test]
    fn object_key_prefixes_timestamp() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            object_key("Physics 2023.pdf", now),
            "1700000000123_Physics_2023.pdf"
        );
    }
}
