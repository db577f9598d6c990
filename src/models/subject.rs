//! Subjects and their optional subcategories, referenced by papers.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A top-level exam subject (e.g. "Science").
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,

    /// When set, every paper of this subject must name a subcategory.
    pub has_subcategories: bool,
}

/// A subcategory that belongs to exactly one subject.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubCategory {
    pub id: String,
    pub subject_id: String,
    pub name: String,
}
