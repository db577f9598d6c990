//! Core data models for the exam paper upload pipeline.
//!
//! Database-backed records derive `sqlx::FromRow` and serialize as camelCase
//! JSON, which is the shape the upload client and the browsing surface read.

pub mod bucket;
pub mod paper;
pub mod subject;
pub mod user;
