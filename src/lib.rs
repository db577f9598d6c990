//! Exam paper vault: an upload gateway that stores PDF papers in object
//! storage and records them in SQLite, plus the retrying upload client.

pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
