//! Server-side document store over SQLite.
//!
//! - `model`: rows written or read by the attendance pipeline.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `attendance_sync::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{NewEvent, ValidationTask};
