//! Database module: the file store's SQL repository and row view models.
//!
//! - `model`: slices of the `uploaded_files` table returned by audit queries.
//! - `repo`: pool setup, migrations and SQL-only functions mapping rows into
//!   [`crate::model::UploadedFile`].
//!
//! Callers import from `flow_gateway::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::UndeliveredUpload;
