//! Ferry Storage Layer
//!
//! SQLite-based persistence for download history and settings.
//! Every history write happens inside a transaction.

mod database;
mod error;
mod migrations;

pub use database::Database;
pub use error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;
