//! Domain error types for boundaries that need to be matched on
//! programmatically. Everything above these boundaries propagates with
//! `anyhow::Result` and `?`.

use thiserror::Error;

pub use crate::validator::ValidationError;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("query rejected: {0}")]
    Rejected(#[from] ValidationError),
    #[error("database error: {0}")]
    Query(String),
}
