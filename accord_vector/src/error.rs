//! Error kinds for the vector discovery service.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("collection {0} has dimension {1}, expected {2}")]
    DimensionMismatch(String, usize, usize),
}
