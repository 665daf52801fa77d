//! Core scheduler types and utilities

pub mod epoch;
pub mod error;
pub mod logging;

pub use epoch::{MarkGeneration, MarkGenerator};
pub use error::{DownloadError, RetrieveError};
