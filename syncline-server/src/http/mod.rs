//! HTTP error surface: typed API errors rendered as RFC 7807 problem
//! documents.

pub mod error;
pub mod problem;

pub use error::{ApiError, AppResult};
pub use problem::ProblemDetails;
