//! Thin collaborators over [`SecurityService`](crate::security::SecurityService).
//!
//! Application code holds one of these rather than the service itself:
//! [`Logger`] for audited logging and [`ErrorHandler`] for turning
//! failures into safe, rate-limited reports. Configuration loading lives
//! in [`crate::config`].

mod errors;
mod logging;

pub use errors::{ERROR_OPERATION, ErrorHandler, HandledError};
pub use logging::Logger;
