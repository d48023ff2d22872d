//! The migration steps. Each public function builds a named [`Step`]; the
//! engine strings them together.
//!
//! [`Step`]: crate::step::Step

pub mod disk;
pub mod instance;
pub mod network;
pub mod prepare;
pub mod volume;

use cloudhop_services::ServiceError;
use tracing::debug;

/// Deleting something that is already gone is not an error.
pub(crate) fn ignore_missing(result: Result<(), ServiceError>) -> Result<(), ServiceError> {
    match result {
        Err(err) if err.is_not_found() => {
            debug!(error = %err, "resource already gone");
            Ok(())
        }
        other => other,
    }
}
