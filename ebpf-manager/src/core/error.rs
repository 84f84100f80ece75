//! # Errors
//!
//! Typed errors the manager and its resources can report. They travel inside
//! `anyhow::Error` and can be matched with `downcast_ref::<ResourceError>()`.

/// Specific types of errors resources and the manager can generate.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum ResourceError {
    /// Emitted when an operation requires the resource to be initialized.
    #[error("Resource {0} is not initialized")]
    NotInitialized(String),
    /// Emitted when an operation requires the resource to be running (or
    /// paused, for resume).
    #[error("Resource {0} is not running")]
    NotRunning(String),
    /// Emitted when an operation is attempted on a closed resource.
    #[error("Resource {0} is closed")]
    Closed(String),
    /// Emitted at init time when a ring buffer has no data handler.
    #[error("No data handler set for {0}")]
    MissingDataHandler(String),
    /// Emitted when looking up a resource the manager does not know about.
    #[error("Unknown resource {0}")]
    UnknownResource(String),
    /// Emitted when registering two resources under the same name.
    #[error("Resource {0} is already registered")]
    DuplicateResource(String),
}

/// Several sub-steps of a single operation failed. Errors are kept in the
/// order they happened.
#[derive(thiserror::Error, Debug)]
#[error("{} errors occurred: {}", .errors.len(), join(.errors))]
pub struct CompositeError {
    errors: Vec<anyhow::Error>,
}

fn join(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl CompositeError {
    /// Combine a list of errors. Returns `None` when the list is empty, the
    /// error itself when it holds a single element and a `CompositeError`
    /// otherwise.
    pub fn combine(mut errors: Vec<anyhow::Error>) -> Option<anyhow::Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(anyhow::Error::new(CompositeError { errors })),
        }
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }
}
