use std::path::PathBuf;

use thiserror::Error;

/// Failures of the export operations. All of them are fatal to the run.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The input artifact is missing, unreadable, or structurally invalid.
    #[error("cannot deserialize {}: {reason}", path.display())]
    Deserialization { path: PathBuf, reason: String },

    /// A model field could not be turned into a nested numeric sequence.
    #[error("{}: field `{field}` cannot be exported: {reason}", path.display())]
    UnsupportedValue {
        path: PathBuf,
        field: String,
        reason: String,
    },

    /// The output directory or file could not be created or written.
    #[error("cannot write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
