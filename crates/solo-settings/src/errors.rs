//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why a settings file could not be turned into usable [`SoloSettings`].
///
/// [`SoloSettings`]: crate::SoloSettings
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file is not JSON at all.
    #[error("{} is not valid JSON: {source}", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser error with line and column.
        #[source]
        source: serde_json::Error,
    },

    /// The merged document parsed but does not fit the settings schema,
    /// e.g. a string where a port number belongs.
    #[error("settings do not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),

    /// A value that deserialized fine but breaks a constraint.
    #[error("{field}: {reason}")]
    Constraint {
        /// Dotted camelCase key, as written in the settings file.
        field: &'static str,
        /// What the value must satisfy.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn constraint(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Constraint {
            field,
            reason: reason.into(),
        }
    }

    /// The settings key a [`Constraint`](Self::Constraint) error refers to.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Constraint { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
