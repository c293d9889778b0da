//! Error taxonomies for the transform distribution layer
//!
//! `CommError` covers this crate's own failure modes. `GeometryError` is
//! the taxonomy of the downstream transform-tree buffer engine; it is
//! defined here because the listener contract in `comm` is that engine's
//! sole input, but nothing in this crate raises it.

use thiserror::Error;

use crate::bus::BusError;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("communicator was not initialized")]
    NotInitialized,

    #[error("unknown transform kind (code {0})")]
    UnknownKind(i32),

    #[error("transport failure: {0}")]
    Transport(#[from] BusError),

    #[error("encoding failure: {0}")]
    Encoding(String),

    #[error("communicator already shut down")]
    AlreadyShutdown,
}

/// A boxed cause for chaining into a [`GeometryError`].
pub type GeometryCause = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the transform-tree buffer/query engine that consumes
/// transforms via [`crate::comm::TransformListener`].
///
/// Each variant carries a message and an optional chained cause.
#[derive(Error, Debug)]
pub enum GeometryError {
    /// A lookup would require extrapolating beyond the buffered time range.
    #[error("extrapolation impossible: {msg}")]
    Extrapolation {
        msg: String,
        #[source]
        source: Option<GeometryCause>,
    },

    /// The requested transform could not be looked up.
    #[error("lookup failed: {msg}")]
    Lookup {
        msg: String,
        #[source]
        source: Option<GeometryCause>,
    },

    /// A caller passed arguments the engine cannot work with.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        msg: String,
        #[source]
        source: Option<GeometryCause>,
    },

    /// The two requested frames are not connected in the transform tree.
    #[error("frames not connected: {msg}")]
    Connectivity {
        msg: String,
        #[source]
        source: Option<GeometryCause>,
    },
}

impl GeometryError {
    pub fn extrapolation(msg: impl Into<String>) -> Self {
        GeometryError::Extrapolation {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        GeometryError::Lookup {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        GeometryError::InvalidArgument {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        GeometryError::Connectivity {
            msg: msg.into(),
            source: None,
        }
    }

    /// Attach a chained cause to this error.
    pub fn caused_by(mut self, cause: GeometryCause) -> Self {
        match &mut self {
            GeometryError::Extrapolation { source, .. }
            | GeometryError::Lookup { source, .. }
            | GeometryError::InvalidArgument { source, .. }
            | GeometryError::Connectivity { source, .. } => *source = Some(cause),
        }
        self
    }
}
