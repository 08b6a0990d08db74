use http::StatusCode;
use thiserror::Error;

/// Error taxonomy of the caching core.
///
/// `NotFound` is normal control flow; the pipeline maps the rest to
/// HTTP statuses or to a BYPASS response around the upstream body.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("object not found")]
    NotFound,

    #[error("requested range not satisfiable")]
    InvalidRange,

    /// The upstream returned a status the pipeline refuses to serve
    /// from cache logic (416, 5xx with no usable body).
    #[error("upstream returned {status}")]
    Upstream { status: StatusCode },

    #[error("storage failure: {0}")]
    Storage(anyhow::Error),

    #[error("request cancelled or deadline exceeded")]
    Cancelled,

    /// A chunk referenced by the index could not be opened or was
    /// short; the object is discarded and refetched.
    #[error("corrupt chunk {index} for {key}")]
    Corrupt { key: String, index: u32 },
}

impl CacheError {
    pub fn upstream(status: StatusCode) -> Self {
        Self::Upstream { status }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CacheError::NotFound => StatusCode::NOT_FOUND,
            CacheError::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            CacheError::Upstream { status } => *status,
            CacheError::Storage(_) | CacheError::Corrupt { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            CacheError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Storage(err)
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Storage(err.into())
    }
}
