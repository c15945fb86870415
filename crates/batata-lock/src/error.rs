//! Error types for distributed lock operations

/// Error type for lock acquisition and release
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock service error: {0}")]
    Service(#[from] anyhow::Error),

    #[error("failed to acquire lock '{key}': {message}")]
    Acquire { key: String, message: String },

    #[error("lock was not acquired")]
    NotAcquired,

    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),

    /// A release failure that happened after at least one earlier failure.
    ///
    /// `cause` holds the chain built so far, so walking `source()` ends at
    /// the first failure that was encountered.
    #[error("{error}")]
    Chained {
        error: Box<LockError>,
        #[source]
        cause: Box<LockError>,
    },
}

impl LockError {
    /// Wrap a newer failure around an existing chain.
    pub fn chain(self, next: LockError) -> LockError {
        LockError::Chained {
            error: Box::new(next),
            cause: Box::new(self),
        }
    }

    /// The first failure of a chain (the error itself if it is not chained).
    pub fn root_cause(&self) -> &LockError {
        let mut current = self;
        while let LockError::Chained { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// All failures of a chain in the order they were encountered.
    pub fn failures(&self) -> Vec<&LockError> {
        let mut out = Vec::new();
        let mut current = self;
        while let LockError::Chained { error, cause } = current {
            out.push(error.as_ref());
            current = cause;
        }
        out.push(current);
        out.reverse();
        out
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
