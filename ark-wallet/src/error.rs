use std::fmt;

/// The only error type exposed by this crate.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    #[source]
    kind: ErrorKind,
}

#[derive(Debug, thiserror::Error)]
enum ErrorKind {
    #[error("{0}")]
    AdHoc(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("explorer error: {0}")]
    Explorer(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("stale write: {0}")]
    StaleWrite(String),
    #[error("coin selection error: {0}")]
    CoinSelect(String),
    #[error("settlement aborted: {0}")]
    SettlementAborted(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Core(#[from] ark_wallet_core::Error),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn ad_hoc(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::AdHoc(e.to_string()),
        }
    }

    pub fn server(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Server(e.to_string()),
        }
    }

    pub fn explorer(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Explorer(e.to_string()),
        }
    }

    pub fn storage(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Storage(e.to_string()),
        }
    }

    pub fn stale_write(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::StaleWrite(e.to_string()),
        }
    }

    pub fn coin_select(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::CoinSelect(e.to_string()),
        }
    }

    pub fn settlement_aborted(reason: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::SettlementAborted(reason.to_string()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
        }
    }

    pub fn timeout(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Timeout(e.to_string()),
        }
    }

    /// Whether the caller should refresh its view and retry the write.
    pub fn is_stale_write(&self) -> bool {
        match &self.kind {
            ErrorKind::StaleWrite(_) => true,
            ErrorKind::Context { source, .. } => source.is_stale_write(),
            _ => false,
        }
    }

    pub fn is_settlement_aborted(&self) -> bool {
        match &self.kind {
            ErrorKind::SettlementAborted(_) => true,
            ErrorKind::Context { source, .. } => source.is_settlement_aborted(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.kind {
            ErrorKind::Cancelled => true,
            ErrorKind::Context { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<ark_wallet_core::Error> for Error {
    fn from(e: ark_wallet_core::Error) -> Self {
        Self {
            kind: ErrorKind::Core(e),
        }
    }
}

/// Extension trait to attach context to an [`Error`] as it bubbles up.
pub trait ErrorContext<T> {
    fn context(self, context: impl fmt::Display) -> Result<T, Error>;

    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: fmt::Display,
        F: FnOnce() -> C;
}

impl<T> ErrorContext<T> for Result<T, Error> {
    fn context(self, context: impl fmt::Display) -> Result<T, Error> {
        self.map_err(|e| Error {
            kind: ErrorKind::Context {
                context: context.to_string(),
                source: Box::new(e),
            },
        })
    }

    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| Error {
            kind: ErrorKind::Context {
                context: f().to_string(),
                source: Box::new(e),
            },
        })
    }
}
