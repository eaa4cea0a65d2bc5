use crate::asset::AssetDecodeError;
use crate::htlc::HtlcError;
use crate::tree_signing::SignerSessionError;
use crate::tx_tree::ReceiverValidationError;
use crate::tx_tree::TreeValidationError;
use std::fmt;

/// The only error type exposed by this crate.
///
/// Failures that callers need to match on (tree validation, asset decoding,
/// signer session state) carry a dedicated error enum inside the relevant
/// [`ErrorKind`] variant.
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
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("address error: {0}")]
    Address(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("coin selection error: {0}")]
    CoinSelect(String),
    #[error("tree validation error")]
    Tree(#[source] TreeValidationError),
    #[error("receiver validation error")]
    Receiver(#[source] ReceiverValidationError),
    #[error("asset packet error")]
    Asset(#[source] AssetDecodeError),
    #[error("signer session error")]
    Signer(#[source] SignerSessionError),
    #[error("HTLC error")]
    Htlc(#[source] HtlcError),
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

    pub fn crypto(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Crypto(e.to_string()),
        }
    }

    pub fn script(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Script(e.to_string()),
        }
    }

    pub fn address(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Address(e.to_string()),
        }
    }

    pub fn transaction(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Transaction(e.to_string()),
        }
    }

    pub fn coin_select(e: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::CoinSelect(e.to_string()),
        }
    }

    /// The tree validation failure behind this error, if that is what it is.
    pub fn as_tree_validation(&self) -> Option<&TreeValidationError> {
        match &self.kind {
            ErrorKind::Tree(e) => Some(e),
            ErrorKind::Context { source, .. } => source.as_tree_validation(),
            _ => None,
        }
    }

    pub fn as_signer_session(&self) -> Option<&SignerSessionError> {
        match &self.kind {
            ErrorKind::Signer(e) => Some(e),
            ErrorKind::Context { source, .. } => source.as_signer_session(),
            _ => None,
        }
    }
}

impl From<TreeValidationError> for Error {
    fn from(e: TreeValidationError) -> Self {
        Self {
            kind: ErrorKind::Tree(e),
        }
    }
}

impl From<ReceiverValidationError> for Error {
    fn from(e: ReceiverValidationError) -> Self {
        Self {
            kind: ErrorKind::Receiver(e),
        }
    }
}

impl From<AssetDecodeError> for Error {
    fn from(e: AssetDecodeError) -> Self {
        Self {
            kind: ErrorKind::Asset(e),
        }
    }
}

impl From<SignerSessionError> for Error {
    fn from(e: SignerSessionError) -> Self {
        Self {
            kind: ErrorKind::Signer(e),
        }
    }
}

impl From<HtlcError> for Error {
    fn from(e: HtlcError) -> Self {
        Self {
            kind: ErrorKind::Htlc(e),
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
