use std::fmt;

/// An error generated by the Ark client.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum ErrorKind {
    #[error("Ark server error: {0}")]
    ArkServer(String),
    #[error("blockchain error: {0}")]
    Blockchain(String),
    #[error("wallet error: {0}")]
    Wallet(String),
    #[error(transparent)]
    Core(ark_core::Error),
    #[error("{0}")]
    AdHoc(String),
}

impl Error {
    pub fn ark_server(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ArkServer(e.to_string()))
    }

    pub fn blockchain(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Blockchain(e.to_string()))
    }

    pub fn wallet(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Wallet(e.to_string()))
    }

    pub fn ad_hoc(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::AdHoc(e.to_string()))
    }

    /// The server-provided reason, if the round this client participated in failed.
    pub fn round_failure_reason(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Core(e) => e.round_failure_reason(),
            _ => None,
        }
    }

    pub fn as_core(&self) -> Option<&ark_core::Error> {
        match &self.kind {
            ErrorKind::Core(e) => Some(e),
            _ => None,
        }
    }

    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: Vec::new(),
        }
    }
}

impl From<ark_core::Error> for Error {
    fn from(e: ark_core::Error) -> Self {
        Self::new(ErrorKind::Core(e))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for context in self.context.iter().rev() {
            write!(f, "{context}: ")?;
        }

        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}

/// Extension trait to attach human-readable context to an [`Error`] as it bubbles up.
pub trait ErrorContext<T> {
    fn context(self, context: impl fmt::Display) -> Result<T, Error>;

    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: fmt::Display,
        F: FnOnce() -> C;
}

impl<T> ErrorContext<T> for Result<T, Error> {
    fn context(self, context: impl fmt::Display) -> Result<T, Error> {
        self.map_err(|mut e| {
            e.context.push(context.to_string());
            e
        })
    }

    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.map_err(|mut e| {
            e.context.push(f().to_string());
            e
        })
    }
}
