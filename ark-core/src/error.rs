use bitcoin::Amount;
use std::fmt;

/// An error generated by this library.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum ErrorKind {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("wallet has not been initialized")]
    NotInitialized,
    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: Amount, available: Amount },
    #[error("amount {amount} is below the dust limit of {dust}")]
    AmountBelowDust { amount: Amount, dust: Amount },
    #[error("amount must be greater than zero")]
    AmountNonPositive,
    #[error("provider error (transient: {transient}): {message}")]
    Provider { transient: bool, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid tree structure at level {level}, index {index}: {reason}")]
    InvalidTreeStructure {
        level: usize,
        index: usize,
        reason: String,
    },
    #[error("signing session used out of order: {0}")]
    SigningStageViolation(String),
    #[error("round failed: {0}")]
    RoundFailed(String),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("{0}")]
    AdHoc(String),
}

impl Error {
    pub fn config(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Config(e.to_string()))
    }

    pub fn not_initialized() -> Self {
        Self::new(ErrorKind::NotInitialized)
    }

    pub fn insufficient_funds(needed: Amount, available: Amount) -> Self {
        Self::new(ErrorKind::InsufficientFunds { needed, available })
    }

    pub fn amount_below_dust(amount: Amount, dust: Amount) -> Self {
        Self::new(ErrorKind::AmountBelowDust { amount, dust })
    }

    pub fn amount_non_positive() -> Self {
        Self::new(ErrorKind::AmountNonPositive)
    }

    /// A provider failure that the caller may reasonably retry.
    pub fn provider_transient(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Provider {
            transient: true,
            message: e.to_string(),
        })
    }

    /// A provider failure that will not go away by retrying.
    pub fn provider_fatal(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Provider {
            transient: false,
            message: e.to_string(),
        })
    }

    /// The server sent malformed or unexpected data.
    pub fn protocol(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Protocol(e.to_string()))
    }

    pub fn invalid_tree_structure(level: usize, index: usize, reason: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidTreeStructure {
            level,
            index,
            reason: reason.to_string(),
        })
    }

    pub fn signing_stage(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::SigningStageViolation(e.to_string()))
    }

    /// A failure originated by the Ark server during a round.
    pub fn round_failed(reason: impl fmt::Display) -> Self {
        Self::new(ErrorKind::RoundFailed(reason.to_string()))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    pub fn crypto(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Crypto(e.to_string()))
    }

    pub fn transaction(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Transaction(e.to_string()))
    }

    pub fn ad_hoc(e: impl fmt::Display) -> Self {
        Self::new(ErrorKind::AdHoc(e.to_string()))
    }

    /// The `(level, index)` of the offending tree node, if this is a tree structure error.
    pub fn tree_violation(&self) -> Option<(usize, usize)> {
        match self.kind {
            ErrorKind::InvalidTreeStructure { level, index, .. } => Some((level, index)),
            _ => None,
        }
    }

    /// The server-provided reason, if this is a round failure.
    pub fn round_failure_reason(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::RoundFailed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_signing_stage_violation(&self) -> bool {
        matches!(self.kind, ErrorKind::SigningStageViolation(_))
    }

    pub fn is_config(&self) -> bool {
        matches!(self.kind, ErrorKind::Config(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Whether the caller may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Provider { transient: true, .. })
    }

    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: Vec::new(),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_prepended_to_the_message() {
        let error: Result<(), Error> = Err(Error::ad_hoc("boom"));
        let error = error
            .context("failed to sign tree")
            .context("failed to join round")
            .unwrap_err();

        assert_eq!(
            error.to_string(),
            "failed to join round: failed to sign tree: boom"
        );
    }

    #[test]
    fn tree_violation_reports_offending_node() {
        let error = Error::invalid_tree_structure(2, 3, "bad amount");

        assert_eq!(error.tree_violation(), Some((2, 3)));
        assert_eq!(Error::ad_hoc("other").tree_violation(), None);
    }

    #[test]
    fn provider_errors_expose_transience() {
        assert!(Error::provider_transient("connection reset").is_transient());
        assert!(!Error::provider_fatal("bad request").is_transient());
    }
}
