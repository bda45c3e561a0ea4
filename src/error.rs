//! Status codes and the error report tree.

use {std::cell::RefCell, std::fmt, thiserror::Error};

/// Stable status codes distinguishable by library callers.
///
/// The set is open-ended; additions keep existing discriminants meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum Status {
    /// Caller contract violated.
    #[error("invalid argument")]
    InvalidArgument,

    /// Call made in the wrong lifecycle state.
    #[error("invalid operation")]
    InvalidOperation,

    /// No attached display matched the selection.
    #[error("display not found")]
    DisplayNotFound,

    /// The display (or its lock) is held elsewhere.
    #[error("display busy")]
    DisplayBusy,

    /// The display has been removed.
    #[error("display removed")]
    DisplayRemoved,

    /// Transport-level fatal error.
    #[error("communication failed")]
    CommunicationFailed,

    /// The per-operation retry cap was reached; causes carry the attempts.
    #[error("maximum retries exceeded")]
    RetriesExhausted,

    /// Every attempt of a retried operation drew a null response.
    ///
    /// A specialisation of [`Status::RetriesExhausted`] that display
    /// discovery interprets when probing the unsupported-feature dialect.
    #[error("all responses were null messages")]
    AllResponsesNull,

    /// The monitor explicitly flagged the feature unsupported.
    #[error("feature reported unsupported by display")]
    ReportedUnsupported,

    /// The library inferred the feature is unsupported via a dialect rule.
    #[error("feature determined to be unsupported")]
    DeterminedUnsupported,

    /// Reply checksum did not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The monitor answered with a zero-length (null) message.
    #[error("null response")]
    NullResponse,

    /// A read returned fewer bytes than the operation requires.
    #[error("short read")]
    ShortRead,

    /// The reply was framed or typed in a way the codec cannot accept.
    #[error("invalid response")]
    InvalidResponse,

    /// A transient timeout reported by the transport.
    #[error("transport timed out")]
    Timeout,

    /// Post-set read-back differed from the written value.
    #[error("verification failed")]
    VerificationFailed,

    /// A configuration or cache file could not be parsed.
    #[error("bad configuration file")]
    BadConfiguration,

    /// The operation was cancelled cooperatively between attempts.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation is not supported on this I/O path.
    #[error("unsupported operation")]
    UnsupportedOp,
}

impl Status {
    /// Whether a single attempt failing with this status may be retried.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Status::NullResponse
                | Status::ShortRead
                | Status::ChecksumMismatch
                | Status::InvalidResponse
                | Status::Timeout
        )
    }
}

/// A node in an error report tree.
///
/// Every failure carries a status, the site that raised it and a message;
/// a retried operation additionally carries one child per failed attempt.
#[derive(Debug, Clone, Error)]
pub struct Error {
    /// The stable status code.
    pub status: Status,
    /// Source site tag, e.g. `"i2c::write"`.
    pub site: &'static str,
    /// Human-readable detail.
    pub message: String,
    /// Child causes, one per contributing failure.
    pub causes: Vec<Error>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} [{}]", self.status, self.site)
        } else {
            write!(f, "{}: {} [{}]", self.status, self.message, self.site)
        }
    }
}

impl Error {
    /// Create a leaf error.
    pub fn new<M: Into<String>>(status: Status, site: &'static str, message: M) -> Self {
        Error {
            status,
            site,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Create a leaf error with no message beyond the status itself.
    pub fn status(status: Status, site: &'static str) -> Self {
        Self::new(status, site, "")
    }

    /// Create a composite error whose children are the per-attempt causes.
    pub fn with_causes<M: Into<String>>(
        status: Status,
        site: &'static str,
        message: M,
        causes: Vec<Error>,
    ) -> Self {
        Error {
            status,
            site,
            message: message.into(),
            causes,
        }
    }

    /// Whether another attempt may be made after this failure.
    pub fn is_retriable(&self) -> bool {
        self.status.is_retriable()
    }

    /// Render the full tree, one cause per line, indented by depth.
    pub fn render_tree(&self) -> String {
        fn render(err: &Error, depth: usize, out: &mut String) {
            for _ in 0..depth {
                out.push_str("  ");
            }
            out.push_str(&err.to_string());
            out.push('\n');
            for cause in &err.causes {
                render(cause, depth + 1, out);
            }
        }
        let mut out = String::new();
        render(self, 0, &mut out);
        out
    }
}

/// The result type of every fallible library operation.
pub type DdcResult<T> = Result<T, Error>;

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// Record an error as this thread's last error detail.
pub(crate) fn set_last_error(err: &Error) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.clone()));
}

/// Retrieve the full error tree of the most recent failure on this thread.
///
/// The slot is left in place so repeated calls return the same detail until
/// another operation fails on the same thread.
pub fn last_error_detail() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_statuses() {
        assert!(Status::NullResponse.is_retriable());
        assert!(Status::ShortRead.is_retriable());
        assert!(Status::Timeout.is_retriable());
        assert!(!Status::DisplayBusy.is_retriable());
        assert!(!Status::CommunicationFailed.is_retriable());
        assert!(!Status::ReportedUnsupported.is_retriable());
    }

    #[test]
    fn tree_renders_causes() {
        let err = Error::with_causes(
            Status::RetriesExhausted,
            "retry",
            "get feature x10 failed after 2 tries",
            vec![
                Error::status(Status::NullResponse, "packet::decode"),
                Error::status(Status::ChecksumMismatch, "packet::decode"),
            ],
        );
        let tree = err.render_tree();
        assert!(tree.contains("maximum retries exceeded"));
        assert!(tree.contains("\n  null response"));
        assert!(tree.contains("\n  checksum mismatch"));
    }

    #[test]
    fn last_error_slot_round_trips() {
        let err = Error::status(Status::DisplayNotFound, "facade");
        set_last_error(&err);
        let got = last_error_detail().unwrap();
        assert_eq!(got.status, Status::DisplayNotFound);
        assert_eq!(got.site, "facade");
    }
}
