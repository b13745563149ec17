//! Error taxonomy for the outbound pipeline.
//!
//! Every failure a typed client can surface is a [`PipelineError`]. Transport
//! failures carry a [`TransportErrorKind`] so the logging handler can single
//! out refused connections and the resilience policies can tell transient
//! failures apart from everything else.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

/// Boxed error used as the source of transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a failure raised by the HTTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The remote host actively rejected the TCP connection
    ConnectionRefused,
    /// Connection could not be established for another reason (DNS, TLS, reset)
    Connect,
    /// The transport's own connect or read deadline expired
    Timeout,
    /// Any other failure while sending the request or reading the body
    Other,
}

impl TransportErrorKind {
    /// Stable name used in log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection_refused",
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for every stage of the outbound pipeline.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The HTTP transport failed before a response was received
    #[error("transport failure ({kind}) calling {url}: {source}")]
    Transport {
        /// Failure classification
        kind: TransportErrorKind,
        /// Target of the failed request
        url: Url,
        /// Underlying transport error
        #[source]
        source: BoxError,
    },

    /// The circuit breaker rejected the call without sending it
    #[error("Circuit breaker open for {client}, retry after {retry_after:?}")]
    CircuitOpen {
        /// Typed client whose circuit is open
        client: String,
        /// Remaining break duration
        retry_after: Duration,
    },

    /// The per-client deadline expired
    #[error("Request timed out after {duration:?}")]
    Timeout {
        /// Configured deadline
        duration: Duration,
    },

    /// The caller cancelled the call
    #[error("Request cancelled")]
    Cancelled,

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A remote endpoint answered with a status the caller cannot accept
    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// Returned status
        status: StatusCode,
        /// Endpoint that answered
        url: Url,
    },

    /// Response body could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Logging or pipeline configuration is unusable
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Create a transport error of the given kind.
    #[must_use]
    pub fn transport(kind: TransportErrorKind, url: Url, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            kind,
            url,
            source: source.into(),
        }
    }

    /// Create a connection-refused transport error.
    #[must_use]
    pub fn connection_refused(url: Url, source: impl Into<BoxError>) -> Self {
        Self::transport(TransportErrorKind::ConnectionRefused, url, source)
    }

    /// Create a circuit open error for the given client.
    #[must_use]
    pub fn circuit_open(client: impl Into<String>, retry_after: Duration) -> Self {
        Self::CircuitOpen {
            client: client.into(),
            retry_after,
        }
    }

    /// Create an invalid request error with the given message.
    #[must_use]
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Transport kind, if this is a transport failure.
    #[must_use]
    pub const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if the remote host refused the connection.
    #[must_use]
    pub const fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportErrorKind::ConnectionRefused,
                ..
            }
        )
    }

    /// Check if this error is a transient network-level failure.
    ///
    /// Only transport failures qualify. Circuit rejections, deadlines,
    /// cancellation and local errors are never retried.
    ///
    /// # Examples
    ///
    /// ```
    /// use outbound_pipeline::PipelineError;
    /// use std::time::Duration;
    ///
    /// let err = PipelineError::circuit_open("catalog", Duration::from_secs(30));
    /// assert!(!err.is_transient());
    /// assert!(!PipelineError::Cancelled.is_transient());
    /// ```
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Classify a reqwest send/body error.
pub(crate) fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if refused_in_chain(err) {
        TransportErrorKind::ConnectionRefused
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    }
}

/// Walk the source chain looking for an `io::ErrorKind::ConnectionRefused`.
fn refused_in_chain(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let refused = e
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::ConnectionRefused);
        if refused {
            return true;
        }
        current = e.source();
    }
    false
}
