use std::fmt;
use std::io;
use std::sync::Arc;

use hyper::StatusCode;
use thiserror::Error;

/// The content type used for error bodies unless one is set explicitly.
pub const DEFAULT_ERROR_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// A structured HTTP error.
///
/// Handlers, middlewares and binders return it to request a specific
/// client-visible outcome. The error handler of the [`Ship`](crate::Ship)
/// turns it into a response carrying the status code, the content type and,
/// depending on the status class and debug mode, the message.
#[derive(Debug, Clone)]
pub struct HttpError {
    code: StatusCode,
    message: String,
    content_type: String,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl HttpError {
    /// Creates an error whose message is the canonical reason of `code`.
    pub fn new(code: StatusCode) -> Self {
        HttpError {
            code,
            message: code.canonical_reason().unwrap_or_default().to_owned(),
            content_type: DEFAULT_ERROR_CONTENT_TYPE.to_owned(),
            cause: None,
        }
    }

    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED)
    }

    pub fn unsupported_media_type() -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Replaces the user-facing message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Attaches the underlying cause.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// The error returned by handlers and middlewares.
#[derive(Debug, Error)]
pub enum Error {
    /// A structured error rendered to the client by the error handler.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The response has already been written; nothing else is sent or logged.
    #[error("skip")]
    Skip,

    /// Any other failure. The client gets a generic 500.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Other(err.into())
    }

    /// Creates an unstructured error from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Error::Other(message.to_string().into())
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Error::Skip)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Other(Box::new(err))
    }
}

/// Errors reported synchronously while registering routes, middlewares or
/// virtual hosts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("invalid route path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("route '{path}' uses parameter '{name}' where '{existing}' is already registered")]
    ParamConflict {
        path: String,
        existing: String,
        name: String,
    },

    #[error("route {method} {path} has already been registered")]
    Duplicate { method: String, path: String },

    #[error("route '{path}' has {count} parameters, the maximum is {max}")]
    TooManyParams {
        path: String,
        count: usize,
        max: usize,
    },

    #[error("{count} middlewares exceed the maximum of {max}")]
    TooManyMiddlewares { count: usize, max: usize },

    #[error("the virtual host '{0}' has been added")]
    DuplicateVirtualHost(String),

    #[error("the virtual host cannot create the virtual host")]
    NestedVirtualHost,
}

/// Errors reported by starting or stopping the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("forbid the virtual host to be started as a server")]
    VirtualHost,

    #[error("the server has been started")]
    AlreadyStarted,

    #[error("the server has not been started")]
    NotStarted,

    #[error("the server did not stop within {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

/// Represents errors that can occur during task execution in the executor system.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Represents errors that can occur in the reactor system responsible for I/O events.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    /// Error when registering resources with the reactor
    #[error("registration failed: {0}")]
    Registration(io::Error),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,
}

/// Result of handlers and middlewares.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

pub type ReactorResult<T> = std::result::Result<T, ReactorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Tests that a structured error keeps its message and exposes its cause.
    #[test]
    fn test_http_error_display_with_cause() {
        let cause = io::Error::new(io::ErrorKind::Other, "disk gone");
        let err = HttpError::bad_request()
            .with_message("invalid payload")
            .with_cause(cause);

        assert_eq!(err.code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "invalid payload");
        assert_eq!(err.to_string(), "invalid payload: disk gone");
        assert!(std::error::Error::source(&err).is_some());
    }

    /// Tests that the default message is the canonical reason phrase.
    #[test]
    fn test_http_error_default_message() {
        let err = HttpError::not_found();
        assert_eq!(err.message(), "Not Found");
        assert_eq!(err.content_type(), DEFAULT_ERROR_CONTENT_TYPE);
        assert!(err.cause().is_none());
    }

    /// Tests the conversions into the handler error type.
    #[test]
    fn test_error_conversion() {
        let err: Error = HttpError::internal().into();
        assert!(matches!(err, Error::Http(_)));

        let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(err.to_string(), "boom");

        assert!(Error::Skip.is_skip());
        assert!(!Error::msg("x").is_skip());
    }

    /// Tests the formatting of ExecutorError with IO errors
    #[test]
    fn test_executor_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let exec_err = ExecutorError::from(io_err);

        assert!(matches!(exec_err, ExecutorError::Io(_)));
        assert_eq!(exec_err.to_string(), "io error: test error");
    }

    /// Tests that reactor failures surface through the server error type.
    #[test]
    fn test_server_error_from_reactor() {
        let err = ServerError::from(ReactorError::LockPoisoned);
        assert_eq!(err.to_string(), "mutex lock poisoned");
    }
}
