//! Uniform result envelope returned by every session manager operation.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;

use crate::error::{ErrorCode, ServiceError};

/// Outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Warning,
    Error,
}

/// Redo an operation with the parameters it was first called with.
pub struct Retry<T> {
    action: Box<dyn FnOnce() -> BoxFuture<'static, Outcome<T>> + Send + Sync>,
}

impl<T> Retry<T> {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self {
            action: Box::new(move || Box::pin(action())),
        }
    }

    /// Run the operation again.
    pub fn invoke(self) -> BoxFuture<'static, Outcome<T>> {
        (self.action)()
    }
}

impl<T> fmt::Debug for Retry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Retry(..)")
    }
}

/// Result of a session operation.
///
/// Never carries partial success: either `value` is set and the status is
/// `Success`/`Warning`, or the status is `Error` and `code` says why.
#[derive(Debug)]
pub struct Outcome<T> {
    pub status: Status,
    pub code: Option<ErrorCode>,
    /// The service's own code when `code` is [`ErrorCode::Unknown`].
    pub raw_code: Option<String>,
    pub message: String,
    pub value: Option<T>,
    pub retry: Option<Retry<T>>,
}

impl<T> Outcome<T> {
    pub fn success(value: T) -> Self {
        Self {
            status: Status::Success,
            code: None,
            raw_code: None,
            message: String::new(),
            value: Some(value),
            retry: None,
        }
    }

    pub fn warning(value: T, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::Warning,
            code: Some(code),
            raw_code: None,
            message: message.into(),
            value: Some(value),
            retry: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            code: Some(code),
            raw_code: None,
            message: message.into(),
            value: None,
            retry: None,
        }
    }

    /// Wrap a service failure, keeping its code and message untouched.
    pub fn from_service(err: ServiceError) -> Self {
        Self::error(err.code, err.message).with_raw_code(err.raw_code)
    }

    #[must_use]
    pub fn with_raw_code(mut self, raw_code: Option<String>) -> Self {
        self.raw_code = raw_code;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: Retry<T>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_warning(&self) -> bool {
        self.status == Status::Warning
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.code
    }

    /// The code as the service reported it, falling back to `code`.
    pub fn wire_code(&self) -> Option<&str> {
        self.raw_code
            .as_deref()
            .or_else(|| self.code.as_ref().map(<ErrorCode as AsRef<str>>::as_ref))
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Take the retry action, if the operation offered one.
    pub fn take_retry(&mut self) -> Option<Retry<T>> {
        self.retry.take()
    }

    /// Convert into a plain `Result`. Warnings count as success.
    pub fn into_result(self) -> Result<T, ServiceError> {
        match (self.status, self.value) {
            (Status::Error, _) | (_, None) => Err(ServiceError {
                code: self.code.unwrap_or(ErrorCode::Unknown),
                raw_code: self.raw_code,
                message: self.message,
            }),
            (_, Some(value)) => Ok(value),
        }
    }
}
