use std::error::Error as StdError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Not found: {message}")]
    NotFound {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    #[error("Already exists: {message}")]
    AlreadyExists { message: String },

    #[error("Precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("Not implemented: {message}")]
    NotImplemented { message: String },

    #[error("Retry later: {message}")]
    Retryable {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

/// Error class reported back to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PreconditionFailed,
    NotImplemented,
    Retryable,
}

impl DriverError {
    pub fn invalid_argument(message: &str) -> Self {
        DriverError::InvalidArgument {
            message: message.to_string(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        DriverError::NotFound {
            message: message.to_string(),
            source: None,
        }
    }

    pub fn not_found_caused(message: &str, source: anyhow::Error) -> Self {
        DriverError::NotFound {
            message: message.to_string(),
            source: Some(source.into()),
        }
    }

    pub fn already_exists(message: &str) -> Self {
        DriverError::AlreadyExists {
            message: message.to_string(),
        }
    }

    pub fn precondition_failed(message: &str) -> Self {
        DriverError::PreconditionFailed {
            message: message.to_string(),
        }
    }

    pub fn not_implemented(message: &str) -> Self {
        DriverError::NotImplemented {
            message: message.to_string(),
        }
    }

    pub fn retryable(message: &str, source: anyhow::Error) -> Self {
        DriverError::Retryable {
            message: message.to_string(),
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            DriverError::NotFound { .. } => ErrorKind::NotFound,
            DriverError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            DriverError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            DriverError::NotImplemented { .. } => ErrorKind::NotImplemented,
            DriverError::Retryable { .. } => ErrorKind::Retryable,
        }
    }

    /// Message plus the chain of underlying causes, one line.
    pub fn report(&self) -> String {
        let mut msg = self.to_string();
        let mut cause = StdError::source(self);
        while let Some(e) = cause {
            msg.push_str(": ");
            msg.push_str(&e.to_string());
            cause = e.source();
        }
        msg
    }
}

impl ErrorKind {
    /// Status code the runtime's plugin helpers associate with each class.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidArgument | ErrorKind::AlreadyExists => 400,
            ErrorKind::PreconditionFailed => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::NotImplemented => 501,
            ErrorKind::Retryable => 503,
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
