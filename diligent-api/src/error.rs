use std::sync::Arc;

pub type DiligentResult<T> = Result<T, DiligentError>;

/// Generic error that contains all the different kinds of errors that may occur when using the API
#[derive(Debug, Clone)]
pub enum DiligentError {
    StringError(String),
    /// The call was rejected before it had any effect (bad arguments, incompatible objects)
    Validation(String),
    /// The native device reported a failure
    NativeError(String),
    IoError(Arc<std::io::Error>),
}

impl DiligentError {
    /// Logs `message` and wraps it as a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        let message = message.into();
        log::error!("{}", message);
        DiligentError::Validation(message)
    }
}

impl std::error::Error for DiligentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            DiligentError::StringError(_) => None,
            DiligentError::Validation(_) => None,
            DiligentError::NativeError(_) => None,
            DiligentError::IoError(ref e) => Some(&**e),
        }
    }
}

impl core::fmt::Display for DiligentError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            DiligentError::StringError(ref e) => e.fmt(fmt),
            DiligentError::Validation(ref e) => write!(fmt, "validation error: {}", e),
            DiligentError::NativeError(ref e) => write!(fmt, "native device error: {}", e),
            DiligentError::IoError(ref e) => e.fmt(fmt),
        }
    }
}

impl From<&str> for DiligentError {
    fn from(str: &str) -> Self {
        DiligentError::StringError(str.to_string())
    }
}

impl From<String> for DiligentError {
    fn from(string: String) -> Self {
        DiligentError::StringError(string)
    }
}

impl From<std::io::Error> for DiligentError {
    fn from(error: std::io::Error) -> Self {
        DiligentError::IoError(Arc::new(error))
    }
}
