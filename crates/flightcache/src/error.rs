//! Error types for flightcache

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;

/// Boxed error produced by a loader
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Why a loader produced no value
#[derive(Debug)]
pub enum LoadError {
    /// Loader returned an error
    Failed(BoxError),

    /// Loader panicked
    Panicked(String),
}

impl LoadError {
    /// Build from a payload caught by `catch_unwind`
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        LoadError::Panicked(message)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Failed(e) => write!(f, "Loader failed: {}", e),
            LoadError::Panicked(msg) => write!(f, "Loader panicked: {}", msg),
        }
    }
}

impl StdError for LoadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            LoadError::Failed(e) => Some(&**e),
            LoadError::Panicked(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_failed_exposes_source() {
        let err = LoadError::Failed(Box::new(io::Error::new(io::ErrorKind::Other, "backend down")));

        assert_eq!(err.to_string(), "Loader failed: backend down");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_panic_payloads() {
        let from_str = LoadError::from_panic(Box::new("boom"));
        let from_string = LoadError::from_panic(Box::new(String::from("bang")));
        let opaque = LoadError::from_panic(Box::new(42u8));

        assert_eq!(from_str.to_string(), "Loader panicked: boom");
        assert_eq!(from_string.to_string(), "Loader panicked: bang");
        assert!(matches!(opaque, LoadError::Panicked(_)));
        assert!(opaque.source().is_none());
    }
}
