//! Result of a get-or-load call

use std::sync::Arc;

use crate::error::LoadError;

/// How a get-or-load call was resolved
///
/// A lock wait that timed out resolves to `Absent`, same as a plain miss.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Value was cached or produced by a loader
    Found(Arc<T>),

    /// No value; nothing was loaded by this caller
    Absent,

    /// This caller ran the loader and it failed
    LoadFailed(LoadError),
}

impl<T> Outcome<T> {
    /// Collapse to a plain optional value, dropping any failure cause
    pub fn into_option(self) -> Option<Arc<T>> {
        match self {
            Outcome::Found(value) => Some(value),
            Outcome::Absent | Outcome::LoadFailed(_) => None,
        }
    }

    /// Borrow the value, if any
    pub fn value(&self) -> Option<&Arc<T>> {
        match self {
            Outcome::Found(value) => Some(value),
            _ => None,
        }
    }

    /// Check if a value was produced
    pub fn is_found(&self) -> bool {
        matches!(self, Outcome::Found(_))
    }

    /// Check if the loader failed
    pub fn is_load_failed(&self) -> bool {
        matches!(self, Outcome::LoadFailed(_))
    }
}
