use std::fmt;
use std::sync::{Arc, OnceLock};

/// Errors from reading or resolving a [`Promise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PromiseError {
    #[error("value not loaded yet")]
    NotLoadedYet,
    #[error("promise already resolved")]
    AlreadyResolved,
}

/// A value that becomes available exactly once.
///
/// Clones share the same slot: resolving through one clone makes the value
/// visible through all of them. The only transition is unresolved to resolved,
/// and it never reverses.
pub struct Promise<T> {
    slot: Arc<OnceLock<T>>,
}

impl<T> Promise<T> {
    /// Creates an unresolved promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(OnceLock::new()),
        }
    }

    /// Creates a promise that is already resolved to `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self {
            slot: Arc::new(OnceLock::from(value)),
        }
    }

    /// Returns the value.
    ///
    /// # Errors
    ///
    /// [`PromiseError::NotLoadedYet`] while unresolved.
    pub fn get(&self) -> Result<&T, PromiseError> {
        self.slot.get().ok_or(PromiseError::NotLoadedYet)
    }

    /// Resolves the promise.
    ///
    /// # Errors
    ///
    /// [`PromiseError::AlreadyResolved`] on every call after the first; the
    /// stored value is left untouched.
    pub fn resolve(&self, value: T) -> Result<(), PromiseError> {
        self.slot
            .set(value)
            .map_err(|_| PromiseError::AlreadyResolved)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.slot.get().is_some()
    }

    /// `true` if both handles share one slot.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.get() {
            Some(value) => f.debug_tuple("Resolved").field(value).finish(),
            None => f.write_str("Unresolved"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_read_fails() {
        let promise: Promise<u32> = Promise::new();
        assert_eq!(promise.get(), Err(PromiseError::NotLoadedYet));
        assert!(!promise.is_resolved());
    }

    #[test]
    fn resolution_is_visible_through_clones() {
        let promise = Promise::new();
        let reader = promise.clone();
        promise.resolve("ready".to_string()).unwrap();
        assert_eq!(reader.get().map(String::as_str), Ok("ready"));
        assert!(reader.ptr_eq(&promise));
    }

    #[test]
    fn second_resolution_is_rejected() {
        let promise = Promise::resolved(1);
        assert_eq!(promise.resolve(2), Err(PromiseError::AlreadyResolved));
        assert_eq!(promise.get(), Ok(&1));
    }
}
