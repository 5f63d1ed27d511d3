use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Channel or connection state shared between a path processor's worker
/// loop and its handles.
///
/// The worker loop is the only writer; handle predicates running on
/// other threads take point-in-time reads and only ever observe whole
/// merged snapshots. A poisoned lock means the worker crashed mid-merge,
/// so readers panic rather than serve a half-merged view.
pub struct SharedCache<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> SharedCache<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().expect("state cache lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().expect("state cache lock poisoned")
    }
}

impl<T> Clone for SharedCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Default> Default for SharedCache<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
