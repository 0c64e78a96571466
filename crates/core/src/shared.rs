//! Thread-safe protocol handle.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use crate::protocol::Protocol;

/// Cloneable handle serializing every operation behind one mutex.
///
/// Each closure passed to [`SharedProtocol::with`] runs with exclusive access,
/// so operations from different threads are applied in a total order.
#[derive(Debug, Clone)]
pub struct SharedProtocol {
    inner: Arc<Mutex<Protocol>>,
}

impl SharedProtocol {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            inner: Arc::new(Mutex::new(protocol)),
        }
    }

    /// Run `f` with exclusive access to the protocol.
    pub fn with<T>(&self, f: impl FnOnce(&mut Protocol) -> T) -> T {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Hold the lock across several calls.
    pub fn lock(&self) -> MutexGuard<'_, Protocol> {
        self.inner.lock()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Protocol {
        self.inner.lock().clone()
    }
}

impl From<Protocol> for SharedProtocol {
    fn from(protocol: Protocol) -> Self {
        Self::new(protocol)
    }
}
