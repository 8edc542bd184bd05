use {
    crate::session::registry::{ConnectionRegistry, SessionId},
    log::debug,
    std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The session left while the instance was running; the shared counter
    /// still includes it.
    Counted,
    /// The registry was sealed first, so shutdown reconciliation already
    /// subtracted this session.
    Reconciled,
}

/// Registration of a live session. Removes the session from the registry
/// when dropped.
#[derive(Debug)]
pub struct SessionToken {
    id: SessionId,
    registry: Arc<ConnectionRegistry>,
}

impl SessionToken {
    pub(crate) fn new(id: SessionId, registry: Arc<ConnectionRegistry>) -> Self {
        Self { id, registry }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Unregisters the session and reports whether its departure still has
    /// to be applied to the shared counter. Removal and the seal check happen
    /// without yielding, so each session is accounted for exactly once. A
    /// session evicted before the seal was not part of the reconciled count.
    pub fn release(self) -> Departure {
        self.registry.remove(self.id);
        let evicted = self.registry.take_evicted(self.id);
        if self.registry.is_sealed() && !evicted {
            Departure::Reconciled
        } else {
            Departure::Counted
        }
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        if self.registry.remove(self.id) {
            debug!("Cleaning up entry for {}", self.id);
        }
        self.registry.take_evicted(self.id);
    }
}
