use {
    crate::{metrics::SESSIONS_ACTIVE, session::token::SessionToken},
    dashmap::{DashMap, DashSet},
    std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    tokio::sync::mpsc,
};

/// A serialized server event, shared by every session it is sent to.
pub type Frame = Arc<str>;

/// Frames a session may have queued but not yet written. A session that
/// falls this far behind is dropped like one whose socket failed.
pub const SESSION_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// The sessions owned by this instance.
///
/// Once sealed, no new sessions are admitted, and sessions that leave are no
/// longer counted against the shared counter: their departure was already
/// reconciled.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, mpsc::Sender<Frame>>,
    evicted: DashSet<SessionId>,
    next_id: AtomicU64,
    sealed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session and returns its token along with the queue of
    /// frames to write to it. Returns `None` once sealed.
    pub fn add(self: &Arc<Self>) -> Option<(SessionToken, mpsc::Receiver<Frame>)> {
        if self.is_sealed() {
            return None;
        }
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        self.sessions.insert(id, tx);
        SESSIONS_ACTIVE.set(self.sessions.len() as i64);
        Some((SessionToken::new(id, Arc::clone(self)), rx))
    }

    /// Idempotent. Returns `true` if the session was still registered.
    pub fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            SESSIONS_ACTIVE.set(self.sessions.len() as i64);
        }
        removed
    }

    /// Drops a session that can no longer be written to. Its socket task
    /// still owns the token and settles the shared counter when it ends;
    /// eviction before the seal keeps that departure counted.
    pub fn evict(&self, id: SessionId) -> bool {
        let removed = self.remove(id);
        if removed && !self.is_sealed() {
            self.evicted.insert(id);
        }
        removed
    }

    pub(crate) fn take_evicted(&self, id: SessionId) -> bool {
        self.evicted.remove(&id).is_some()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn senders(&self) -> Vec<(SessionId, mpsc::Sender<Frame>)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Stops admitting sessions and returns how many are still owned.
    pub fn seal(&self) -> usize {
        self.sealed.store(true, Ordering::SeqCst);
        self.count()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }
}
