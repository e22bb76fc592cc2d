//! Session bookkeeping shared across transports.
//!
//! A [`SessionRegistry`] is created once at startup and handed to every
//! engine. It owns the global flash erase/write lease: only one session may
//! hold it, from the erase until its upload completes or is abandoned.
//! Each engine keeps a [`SessionGuard`] that also tracks the deadline of a
//! pending confirmation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::SessionError;

/// Identifier of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Process-wide session registry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    active: AtomicUsize,
    flash_owner: Mutex<Option<SessionId>>,
}

impl SessionRegistry {
    /// Create a registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new session.
    pub fn open_session(self: &Arc<Self>) -> SessionGuard {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.active.fetch_add(1, Ordering::Relaxed);
        debug!("Opened {id}");
        SessionGuard {
            registry: Arc::clone(self),
            id,
            holds_flash: false,
            confirm_deadline: None,
        }
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Session currently holding the flash lease.
    pub fn flash_owner(&self) -> Option<SessionId> {
        self.flash_owner.lock().ok().and_then(|owner| *owner)
    }
}

/// Per-session view of the registry.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
    holds_flash: bool,
    confirm_deadline: Option<Instant>,
}

impl SessionGuard {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Take the flash erase/write lease.
    pub fn acquire_flash(&mut self) -> Result<(), SessionError> {
        let mut owner = self
            .registry
            .flash_owner
            .lock()
            .map_err(|_| SessionError::HardwareError("session registry poisoned".into()))?;
        match *owner {
            Some(other) if other != self.id => {
                warn!("{} denied flash access, held by {other}", self.id);
                Err(SessionError::FlashBusy)
            },
            _ => {
                *owner = Some(self.id);
                self.holds_flash = true;
                Ok(())
            },
        }
    }

    /// Give the lease back, if held.
    pub fn release_flash(&mut self) {
        if !self.holds_flash {
            return;
        }
        self.holds_flash = false;
        if let Ok(mut owner) = self.registry.flash_owner.lock() {
            if *owner == Some(self.id) {
                *owner = None;
            }
        }
    }

    /// Whether this session holds the lease.
    pub fn holds_flash(&self) -> bool {
        self.holds_flash
    }

    /// Whether another session holds the lease.
    pub fn flash_held_elsewhere(&self) -> bool {
        self.registry
            .flash_owner()
            .is_some_and(|owner| owner != self.id)
    }

    /// Start a bounded confirmation wait.
    pub fn begin_wait(&mut self, now: Instant, timeout: Duration) {
        self.confirm_deadline = Some(now + timeout);
    }

    /// Stop waiting.
    pub fn end_wait(&mut self) {
        self.confirm_deadline = None;
    }

    /// Deadline of the pending confirmation.
    pub fn deadline(&self) -> Option<Instant> {
        self.confirm_deadline
    }

    /// Whether the pending confirmation has run out of time.
    pub fn wait_expired(&self, now: Instant) -> bool {
        self.confirm_deadline.is_some_and(|d| now >= d)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release_flash();
        self.registry.active.fetch_sub(1, Ordering::Relaxed);
        debug!("Closed {}", self.id);
    }
}
