//! Sessions: one open page per slot, plus the leases that keep it alive
//!
//! A session moves `Initializing -> Ready -> Retiring -> Closed`. Request
//! handlers only ever see Ready sessions, through a [`SessionLease`]. A
//! retiring session waits until every outstanding lease is dropped before
//! its page is closed, and the page is closed at most once.

use crate::source::PageHandle;
use crate::Result;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Ready,
    Retiring,
    Closed,
}

/// A live page bound to one slot.
pub struct Session {
    slot_id: String,
    target_url: String,
    generation: u64,
    created_at: Instant,
    status: Mutex<SessionStatus>,
    page: Box<dyn PageHandle>,
    in_flight: Arc<RwLock<()>>,
    released: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("slot_id", &self.slot_id)
            .field("generation", &self.generation)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    /// Wrap a freshly opened page; the session starts out `Initializing`.
    pub fn new(slot_id: impl Into<String>, target_url: impl Into<String>, generation: u64, page: Box<dyn PageHandle>) -> Self {
        Self {
            slot_id: slot_id.into(),
            target_url: target_url.into(),
            generation,
            created_at: Instant::now(),
            status: Mutex::new(SessionStatus::Initializing),
            page,
            in_flight: Arc::new(RwLock::new(())),
            released: AtomicBool::new(false),
        }
    }

    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// Strictly increasing across every session the manager creates.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn page(&self) -> &dyn PageHandle {
        self.page.as_ref()
    }

    /// Initializing -> Ready. Any other starting state is left alone.
    pub(crate) fn mark_ready(&self) -> bool {
        let mut status = self.status.lock();
        if *status == SessionStatus::Initializing {
            *status = SessionStatus::Ready;
            true
        } else {
            false
        }
    }

    /// Take a lease if the session is Ready and not being retired.
    pub fn lease(self: &Arc<Self>) -> Option<SessionLease> {
        let guard = self.in_flight.clone().try_read_owned().ok()?;
        // Checked after taking the guard: a retirement that starts later
        // has to wait for this lease.
        if self.status() != SessionStatus::Ready {
            return None;
        }
        Some(SessionLease {
            session: Arc::clone(self),
            _guard: guard,
        })
    }

    /// Ready -> Retiring -> (leases drained) -> Closed.
    pub async fn retire(self: Arc<Self>) {
        {
            let mut status = self.status.lock();
            match *status {
                SessionStatus::Retiring | SessionStatus::Closed => return,
                _ => *status = SessionStatus::Retiring,
            }
        }
        debug!(
            target: "boardshot::session",
            "retiring {} generation {}", self.slot_id, self.generation
        );
        let _drained = self.in_flight.clone().write_owned().await;
        if let Err(e) = self.release().await {
            warn!(
                target: "boardshot::session",
                "closing {} generation {} failed: {}", self.slot_id, self.generation, e
            );
        }
    }

    /// Close the underlying page once and mark the session Closed.
    ///
    /// Used directly for sessions that never became current (failed
    /// initialization); current sessions go through [`Session::retire`].
    pub(crate) async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.page.close().await;
        *self.status.lock() = SessionStatus::Closed;
        if result.is_ok() {
            info!(
                target: "boardshot::session",
                "closed {} generation {} after {:?}", self.slot_id, self.generation, self.age()
            );
        }
        result
    }
}

/// Shared, read-only access to a Ready session.
///
/// While any lease is alive the session's page stays open, even if a newer
/// session has already replaced it as current.
pub struct SessionLease {
    session: Arc<Session>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingPage {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PageHandle for CountingPage {
        async fn navigate(&self, _url: &str) -> Result<u16> {
            Ok(200)
        }
        async fn wait_for_ready(&self, _selector: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        async fn capture_region(&self, _selector: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn capture_page(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session(closes: &Arc<AtomicUsize>) -> Arc<Session> {
        let page = CountingPage { closes: closes.clone() };
        Arc::new(Session::new("primary", "https://example.com", 1, Box::new(page)))
    }

    #[test]
    fn initializing_sessions_cannot_be_leased() {
        let closes = Arc::new(AtomicUsize::new(0));
        let s = session(&closes);
        assert!(s.lease().is_none());
        assert!(s.mark_ready());
        assert!(s.lease().is_some());
        assert!(!s.mark_ready());
    }

    #[tokio::test]
    async fn retire_waits_for_outstanding_leases() {
        let closes = Arc::new(AtomicUsize::new(0));
        let s = session(&closes);
        s.mark_ready();
        let lease = s.lease().unwrap();

        let task = tokio::spawn(s.clone().retire());
        for _ in 0..100 {
            if s.status() == SessionStatus::Retiring {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(s.status(), SessionStatus::Retiring);
        assert!(s.lease().is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        drop(lease);
        task.await.unwrap();
        assert_eq!(s.status(), SessionStatus::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn page_is_closed_exactly_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let s = session(&closes);
        s.mark_ready();

        s.clone().retire().await;
        s.clone().retire().await;
        s.release().await.unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(s.status(), SessionStatus::Closed);
    }
}
