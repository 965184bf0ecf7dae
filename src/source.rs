//! Target source capability
//!
//! A [`TargetSource`] opens pages; a [`PageHandle`] is one open page that can
//! be navigated, waited on and captured. The session manager and request
//! handlers only ever talk to these traits, so a headless browser can be
//! swapped for an in-memory fake.

use crate::Result;
use async_trait::async_trait;
use std::time::{Duration, SystemTime};

/// Opens fresh pages against the underlying browser.
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Open a new blank page owned by the caller.
    async fn open(&self) -> Result<Box<dyn PageHandle>>;
}

/// One live page.
///
/// Captures never mutate the page, so a handle may serve several requests
/// at once. `close` is called exactly once by the owning session.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Navigate to `url` and return the HTTP status of the main document.
    async fn navigate(&self, url: &str) -> Result<u16>;

    /// Wait until `selector` matches, failing with
    /// [`Error::ReadinessTimeout`](crate::Error::ReadinessTimeout) after `timeout`.
    async fn wait_for_ready(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// PNG bytes of the first element matching `selector`.
    async fn capture_region(&self, selector: &str) -> Result<Vec<u8>>;

    /// PNG bytes of the whole viewport.
    async fn capture_page(&self) -> Result<Vec<u8>>;

    /// Release the page.
    async fn close(&self) -> Result<()>;
}

/// Raw bitmap bytes taken from one slot's page.
#[derive(Debug, Clone)]
pub struct Capture {
    pub slot_id: String,
    pub taken_at: SystemTime,
    pub bytes: Vec<u8>,
}

impl Capture {
    pub fn new(slot_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            slot_id: slot_id.into(),
            taken_at: SystemTime::now(),
            bytes,
        }
    }
}
