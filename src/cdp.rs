//! Chrome DevTools Protocol page source
//!
//! One headless Chrome process serves every slot; each slot gets its own
//! tab. `headless_chrome` is a blocking API, so every tab is driven by a
//! dedicated worker thread and the async [`PageHandle`] methods simply send
//! it commands and await the reply.

use crate::source::{PageHandle, TargetSource};
use crate::{Error, Result, Viewport};
use async_trait::async_trait;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Network::events::ResponseReceivedEventParams;
use headless_chrome::protocol::cdp::Network::GetResponseBodyReturnObject;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::util::Timeout;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

const STATUS_HANDLER: &str = "boardshot-status";

// The browser must outlive hour-long gaps between refreshes.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Launches headless Chrome once and opens tabs on demand.
pub struct CdpSource {
    browser: Arc<Mutex<Browser>>,
}

impl CdpSource {
    /// Launch a headless browser whose windows use `viewport`.
    pub fn launch(viewport: Viewport) -> Result<Self> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((viewport.width, viewport.height)))
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .build()
            .map_err(|e| Error::CdpError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::CdpError(format!("Failed to launch browser: {}", e)))?;

        Ok(Self {
            browser: Arc::new(Mutex::new(browser)),
        })
    }
}

#[async_trait]
impl TargetSource for CdpSource {
    async fn open(&self) -> Result<Box<dyn PageHandle>> {
        let browser = Arc::clone(&self.browser);
        let tab = tokio::task::spawn_blocking(move || browser.lock().new_tab())
            .await
            .map_err(|e| Error::Other(format!("Tab creation task failed: {}", e)))?
            .map_err(|e| Error::CdpError(format!("Failed to create tab: {}", e)))?;
        Ok(Box::new(CdpPage::spawn(tab)))
    }
}

enum Command {
    Navigate(String, oneshot::Sender<Result<u16>>),
    WaitFor(String, Duration, oneshot::Sender<Result<()>>),
    CaptureRegion(String, oneshot::Sender<Result<Vec<u8>>>),
    CapturePage(oneshot::Sender<Result<Vec<u8>>>),
    Close(oneshot::Sender<Result<()>>),
}

/// A tab driven by its own worker thread.
pub struct CdpPage {
    cmd_tx: Sender<Command>,
}

impl CdpPage {
    fn spawn(tab: Arc<Tab>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();

        thread::spawn(move || {
            let mut closed = false;
            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    Command::Navigate(url, resp) => {
                        let _ = resp.send(navigate(&tab, &url));
                    }
                    Command::WaitFor(selector, timeout, resp) => {
                        let res = tab
                            .wait_for_element_with_custom_timeout(&selector, timeout)
                            .map(|_| ())
                            .map_err(|e| readiness_error(&selector, timeout, e));
                        let _ = resp.send(res);
                    }
                    Command::CaptureRegion(selector, resp) => {
                        let res = tab
                            .find_element(&selector)
                            .and_then(|element| element.capture_screenshot(Page::CaptureScreenshotFormatOption::Png))
                            .map_err(|e| Error::CaptureError(format!("{}: {}", selector, e)));
                        let _ = resp.send(res);
                    }
                    Command::CapturePage(resp) => {
                        let res = tab
                            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
                            .map_err(|e| Error::CaptureError(format!("page screenshot: {}", e)));
                        let _ = resp.send(res);
                    }
                    Command::Close(resp) => {
                        closed = true;
                        let res = tab
                            .close(true)
                            .map(|_| ())
                            .map_err(|e| Error::CdpError(format!("Failed to close tab: {}", e)));
                        let _ = resp.send(res);
                        break;
                    }
                }
            }

            // Every handle dropped without an explicit close.
            if !closed {
                if let Err(e) = tab.close(true) {
                    warn!(target: "boardshot::cdp", "closing abandoned tab failed: {}", e);
                }
            }
        });

        Self { cmd_tx }
    }

    async fn request<T>(&self, what: &str, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| Error::Other(format!("{} failed: page worker has exited", what)))?;
        rx.await
            .map_err(|e| Error::Other(format!("{} canceled: {}", what, e)))?
    }
}

/// Navigate and report the status of the response that produced the final
/// document URL.
fn navigate(tab: &Arc<Tab>, url: &str) -> Result<u16> {
    let statuses: Arc<Mutex<HashMap<String, u16>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&statuses);
    tab.register_response_handling(
        STATUS_HANDLER,
        Box::new(move |params: ResponseReceivedEventParams, _body: &dyn Fn() -> anyhow::Result<GetResponseBodyReturnObject>| {
            sink.lock()
                .insert(params.response.url.clone(), params.response.status as u16);
        }),
    )
    .map_err(|e| Error::NavigationError(format!("Failed to observe responses: {}", e)))?;

    let navigated = tab
        .navigate_to(url)
        .and_then(|tab| tab.wait_until_navigated())
        .map(|_| ());

    if let Err(e) = tab.deregister_response_handling(STATUS_HANDLER) {
        warn!(target: "boardshot::cdp", "failed to drop response handler: {}", e);
    }
    navigated.map_err(|e| Error::NavigationError(format!("{}: {}", url, e)))?;

    let final_url = tab.get_url();
    let recorded = statuses.lock();
    recorded
        .get(&final_url)
        .or_else(|| recorded.get(url))
        .copied()
        .ok_or_else(|| Error::NavigationError(format!("no document response recorded for {}", final_url)))
}

/// Only an expired wait is a readiness timeout; a dead tab or connection is
/// reported as a CDP failure.
fn readiness_error(selector: &str, timeout: Duration, err: anyhow::Error) -> Error {
    if err.downcast_ref::<Timeout>().is_some() {
        debug!(target: "boardshot::cdp", "{} not ready after {:?}", selector, timeout);
        Error::ReadinessTimeout {
            selector: selector.to_string(),
            timeout,
        }
    } else {
        Error::CdpError(format!("waiting for {} failed: {}", selector, err))
    }
}

#[async_trait]
impl PageHandle for CdpPage {
    async fn navigate(&self, url: &str) -> Result<u16> {
        let url = url.to_string();
        self.request("Navigate", |tx| Command::Navigate(url, tx)).await
    }

    async fn wait_for_ready(&self, selector: &str, timeout: Duration) -> Result<()> {
        let selector = selector.to_string();
        self.request("WaitFor", |tx| Command::WaitFor(selector, timeout, tx)).await
    }

    async fn capture_region(&self, selector: &str) -> Result<Vec<u8>> {
        let selector = selector.to_string();
        self.request("CaptureRegion", |tx| Command::CaptureRegion(selector, tx)).await
    }

    async fn capture_page(&self) -> Result<Vec<u8>> {
        self.request("CapturePage", Command::CapturePage).await
    }

    async fn close(&self) -> Result<()> {
        self.request("Close", Command::Close).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_wait_is_a_readiness_timeout() {
        let err = readiness_error(".real-time-departures", Duration::from_secs(2), anyhow::Error::new(Timeout));
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
        assert!(err.to_string().starts_with("timeout waiting for element"));
    }

    #[test]
    fn broken_connection_is_not_a_readiness_timeout() {
        let err = readiness_error(
            ".real-time-departures",
            Duration::from_secs(2),
            anyhow::anyhow!("Unable to make method calls because underlying connection is closed"),
        );
        assert!(matches!(err, Error::CdpError(ref msg) if msg.contains("connection is closed")));
    }

    #[test]
    fn test_cdp_source_launch() {
        // This test requires Chrome to be installed, so we skip it in CI
        if std::env::var("CI").is_ok() {
            return;
        }
        if let Err(e) = CdpSource::launch(Viewport::default()) {
            eprintln!("Skipping CDP launch test because Chrome is not available or failed to launch: {}", e);
        }
    }
}
