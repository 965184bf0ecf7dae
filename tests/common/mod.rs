#![allow(dead_code)]

use async_trait::async_trait;
use boardshot::retry::Sleeper;
use boardshot::transform::TransformRunner;
use boardshot::{Error, GroupConfig, GroupKind, PageHandle, Result, SlotConfig, TargetSource};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Script {
    /// Statuses returned by upcoming navigations, per URL; 200 once drained
    queued: HashMap<String, VecDeque<u16>>,
    /// URLs that answer with this status forever
    always: HashMap<String, u16>,
    /// Selectors that never become ready
    stuck: HashSet<String>,
}

/// Everything the fake pages report back to the test.
#[derive(Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub navigations: AtomicUsize,
    pub closes: AtomicUsize,
}

/// In-memory page source with scripted navigation statuses.
#[derive(Clone, Default)]
pub struct FakeSource {
    script: Arc<Mutex<Script>>,
    pub counters: Arc<Counters>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, url: &str, statuses: &[u16]) {
        self.script
            .lock()
            .queued
            .entry(url.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    pub fn always(&self, url: &str, status: u16) {
        self.script.lock().always.insert(url.to_string(), status);
    }

    pub fn heal(&self, url: &str) {
        let mut script = self.script.lock();
        script.always.remove(url);
        script.queued.remove(url);
    }

    pub fn never_ready(&self, selector: &str) {
        self.script.lock().stuck.insert(selector.to_string());
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetSource for FakeSource {
    async fn open(&self) -> Result<Box<dyn PageHandle>> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            script: Arc::clone(&self.script),
            counters: Arc::clone(&self.counters),
            url: Mutex::new(None),
        }))
    }
}

pub struct FakePage {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    url: Mutex<Option<String>>,
}

#[async_trait]
impl PageHandle for FakePage {
    async fn navigate(&self, url: &str) -> Result<u16> {
        self.counters.navigations.fetch_add(1, Ordering::SeqCst);
        *self.url.lock() = Some(url.to_string());
        tokio::task::yield_now().await;
        let mut script = self.script.lock();
        if let Some(status) = script.always.get(url) {
            return Ok(*status);
        }
        Ok(script
            .queued
            .get_mut(url)
            .and_then(|q| q.pop_front())
            .unwrap_or(200))
    }

    async fn wait_for_ready(&self, selector: &str, timeout: Duration) -> Result<()> {
        if self.script.lock().stuck.contains(selector) {
            return Err(Error::ReadinessTimeout {
                selector: selector.to_string(),
                timeout,
            });
        }
        Ok(())
    }

    async fn capture_region(&self, selector: &str) -> Result<Vec<u8>> {
        let url = self.url.lock().clone().unwrap_or_default();
        Ok(format!("{}#{}", url, selector).into_bytes())
    }

    async fn capture_page(&self) -> Result<Vec<u8>> {
        let url = self.url.lock().clone().unwrap_or_default();
        Ok(format!("page:{}", url).into_bytes())
    }

    async fn close(&self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sleeper that records the requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().push(duration);
    }
}

/// Transform runner that writes `program arg..` into the output path (the
/// last argument) instead of running anything.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    fail_at: Option<usize>,
}

impl RecordingRunner {
    pub fn failing_at(step: usize) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_at: Some(step),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TransformRunner for RecordingRunner {
    async fn run_transform(&self, program: &str, args: &[String]) -> Result<()> {
        let step = {
            let mut calls = self.calls.lock();
            calls.push((program.to_string(), args.to_vec()));
            calls.len() - 1
        };
        if self.fail_at == Some(step) {
            return Err(Error::TransformFailure {
                transform: program.to_string(),
                exit: boardshot::error::ExitInfo::Code {
                    code: 1,
                    stderr: "unable to open image".to_string(),
                },
            });
        }
        let output = args.last().cloned().unwrap_or_default();
        tokio::fs::write(&output, format!("{} {}", program, args.join(" "))).await?;
        Ok(())
    }
}

pub fn slot(id: &str) -> SlotConfig {
    SlotConfig {
        id: id.to_string(),
        url: format!("https://boards.test/{}", id),
        selector: ".real-time-departures".to_string(),
    }
}

pub fn group(name: &str, kind: GroupKind, ids: &[&str]) -> GroupConfig {
    GroupConfig {
        name: name.to_string(),
        kind,
        refresh_interval: None,
        slots: ids.iter().map(|id| slot(id)).collect(),
    }
}

pub fn url_of(id: &str) -> String {
    format!("https://boards.test/{}", id)
}

/// Poll `check` until it holds or the iteration budget runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
