//! Synthetic stages for exercising the graph and the controller

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Registry;
use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::stage::{Stage, StageContext, StageOptions, option_or};
use crate::pipeline::types::{Buffer, Timestamp};

/// Something a test stage did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    Started,
    /// The sink received buffer number `n` (as produced by `countsrc`)
    Buffer(u64),
    Finalized,
    Stopped,
}

/// Shared record of every test stage created by one registry
#[derive(Clone, Default)]
pub struct Journal {
    marks: Arc<Mutex<Vec<Mark>>>,
    live: Arc<AtomicUsize>,
}

impl Journal {
    fn push(&self, mark: Mark) {
        if let Ok(mut marks) = self.marks.lock() {
            marks.push(mark);
        }
    }

    pub fn marks(&self) -> Vec<Mark> {
        self.marks.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn count(&self, mark: &Mark) -> usize {
        self.marks().iter().filter(|m| *m == mark).count()
    }

    /// Buffers received by sinks
    pub fn buffers(&self) -> usize {
        self.marks()
            .iter()
            .filter(|m| matches!(m, Mark::Buffer(_)))
            .count()
    }

    /// Test stages currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn guard(&self) -> LiveGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        LiveGuard(Arc::clone(&self.live))
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn test_caps() -> Caps {
    Caps::builder("application/x-test").build()
}

/// Register `countsrc`, `identity`, `delay`, `failing` and `journalsink`.
/// Returns the journal they all write to.
pub fn register(registry: &mut Registry) -> Journal {
    let journal = Journal::default();

    let j = journal.clone();
    registry.register("countsrc", move |o| Ok(Box::new(CountSrc::new(&j, o)?)));
    let j = journal.clone();
    registry.register("identity", move |o| Ok(Box::new(Identity::new(&j, o)?)));
    let j = journal.clone();
    registry.register("delay", move |o| Ok(Box::new(Identity::new(&j, o)?)));
    let j = journal.clone();
    registry.register("failing", move |o| Ok(Box::new(Identity::new(&j, o)?)));
    let j = journal.clone();
    registry.register("journalsink", move |o| Ok(Box::new(JournalSink::new(&j, o)?)));

    journal
}

/// Counts upwards. `num-buffers` of 0 never ends; `interval-ms` paces it.
/// `silent` never produces anything, like a network source nobody sends to.
struct CountSrc {
    journal: Journal,
    _live: LiveGuard,
    limit: u64,
    interval: Duration,
    silent: bool,
    next: u64,
}

impl CountSrc {
    fn new(journal: &Journal, options: &StageOptions) -> Result<Self> {
        Ok(Self {
            journal: journal.clone(),
            _live: journal.guard(),
            limit: option_or(options, "num-buffers", 0)?,
            interval: Duration::from_millis(option_or(options, "interval-ms", 1)?),
            silent: option_or(options, "silent", false)?,
            next: 0,
        })
    }
}

#[async_trait]
impl Stage for CountSrc {
    fn pads(&self) -> Pads {
        Pads::source(test_caps())
    }

    async fn start(&mut self, _ctx: &StageContext) -> Result<()> {
        self.journal.push(Mark::Started);
        Ok(())
    }

    async fn pull(&mut self) -> Result<Option<Buffer>> {
        if self.silent {
            std::future::pending::<()>().await;
        }
        if self.limit > 0 && self.next >= self.limit {
            return Ok(None);
        }
        tokio::time::sleep(self.interval).await;
        let n = self.next;
        self.next += 1;
        Ok(Some(
            Buffer::new(n.to_le_bytes().to_vec(), Timestamp::from_micros(n as i64 * 1000))
                .with_keyframe(n == 0),
        ))
    }

    async fn stop(&mut self) -> Result<()> {
        self.journal.push(Mark::Stopped);
        Ok(())
    }
}

/// Pass-through filter, optionally slow (`delay-ms`) or broken
/// (`fail-after` buffers, `fail-start`)
struct Identity {
    journal: Journal,
    _live: LiveGuard,
    delay: Duration,
    fail_after: Option<u64>,
    fail_start: bool,
    seen: u64,
}

impl Identity {
    fn new(journal: &Journal, options: &StageOptions) -> Result<Self> {
        let fail_after = match options.get("fail-after") {
            Some(_) => Some(option_or(options, "fail-after", 0)?),
            None => None,
        };
        Ok(Self {
            journal: journal.clone(),
            _live: journal.guard(),
            delay: Duration::from_millis(option_or(options, "delay-ms", 0)?),
            fail_after,
            fail_start: option_or(options, "fail-start", false)?,
            seen: 0,
        })
    }
}

#[async_trait]
impl Stage for Identity {
    fn pads(&self) -> Pads {
        Pads::filter(test_caps(), test_caps())
    }

    async fn start(&mut self, _ctx: &StageContext) -> Result<()> {
        if self.fail_start {
            bail!("refusing to start");
        }
        self.journal.push(Mark::Started);
        Ok(())
    }

    async fn push(&mut self, buffer: Buffer) -> Result<Vec<Buffer>> {
        if self.fail_after.is_some_and(|limit| self.seen >= limit) {
            bail!("synthetic failure after {} buffers", self.seen);
        }
        self.seen += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(vec![buffer])
    }

    async fn stop(&mut self) -> Result<()> {
        self.journal.push(Mark::Stopped);
        Ok(())
    }
}

/// Records every buffer it receives and when it finalizes
struct JournalSink {
    journal: Journal,
    _live: LiveGuard,
    fail_start: bool,
}

impl JournalSink {
    fn new(journal: &Journal, options: &StageOptions) -> Result<Self> {
        Ok(Self {
            journal: journal.clone(),
            _live: journal.guard(),
            fail_start: option_or(options, "fail-start", false)?,
        })
    }
}

#[async_trait]
impl Stage for JournalSink {
    fn pads(&self) -> Pads {
        Pads::sink(Caps::any())
    }

    async fn start(&mut self, _ctx: &StageContext) -> Result<()> {
        if self.fail_start {
            bail!("sink unavailable");
        }
        self.journal.push(Mark::Started);
        Ok(())
    }

    async fn push(&mut self, buffer: Buffer) -> Result<Vec<Buffer>> {
        let mut raw = [0u8; 8];
        let len = buffer.data.len().min(8);
        raw[..len].copy_from_slice(&buffer.data[..len]);
        self.journal.push(Mark::Buffer(u64::from_le_bytes(raw)));
        Ok(Vec::new())
    }

    async fn finish(&mut self) -> Result<Vec<Buffer>> {
        self.journal.push(Mark::Finalized);
        Ok(Vec::new())
    }

    async fn stop(&mut self) -> Result<()> {
        self.journal.push(Mark::Stopped);
        Ok(())
    }
}
