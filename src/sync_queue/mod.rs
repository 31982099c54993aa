//! Device-side offline queue.
//!
//! Submissions that could not be completed are appended to a durable local
//! table and replayed through a [`SubmissionSink`] strictly in enqueue order,
//! one at a time. An item is deleted only after the sink acknowledged it.
//! Any failure ends the cycle with the item untouched at the head, so
//! nothing behind it can overtake it. An item the server keeps refusing
//! stays there until an operator moves it aside with
//! [`SyncQueue::dead_letter_head`].
//!
//! [`SyncQueue::start`] runs the flush loop on its own task. It reacts to
//! explicit signals (timer ticks, connectivity changes, flush requests) and
//! never runs two flushes at once.

pub mod store;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::db::Pool;
use crate::submitter::{SubmissionSink, SubmitRequest};

pub use store::QueuedSubmission;

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Keys replayed and deleted, in order.
    pub persisted: Vec<i64>,
    /// Key whose failure ended the cycle; it is still at the head.
    pub stopped_at: Option<i64>,
    /// Why `stopped_at` failed.
    pub failure: Option<String>,
    /// The failure will not go away by retrying.
    pub blocked: bool,
    pub remaining: i64,
    /// Another flush was in progress, or the device is offline.
    pub skipped: bool,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Shared online/offline flag. The host flips it; the capture client reads
/// it and the flush loop receives every change as a signal.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Inputs of the flush loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    Tick,
    ConnectivityChanged(bool),
    FlushRequested,
}

enum Command {
    Flush(oneshot::Sender<FlushReport>),
    Shutdown,
}

#[derive(Clone)]
pub struct SyncQueue {
    pool: Pool,
    sink: Arc<dyn SubmissionSink>,
    interval: Duration,
    flushing: Arc<Mutex<()>>,
}

impl SyncQueue {
    pub fn new(pool: Pool, sink: Arc<dyn SubmissionSink>, interval: Duration) -> Self {
        Self {
            pool,
            sink,
            interval,
            flushing: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn enqueue(&self, req: &SubmitRequest) -> Result<i64> {
        let key = store::enqueue(&self.pool, req).await?;
        info!(key, user_id = %req.user_id, "submission queued for sync");
        Ok(key)
    }

    pub async fn pending(&self) -> Result<i64> {
        store::count(&self.pool).await
    }

    /// Replay queued items in order until the queue is empty or an item
    /// fails. Returns a skipped report if a flush is already running.
    #[instrument(skip_all)]
    pub async fn flush(&self) -> Result<FlushReport> {
        let Ok(_guard) = self.flushing.try_lock() else {
            debug!("flush already in progress");
            return Ok(FlushReport::skipped());
        };

        let mut report = FlushReport::default();
        while let Some(item) = store::peek_next(&self.pool).await? {
            let key = item.key;
            match self.sink.submit(item.to_request()).await {
                Ok(receipt) => {
                    if !store::delete(&self.pool, key).await? {
                        warn!(key, "synced item was already removed");
                    }
                    info!(
                        key,
                        log_id = receipt.log_id,
                        replayed = receipt.replayed,
                        "queued submission synced"
                    );
                    report.persisted.push(key);
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(key, error = %err, "queued submission failed; kept for next cycle");
                    } else {
                        warn!(
                            key,
                            error = %err,
                            "queued submission refused; it blocks the queue until dead-lettered"
                        );
                    }
                    report.stopped_at = Some(key);
                    report.failure = Some(err.to_string());
                    report.blocked = !err.is_retryable();
                    break;
                }
            }
        }
        report.remaining = store::count(&self.pool).await?;
        Ok(report)
    }

    /// Move the head item into `sync_rejected` with `reason`. Returns its
    /// key, or None when the queue is empty.
    #[instrument(skip_all)]
    pub async fn dead_letter_head(&self, reason: &str) -> Result<Option<i64>> {
        let _guard = self.flushing.lock().await;
        let Some(head) = store::peek_next(&self.pool).await? else {
            return Ok(None);
        };
        if !store::reject(&self.pool, head.key, reason).await? {
            return Err(anyhow!("queue item {} vanished while dead-lettering", head.key));
        }
        warn!(
            key = head.key,
            submission_id = %head.submission_id,
            user_id = %head.user_id,
            reason,
            "queued submission moved to sync_rejected"
        );
        Ok(Some(head.key))
    }

    /// Spawn the flush loop. It flushes immediately when online, then on
    /// every tick while online and whenever the device comes back online.
    /// Call [`SyncHandle::stop`] to tear it down.
    pub fn start(&self, network: &NetworkStatus) -> SyncHandle {
        let (commands, rx) = mpsc::channel(8);
        let runner = FlushLoop {
            queue: self.clone(),
            triggers: Triggers::new(self.interval),
        };
        let task = tokio::spawn(runner.run(rx, network.subscribe()));
        SyncHandle { commands, task }
    }
}

pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Ask the loop for a flush and wait for its report. Skipped while
    /// offline.
    pub async fn flush_now(&self) -> Result<FlushReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .await
            .map_err(|_| anyhow!("sync loop is not running"))?;
        rx.await.map_err(|_| anyhow!("sync loop stopped before replying"))
    }

    /// Stop the timer and connectivity listener and wait for the loop to
    /// finish any flush in progress.
    pub async fn stop(self) -> Result<()> {
        // The loop may already be gone; the join below reports that.
        let _ = self.commands.send(Command::Shutdown).await;
        self.task
            .await
            .map_err(|err| anyhow!("sync loop panicked: {}", err))
    }
}

/// Decides which signals lead to a flush.
#[derive(Debug, Clone)]
struct Triggers {
    online: bool,
    interval: Duration,
    /// Set after a failed cycle; connectivity flaps before this do not flush.
    quiet_until: Option<Instant>,
}

impl Triggers {
    fn new(interval: Duration) -> Self {
        Self {
            online: false,
            interval,
            quiet_until: None,
        }
    }

    fn should_flush(&mut self, signal: SyncSignal, now: Instant) -> bool {
        match signal {
            SyncSignal::Tick | SyncSignal::FlushRequested => self.online,
            SyncSignal::ConnectivityChanged(online) => {
                let came_online = online && !self.online;
                self.online = online;
                came_online && self.quiet_until.map_or(true, |until| now >= until)
            }
        }
    }

    fn record(&mut self, report: Option<&FlushReport>, now: Instant) {
        let failed = report.map_or(true, |r| r.stopped_at.is_some());
        self.quiet_until = failed.then(|| now + self.interval);
    }
}

struct FlushLoop {
    queue: SyncQueue,
    triggers: Triggers,
}

impl FlushLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut network: watch::Receiver<bool>,
    ) {
        let online = *network.borrow_and_update();
        info!(online, "sync loop started");
        if self
            .triggers
            .should_flush(SyncSignal::ConnectivityChanged(online), Instant::now())
        {
            self.flush("startup").await;
        }

        let period = self.triggers.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut network_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.triggers.should_flush(SyncSignal::Tick, Instant::now()) {
                        self.flush("tick").await;
                    }
                }
                changed = network.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        continue;
                    }
                    let online = *network.borrow_and_update();
                    debug!(online, "connectivity changed");
                    if self
                        .triggers
                        .should_flush(SyncSignal::ConnectivityChanged(online), Instant::now())
                    {
                        self.flush("back online").await;
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Flush(reply)) => {
                        let report = if self
                            .triggers
                            .should_flush(SyncSignal::FlushRequested, Instant::now())
                        {
                            self.flush("requested").await
                        } else {
                            FlushReport::skipped()
                        };
                        let _ = reply.send(report);
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }
        info!("sync loop stopped");
    }

    async fn flush(&mut self, trigger: &'static str) -> FlushReport {
        let result = self.queue.flush().await;
        let now = Instant::now();
        match result {
            Ok(report) => {
                self.triggers.record(Some(&report), now);
                if !report.persisted.is_empty() || report.stopped_at.is_some() {
                    info!(
                        trigger,
                        persisted = report.persisted.len(),
                        stopped_at = ?report.stopped_at,
                        remaining = report.remaining,
                        "flush finished"
                    );
                }
                report
            }
            Err(err) => {
                error!(?err, trigger, "flush failed");
                self.triggers.record(None, now);
                FlushReport::default()
            }
        }
    }
}
