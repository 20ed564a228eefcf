//! Periodic tick tasks.
//!
//! A `PeriodicTask` runs a tick closure on its own thread at a fixed
//! interval. Ticks run one at a time: if a tick overruns, the deadlines it
//! covered are skipped instead of queued, so there is never more than one
//! tick in flight per task.
//!
//! `stop()` (and `Drop`) signal the thread and join it. A tick already
//! running when stop is requested finishes; no tick starts after the stop
//! signal, and none is running once `stop()` returns.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;

/// Counters reported when a task is stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Ticks that ran.
    pub ticks: u64,
    /// Deadlines dropped because the previous tick was still running.
    pub skipped: u64,
}

pub struct PeriodicTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<TaskStats>>,
}

impl PeriodicTask {
    /// Start ticking. The first tick fires one `interval` after spawn.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> anyhow::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut stats = TaskStats::default();
                let mut deadline = Instant::now() + interval;
                loop {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    tick();
                    stats.ticks += 1;

                    deadline += interval;
                    let now = Instant::now();
                    while deadline <= now {
                        deadline += interval;
                        stats.skipped += 1;
                    }
                }
                stats
            })
            .with_context(|| format!("spawn periodic task {}", name))?;

        log::debug!("periodic task {} started ({}ms)", name, interval.as_millis());
        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop ticking and wait for the thread to exit.
    pub fn stop(mut self) -> TaskStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> TaskStats {
        if let Some(tx) = self.stop_tx.take() {
            // the receiver may already be gone if the tick panicked
            let _ = tx.send(());
        }
        let stats = match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                log::error!("periodic task {} panicked", self.name);
                TaskStats::default()
            }),
            None => TaskStats::default(),
        };
        log::debug!(
            "periodic task {} stopped after {} ticks ({} skipped)",
            self.name,
            stats.ticks,
            stats.skipped
        );
        stats
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
