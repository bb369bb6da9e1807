use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::command::Command;
use crate::types::ResourceKey;

/// Pause after the first ready command so concurrently ready ones join the
/// same batch.
pub const BATCH_LINGER: Duration = Duration::from_secs(1);

/// Consumer of debounced command batches. Batches are delivered one at a
/// time; the next batch is not formed until `process` returns.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn process(&self, batch: Vec<Command>);
}

struct Pending {
    command: Command,
    seq: u64,
    timer: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<ResourceKey, Pending>>>;

fn lock(map: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, Pending>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-key debounce timers feeding a FIFO drained by a single worker.
pub struct CommandQueue {
    debounce: Duration,
    linger: Duration,
    pending: PendingMap,
    seq: AtomicU64,
    ready_tx: mpsc::UnboundedSender<Command>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    pub fn new(debounce: Duration) -> Self {
        Self::with_linger(debounce, BATCH_LINGER)
    }

    pub fn with_linger(debounce: Duration, linger: Duration) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            debounce,
            linger,
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
            ready_tx,
            ready_rx: Mutex::new(Some(ready_rx)),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the batch worker. A second call is a no-op.
    pub fn start(&self, handler: Arc<dyn BatchHandler>) {
        let Some(mut rx) = self.ready_rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let linger = self.linger;
        let handle = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                tokio::time::sleep(linger).await;
                let mut batch = vec![first];
                while let Ok(cmd) = rx.try_recv() {
                    batch.push(cmd);
                }
                debug!(size = batch.len(), "processing command batch");
                handler.process(batch).await;
            }
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Schedules `command` after the debounce delay, replacing any command
    /// still waiting under the same key. The replaced command's rollback
    /// context is kept since it predates the new one.
    pub fn enqueue(&self, mut command: Command) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = command.key.clone();
        let mut pending = lock(&self.pending);

        if let Some(prev) = pending.remove(&key) {
            trace!(key = %key, "replacing pending command");
            prev.timer.abort();
            if prev.command.rollback.is_some() {
                command.rollback = prev.command.rollback;
            }
        }

        let map = Arc::clone(&self.pending);
        let tx = self.ready_tx.clone();
        let delay = self.debounce;
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let ready = {
                let mut pending = lock(&map);
                match pending.get(&timer_key) {
                    Some(p) if p.seq == seq => pending.remove(&timer_key).map(|p| p.command),
                    _ => None,
                }
            };
            if let Some(cmd) = ready {
                trace!(key = %timer_key, "debounce elapsed, command ready");
                let _ = tx.send(cmd);
            }
        });

        debug!(key = %key, delay_ms = delay.as_millis() as u64, "command queued");
        pending.insert(
            key,
            Pending {
                command,
                seq,
                timer,
            },
        );
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn pending_command(&self, key: &ResourceKey) -> Option<Command> {
        lock(&self.pending).get(key).map(|p| p.command.clone())
    }

    /// Keys whose debounce timer has not fired yet.
    pub fn pending_keys(&self) -> HashSet<ResourceKey> {
        lock(&self.pending).keys().cloned().collect()
    }

    /// Cancels every pending timer and stops the worker. Pending commands
    /// are dropped.
    pub fn shutdown(&self) {
        let drained: Vec<Pending> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "dropping pending commands on shutdown");
        }
        for p in drained {
            p.timer.abort();
        }
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::state::Rollback;
    use crate::types::Presence;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<(Instant, Vec<Command>)>>,
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        async fn process(&self, batch: Vec<Command>) {
            self.batches.lock().unwrap().push((Instant::now(), batch));
        }
    }

    fn offset(serial: &str, v: f64) -> Command {
        Command::new(CommandKind::SetOffset {
            serial: serial.into(),
            offset: v,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_writes_collapse_to_last() {
        let debounce = Duration::from_secs(10);
        let queue = CommandQueue::with_linger(debounce, Duration::ZERO);
        let recorder = Arc::new(Recorder::default());
        queue.start(recorder.clone());

        let t0 = Instant::now();
        queue.enqueue(offset("VA1", 1.0));
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.enqueue(offset("VA1", 2.0));
        tokio::time::sleep(Duration::from_secs(4)).await;
        queue.enqueue(offset("VA1", 3.0));
        assert_eq!(queue.pending_len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let (at, batch) = &batches[0];
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0].kind,
            CommandKind::SetOffset {
                serial: "VA1".into(),
                offset: 3.0
            }
        );
        assert!(*at >= t0 + Duration::from_secs(5) + debounce);
    }

    #[tokio::test(start_paused = true)]
    async fn linger_drains_concurrently_ready_commands() {
        let queue = CommandQueue::with_linger(Duration::from_secs(2), Duration::from_secs(1));
        let recorder = Arc::new(Recorder::default());
        queue.start(recorder.clone());

        queue.enqueue(offset("VA1", 1.0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.enqueue(offset("VA2", 1.0));
        queue.enqueue(Command::new(CommandKind::SetPresence(Presence::Away)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_form_separate_batches() {
        let queue = CommandQueue::with_linger(Duration::from_secs(2), Duration::from_secs(1));
        let recorder = Arc::new(Recorder::default());
        queue.start(recorder.clone());

        queue.enqueue(offset("VA1", 1.0));
        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.enqueue(offset("VA1", 2.0));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(recorder.batches.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_keeps_oldest_rollback() {
        let queue = CommandQueue::new(Duration::from_secs(5));
        let first = Rollback::Offset {
            serial: "VA1".into(),
            prior: Some(0.0),
        };
        queue.enqueue(offset("VA1", 1.0).rollback(first.clone()));
        queue.enqueue(offset("VA1", 2.0).rollback(Rollback::Offset {
            serial: "VA1".into(),
            prior: Some(1.0),
        }));
        let pending = queue
            .pending_command(&ResourceKey::Offset("VA1".into()))
            .unwrap();
        assert_eq!(pending.rollback, Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let queue = CommandQueue::new(Duration::from_secs(5));
        let recorder = Arc::new(Recorder::default());
        queue.start(recorder.clone());

        queue.enqueue(offset("VA1", 1.0));
        queue.enqueue(offset("VA2", 1.0));
        queue.shutdown();
        assert_eq!(queue.pending_len(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recorder.batches.lock().unwrap().is_empty());
    }
}
