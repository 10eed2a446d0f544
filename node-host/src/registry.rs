use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use tokio::sync::{mpsc, Mutex};

static NEXT_SPAWN: AtomicU64 = AtomicU64::new(1);

/// Registry-side half of one live node process.
///
/// The child itself is owned by its supervision task; the registry keeps the
/// kill control so `kill(pid)` can reach the process from anywhere.
pub struct ProcessHandle {
    pub pid: u32,
    pub channel: String,
    pub args: Vec<String>,
    pub started_at: Instant,
    /// Distinguishes this process from a later one reusing the same pid.
    pub spawn_seq: u64,
    kill_tx: mpsc::UnboundedSender<()>,
}

/// Supervision-side half: receives kill requests for one process.
pub struct KillSignal {
    rx: mpsc::UnboundedReceiver<()>,
}

impl KillSignal {
    /// Resolves on the next kill request; `None` once the registry side is gone.
    pub async fn requested(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

impl ProcessHandle {
    pub fn new(pid: u32, channel: &str, args: &[String]) -> (Self, KillSignal) {
        let (kill_tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pid,
                channel: channel.to_string(),
                args: args.to_vec(),
                started_at: Instant::now(),
                spawn_seq: NEXT_SPAWN.fetch_add(1, Ordering::Relaxed),
                kill_tx,
            },
            KillSignal { rx },
        )
    }
}

/// pid → live process table.
///
/// An entry exists from spawn until the supervision task observes the exit;
/// only that task removes it.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<u32, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: ProcessHandle) {
        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.insert(handle.pid, handle) {
            // The OS only reuses a pid after exit, so a stale entry means a
            // missed exit; its supervision task will no longer find it.
            tracing::warn!(pid = previous.pid, "replaced stale registry entry");
        }
    }

    /// Remove the entry for `pid` if it still belongs to spawn `spawn_seq`.
    /// Returns the handle the first time, `None` afterwards.
    pub async fn remove(&self, pid: u32, spawn_seq: u64) -> Option<ProcessHandle> {
        let mut entries = self.entries.lock().await;
        match entries.get(&pid) {
            Some(handle) if handle.spawn_seq == spawn_seq => entries.remove(&pid),
            Some(_) => {
                tracing::debug!(pid, "registry entry belongs to a newer process; kept");
                None
            }
            None => None,
        }
    }

    pub async fn contains(&self, pid: u32) -> bool {
        self.entries.lock().await.contains_key(&pid)
    }

    /// Ask the process to be force-killed. False if `pid` is not registered.
    /// Does not wait for the exit.
    pub async fn request_kill(&self, pid: u32) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(&pid) {
            Some(handle) => {
                // A closed receiver means the exit is already being handled.
                let _ = handle.kill_tx.send(());
                true
            }
            None => false,
        }
    }

    pub async fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.entries.lock().await.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Snapshot of all live processes for the status endpoint.
    pub async fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let entries = self.entries.lock().await;
        let mut out: Vec<ProcessSnapshot> = entries
            .values()
            .map(|handle| ProcessSnapshot {
                pid: handle.pid,
                channel: handle.channel.clone(),
                args: handle.args.clone(),
                uptime_secs: handle.started_at.elapsed().as_secs(),
            })
            .collect();
        out.sort_by_key(|s| s.pid);
        out
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub channel: String,
    pub args: Vec<String>,
    pub uptime_secs: u64,
}
