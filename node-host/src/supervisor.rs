//! ProcessSupervisor - spawns and watches node processes
//!
//! Every spawned process gets its own supervision task that owns the child,
//! so cleanup (registry removal, announcer shutdown, defensive kill) runs on
//! exit whether or not anybody awaits the completion.
//!
//! Channel traffic per process:
//! - stdout chunks → the caller's data channel, verbatim
//! - stderr chunks and stream failures → [`CHANNEL_PROCESS_ERROR`]
//! - pid → [`CHANNEL_PROCESS_PID`] at spawn and every announce interval

use std::{
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use shared_types::{
    ChannelMessage, ProcessErrorPayload, ProcessExit, CHANNEL_PROCESS_ERROR, CHANNEL_PROCESS_PID,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::channel::ChannelHub;
use crate::config::Config;
use crate::registry::{KillSignal, ProcessHandle, ProcessRegistry, ProcessSnapshot};

const READ_CHUNK: usize = 8 * 1024;
/// How long an exited process's pipes may keep delivering before the relays are cut.
const RELAY_DRAIN: Duration = Duration::from_secs(2);
#[cfg(unix)]
const SIGKILL: i32 = 9;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("node binary is not installed at {0}")]
    BinaryMissing(PathBuf),

    #[error("no running node process with pid {0}")]
    UnknownProcess(u32),

    #[error("failed to spawn node process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("node process {pid} exited abnormally (code {code:?}, signal {signal:?})")]
    AbnormalExit {
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("supervision task for process {pid} failed: {reason}")]
    Task { pid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct SupervisorInner {
    binary: PathBuf,
    home_dir: PathBuf,
    install_home: PathBuf,
    install_home_env_var: String,
    announce_interval: Duration,
    registry: ProcessRegistry,
    hub: ChannelHub,
}

/// Owns a [`ProcessRegistry`]; clones share it.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

/// A spawned node process. Dropping it detaches the completion; supervision
/// and cleanup continue in the background.
pub struct RunningProcess {
    pid: u32,
    completion: JoinHandle<Result<ProcessExit, SupervisorError>>,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Settles when the process exits. Ok for exit code 0 or a forced kill.
    pub async fn wait(self) -> Result<ProcessExit, SupervisorError> {
        let pid = self.pid;
        self.completion.await.map_err(|e| SupervisorError::Task {
            pid,
            reason: e.to_string(),
        })?
    }
}

impl ProcessSupervisor {
    pub fn new(config: &Config, hub: ChannelHub) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                binary: config.binary_path(),
                home_dir: config.home_dir.clone(),
                install_home: config.install_home.clone(),
                install_home_env_var: config.install_home_env_var.clone(),
                announce_interval: config.pid_announce_interval,
                registry: ProcessRegistry::new(),
                hub,
            }),
        }
    }

    pub fn hub(&self) -> &ChannelHub {
        &self.inner.hub
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    /// Spawn the node with `args`, relaying stdout to `channel`.
    pub async fn spawn(
        &self,
        channel: &str,
        args: &[String],
    ) -> Result<RunningProcess, SupervisorError> {
        let inner = &self.inner;
        if !inner.binary.is_file() {
            return Err(SupervisorError::BinaryMissing(inner.binary.clone()));
        }

        let mut child = Command::new(&inner.binary)
            .args(args)
            .env_clear()
            .env("HOME", &inner.home_dir)
            .env(&inner.install_home_env_var, &inner.install_home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(binary = %inner.binary.display(), ?args, "failed to spawn node: {e}");
                SupervisorError::Spawn(e)
            })?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn(std::io::Error::other(
                "process exited before reporting a pid",
            )));
        };

        let (handle, kill_signal) = ProcessHandle::new(pid, channel, args);
        let spawn_seq = handle.spawn_seq;
        inner.registry.insert(handle).await;
        info!(pid, channel, ?args, "node process spawned");

        inner
            .hub
            .publish(CHANNEL_PROCESS_PID, ChannelMessage::Pid { pid });
        let announcer = tokio::spawn(announce_pid(Arc::clone(inner), pid));

        let mut relays = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            relays.push(tokio::spawn(relay_stdout(
                inner.hub.clone(),
                channel.to_string(),
                pid,
                stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(tokio::spawn(relay_stderr(inner.hub.clone(), pid, stderr)));
        }

        let completion = tokio::spawn(supervise(
            Arc::clone(inner),
            pid,
            spawn_seq,
            child,
            kill_signal,
            announcer,
            relays,
        ));

        Ok(RunningProcess { pid, completion })
    }

    /// Spawn and wait for exit.
    pub async fn run(&self, channel: &str, args: &[String]) -> Result<ProcessExit, SupervisorError> {
        self.spawn(channel, args).await?.wait().await
    }

    /// Force-kill a registered process. Returns once the request is sent,
    /// not when the process has exited.
    pub async fn kill(&self, pid: u32) -> Result<u32, SupervisorError> {
        if self.inner.registry.request_kill(pid).await {
            info!(pid, "kill requested");
            Ok(pid)
        } else {
            warn!(pid, "kill requested for unknown process");
            Err(SupervisorError::UnknownProcess(pid))
        }
    }

    pub async fn running_pids(&self) -> Vec<u32> {
        self.inner.registry.pids().await
    }

    pub async fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.inner.registry.snapshot().await
    }

    /// Kill every registered process.
    pub async fn shutdown(&self) {
        for pid in self.inner.registry.pids().await {
            // Exits racing this loop are fine.
            let _ = self.kill(pid).await;
        }
    }
}

async fn supervise(
    inner: Arc<SupervisorInner>,
    pid: u32,
    spawn_seq: u64,
    mut child: Child,
    mut kill_signal: KillSignal,
    announcer: JoinHandle<()>,
    mut relays: Vec<JoinHandle<()>>,
) -> Result<ProcessExit, SupervisorError> {
    let mut killed = false;
    let mut kill_open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_signal.requested(), if kill_open => match request {
                Some(()) => {
                    if !killed {
                        debug!(pid, "sending forced kill");
                        if let Err(e) = child.start_kill() {
                            warn!(pid, "forced kill failed: {e}");
                        }
                    }
                    killed = true;
                }
                None => kill_open = false,
            },
        }
    };

    inner.registry.remove(pid, spawn_seq).await;
    announcer.abort();
    if !matches!(child.try_wait(), Ok(Some(_))) {
        // Only reachable when wait() itself failed; never leave an orphan.
        let _ = child.start_kill();
    }

    // A grandchild may still hold the pipes open.
    let drained = tokio::time::timeout(RELAY_DRAIN, join_all(relays.iter_mut())).await;
    if drained.is_err() {
        debug!(pid, "output relays still open after exit; cutting them");
        for relay in &relays {
            relay.abort();
        }
    }

    let status = status?;
    classify_exit(pid, status, killed)
}

fn classify_exit(pid: u32, status: ExitStatus, killed: bool) -> Result<ProcessExit, SupervisorError> {
    let code = status.code();
    let signal = exit_signal(&status);
    let forced = killed || is_forced_kill(signal);

    if status.success() || forced {
        info!(pid, ?code, ?signal, killed = forced, "node process exited");
        Ok(ProcessExit {
            pid,
            code,
            signal,
            killed: forced,
        })
    } else {
        warn!(pid, ?code, ?signal, "node process exited abnormally");
        Err(SupervisorError::AbnormalExit { pid, code, signal })
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn is_forced_kill(signal: Option<i32>) -> bool {
    signal == Some(SIGKILL)
}

#[cfg(not(unix))]
fn is_forced_kill(_signal: Option<i32>) -> bool {
    false
}

/// Re-publish the pid every interval while the process stays registered.
async fn announce_pid(inner: Arc<SupervisorInner>, pid: u32) {
    let mut interval = tokio::time::interval(inner.announce_interval);
    interval.tick().await; // first tick is immediate; the spawn already announced
    loop {
        interval.tick().await;
        if !inner.registry.contains(pid).await {
            break;
        }
        inner
            .hub
            .publish(CHANNEL_PROCESS_PID, ChannelMessage::Pid { pid });
    }
}

async fn relay_stdout<R>(hub: ChannelHub, channel: String, pid: u32, mut stdout: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                hub.publish(&channel, ChannelMessage::data(&buf[..n]));
            }
            Err(e) => {
                warn!(pid, %channel, "stdout read failed: {e}");
                hub.publish(
                    CHANNEL_PROCESS_ERROR,
                    ChannelMessage::Error(ProcessErrorPayload::new(
                        "StreamError",
                        format!("stdout of process {pid}: {e}"),
                    )),
                );
                break;
            }
        }
    }
    debug!(pid, %channel, "stdout closed");
}

async fn relay_stderr<R>(hub: ChannelHub, pid: u32, mut stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let message = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
                debug!(pid, %message, "node stderr");
                hub.publish(
                    CHANNEL_PROCESS_ERROR,
                    ChannelMessage::Error(ProcessErrorPayload::new("ProcessError", message)),
                );
            }
            Err(e) => {
                warn!(pid, "stderr read failed: {e}");
                hub.publish(
                    CHANNEL_PROCESS_ERROR,
                    ChannelMessage::Error(ProcessErrorPayload::new(
                        "StreamError",
                        format!("stderr of process {pid}: {e}"),
                    )),
                );
                break;
            }
        }
    }
    debug!(pid, "stderr closed");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{install_fake_node, test_config};
    use tokio::time::{timeout, Duration};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn supervisor(dir: &std::path::Path) -> ProcessSupervisor {
        let config = test_config(dir);
        install_fake_node(&config);
        ProcessSupervisor::new(&config, ChannelHub::new())
    }

    async fn next_pid(sub: &mut crate::channel::Subscription) -> u32 {
        loop {
            match timeout(Duration::from_secs(5), sub.recv()).await {
                Ok(Some(ChannelMessage::Pid { pid })) => return pid,
                Ok(Some(_)) => continue,
                other => panic!("no pid announcement: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_run_fails_when_binary_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let supervisor = ProcessSupervisor::new(&config, ChannelHub::new());

        let err = supervisor.run("node:data", &args(&["start"])).await.unwrap_err();
        assert!(matches!(err, SupervisorError::BinaryMissing(_)), "got {err:?}");
        assert!(supervisor.running_pids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stdout_is_forwarded_on_caller_channel() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let mut data = supervisor.hub().subscribe("data");
        let mut errors = supervisor.hub().subscribe(CHANNEL_PROCESS_ERROR);

        let running = supervisor.spawn("data", &args(&["ready"])).await.unwrap();
        let msg = timeout(Duration::from_secs(5), data.recv()).await.unwrap();
        assert_eq!(msg, Some(ChannelMessage::data("ready\n")));
        assert!(errors.try_recv().is_none());

        supervisor.kill(running.pid()).await.unwrap();
        running.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_then_kill_resolves_and_forgets_pid() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let mut pids = supervisor.hub().subscribe(CHANNEL_PROCESS_PID);

        let runner = supervisor.clone();
        let run = tokio::spawn(async move { runner.run("node:data", &args(&["silent"])).await });

        let pid = next_pid(&mut pids).await;
        assert_eq!(supervisor.kill(pid).await.unwrap(), pid);

        let exit = timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not settle after kill")
            .unwrap()
            .expect("kill must count as a clean exit");
        assert_eq!(exit.pid, pid);
        assert!(exit.killed);

        let err = supervisor.kill(pid).await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownProcess(p) if p == pid));
    }

    #[tokio::test]
    async fn test_nonzero_exit_rejects_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let mut errors = supervisor.hub().subscribe(CHANNEL_PROCESS_ERROR);

        let err = supervisor.run("node:data", &args(&["fail"])).await.unwrap_err();
        match err {
            SupervisorError::AbnormalExit { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("expected abnormal exit, got {other:?}"),
        }
        assert!(supervisor.running_pids().await.is_empty());

        match errors.try_recv() {
            Some(ChannelMessage::Error(payload)) => {
                assert_eq!(payload.name, "ProcessError");
                assert_eq!(payload.message, "boom");
            }
            other => panic!("expected stderr on error channel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_exit_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());

        let exit = supervisor.run("node:data", &args(&["exit0"])).await.unwrap();
        assert_eq!(exit.code, Some(0));
        assert!(!exit.killed);
        assert!(supervisor.running_pids().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_signal_is_abnormal() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());

        let err = supervisor.run("node:data", &args(&["term"])).await.unwrap_err();
        match err {
            SupervisorError::AbnormalExit { code, signal, .. } => {
                assert_eq!(code, None);
                assert_eq!(signal, Some(15));
            }
            other => panic!("expected abnormal exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pid_is_reannounced_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let mut pids = supervisor.hub().subscribe(CHANNEL_PROCESS_PID);

        let running = supervisor.spawn("node:data", &args(&["silent"])).await.unwrap();
        let first = next_pid(&mut pids).await;
        let second = next_pid(&mut pids).await;
        let third = next_pid(&mut pids).await;
        assert_eq!(first, running.pid());
        assert_eq!(second, first);
        assert_eq!(third, first);

        supervisor.kill(running.pid()).await.unwrap();
        running.wait().await.unwrap();

        // Announcements stop with the process.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while pids.try_recv().is_some() {}
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pids.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_environment_is_constrained() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        install_fake_node(&config);
        let supervisor = ProcessSupervisor::new(&config, ChannelHub::new());
        let mut data = supervisor.hub().subscribe("env");

        let running = supervisor.spawn("env", &args(&["env"])).await.unwrap();
        let Some(ChannelMessage::Data { bytes }) =
            timeout(Duration::from_secs(5), data.recv()).await.unwrap()
        else {
            panic!("no env output");
        };
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains(&format!("HOME={}", config.home_dir.display())), "{text}");
        assert!(
            text.contains(&format!("NODE_HOME={}", config.install_home.display())),
            "{text}"
        );
        assert!(text.contains("MANIFEST=unset"), "{text}");
        running.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_tracks_concurrent_processes() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());

        let a = supervisor.spawn("a", &args(&["silent"])).await.unwrap();
        let b = supervisor.spawn("b", &args(&["silent"])).await.unwrap();
        let mut expected = vec![a.pid(), b.pid()];
        expected.sort_unstable();
        assert_eq!(supervisor.running_pids().await, expected);

        supervisor.shutdown().await;
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        assert!(supervisor.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_held_pipes_delay_exit_by_one_drain_window() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());

        let started = std::time::Instant::now();
        let exit = supervisor.run("node:data", &args(&["orphan"])).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(exit.code, Some(0));
        assert!(elapsed >= RELAY_DRAIN, "relays were not drained: {elapsed:?}");
        assert!(
            elapsed < RELAY_DRAIN + Duration::from_millis(1500),
            "relays drained one after another: {elapsed:?}"
        );
        assert!(supervisor.running_pids().await.is_empty());
    }
}
