//! ChannelRpcBridge - single-shot request/response over a node process
//!
//! `invoke` spawns the node, then races three things:
//! - the first chunk on the request's data channel (the response)
//! - the first structured error on `process:error`
//! - an optional client-side timer
//!
//! Whichever fires first settles the attempt and both listeners are dropped
//! on the spot. A timeout gets one retry (a fresh spawn) when allowed; every
//! other failure becomes a user notification and a `None` result. The timer
//! never kills the process it was waiting on.

use std::sync::Arc;
use std::time::Duration;

use shared_types::{ChannelMessage, Notification, ProcessErrorPayload, CHANNEL_NOTIFICATION, CHANNEL_PROCESS_ERROR};
use tracing::{debug, info, warn};

use crate::channel::{ChannelHub, Subscription};
use crate::supervisor::{ProcessSupervisor, SupervisorError};

/// Retries granted to a request that allows them.
const MAX_TIMEOUT_RETRIES: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Timeout")]
    Timeout(Duration),

    #[error("{}", .0.message)]
    Process(ProcessErrorPayload),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Where user-facing failures go.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Publishes notifications on [`CHANNEL_NOTIFICATION`] for the UI.
pub struct ChannelNotifier {
    hub: ChannelHub,
}

impl ChannelNotifier {
    pub fn new(hub: ChannelHub) -> Self {
        Self { hub }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        warn!(context = ?notification.context, message = %notification.message, "user notification");
        self.hub
            .publish(CHANNEL_NOTIFICATION, ChannelMessage::Notification(notification));
    }
}

/// One request: which channel carries the answer, how to run the node, and
/// how patient to be.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub channel: String,
    pub args: Vec<String>,
    pub error_context: Option<String>,
    /// Zero waits forever.
    pub timeout: Duration,
    pub retry_allowed: bool,
}

impl BridgeRequest {
    pub fn new<I, S>(channel: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channel: channel.into(),
            args: args.into_iter().map(Into::into).collect(),
            error_context: None,
            timeout: Duration::ZERO,
            retry_allowed: true,
        }
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.error_context = Some(context.into());
        self
    }

    pub fn timeout_ms(mut self, millis: u64) -> Self {
        self.timeout = Duration::from_millis(millis);
        self
    }

    pub fn retry(mut self, allowed: bool) -> Self {
        self.retry_allowed = allowed;
        self
    }
}

enum InvokeState {
    Waiting,
    Retrying,
    Resolved(String),
    Failed(BridgeError),
}

#[derive(Clone)]
pub struct ChannelRpcBridge {
    supervisor: ProcessSupervisor,
    notifier: Arc<dyn Notifier>,
}

impl ChannelRpcBridge {
    pub fn new(supervisor: ProcessSupervisor, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            supervisor,
            notifier,
        }
    }

    /// Bridge that reports failures on the UI notification channel.
    pub fn with_channel_notifier(supervisor: ProcessSupervisor) -> Self {
        let notifier = Arc::new(ChannelNotifier::new(supervisor.hub().clone()));
        Self::new(supervisor, notifier)
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }

    /// Run the request to completion.
    ///
    /// `Ok(Some(payload))` on a response, `Ok(None)` after a failure that was
    /// already shown to the user, `Err` only when the node could not be
    /// spawned at all.
    pub async fn invoke(&self, request: &BridgeRequest) -> Result<Option<String>, BridgeError> {
        let retries = if request.retry_allowed {
            MAX_TIMEOUT_RETRIES
        } else {
            0
        };
        let mut retries_used = 0u8;
        let mut state = InvokeState::Waiting;

        loop {
            state = match state {
                InvokeState::Waiting => match self.attempt(request).await {
                    Ok(payload) => InvokeState::Resolved(payload),
                    Err(BridgeError::Timeout(after)) if retries_used < retries => {
                        retries_used += 1;
                        debug!(channel = %request.channel, ?after, "Timeout, retrying");
                        InvokeState::Retrying
                    }
                    Err(BridgeError::Supervisor(e)) => return Err(BridgeError::Supervisor(e)),
                    Err(e) => InvokeState::Failed(e),
                },
                InvokeState::Retrying => InvokeState::Waiting,
                InvokeState::Resolved(payload) => return Ok(Some(payload)),
                InvokeState::Failed(err) => {
                    self.notifier.notify(Notification::error(
                        request.error_context.as_deref(),
                        err.to_string(),
                    ));
                    return Ok(None);
                }
            };
        }
    }

    async fn attempt(&self, request: &BridgeRequest) -> Result<String, BridgeError> {
        let hub = self.supervisor.hub();
        // Listen before spawning so a fast process cannot answer into the void.
        let mut data = hub.subscribe(&request.channel);
        let mut errors = hub.subscribe(CHANNEL_PROCESS_ERROR);

        let running = self
            .supervisor
            .spawn(&request.channel, &request.args)
            .await?;
        let pid = running.pid();
        let channel = request.channel.clone();
        tokio::spawn(async move {
            match running.wait().await {
                Ok(exit) => debug!(pid, %channel, ?exit, "invoked process finished"),
                Err(e) => warn!(pid, %channel, "invoked process failed: {e}"),
            }
        });

        let timeout = request.timeout;
        let timer = async move {
            if timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };

        let outcome = tokio::select! {
            bytes = first_payload(&mut data) => {
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            payload = first_error(&mut errors) => Err(BridgeError::Process(payload)),
            _ = timer => Err(BridgeError::Timeout(timeout)),
        };
        data.unsubscribe();
        errors.unsubscribe();

        match &outcome {
            Ok(payload) => info!(pid, channel = %request.channel, bytes = payload.len(), "invoke resolved"),
            Err(e) => debug!(pid, channel = %request.channel, "invoke attempt failed: {e}"),
        }
        outcome
    }
}

async fn first_payload(sub: &mut Subscription) -> Vec<u8> {
    while let Some(message) = sub.recv().await {
        if let ChannelMessage::Data { bytes } = message {
            return bytes;
        }
    }
    std::future::pending().await
}

async fn first_error(sub: &mut Subscription) -> ProcessErrorPayload {
    while let Some(message) = sub.recv().await {
        if let ChannelMessage::Error(payload) = message {
            return payload;
        }
    }
    std::future::pending().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{install_fake_node, test_config, RecordingNotifier};
    use std::time::Instant;

    fn bridge(dir: &std::path::Path) -> (ChannelRpcBridge, Arc<RecordingNotifier>) {
        let config = test_config(dir);
        install_fake_node(&config);
        let supervisor = ProcessSupervisor::new(&config, ChannelHub::new());
        let notifier = Arc::new(RecordingNotifier::default());
        (ChannelRpcBridge::new(supervisor, notifier.clone()), notifier)
    }

    #[tokio::test]
    async fn test_first_chunk_resolves_invoke() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, notifier) = bridge(dir.path());
        let mut errors = bridge.supervisor().hub().subscribe(CHANNEL_PROCESS_ERROR);

        let payload = bridge
            .invoke(&BridgeRequest::new("data", ["ready"]))
            .await
            .unwrap();
        assert_eq!(payload.as_deref(), Some("ready\n"));
        assert!(errors.try_recv().is_none());
        assert!(notifier.all().is_empty());

        // Listeners are gone once the invoke settled.
        assert_eq!(bridge.supervisor().hub().listener_count("data"), 0);
        assert_eq!(bridge.supervisor().hub().listener_count(CHANNEL_PROCESS_ERROR), 1);
        bridge.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_retries_once_then_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, notifier) = bridge(dir.path());

        let started = Instant::now();
        let payload = bridge
            .invoke(
                &BridgeRequest::new("node:auth", ["silent"])
                    .context("authorization")
                    .timeout_ms(100),
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(payload.is_none());
        assert!(elapsed >= Duration::from_millis(200), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");

        let notes = notifier.all();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].context.as_deref(), Some("authorization"));
        assert_eq!(notes[0].message, "Timeout");

        // The original attempt and its retry are both still running.
        assert_eq!(bridge.supervisor().running_pids().await.len(), 2);
        assert_eq!(bridge.supervisor().hub().listener_count("node:auth"), 0);
        bridge.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_without_retry_fails_once() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, notifier) = bridge(dir.path());

        let started = Instant::now();
        let payload = bridge
            .invoke(&BridgeRequest::new("node:rpc", ["silent"]).timeout_ms(100).retry(false))
            .await
            .unwrap();
        assert!(payload.is_none());
        assert!(started.elapsed() < Duration::from_millis(200 + 150));
        assert_eq!(notifier.all().len(), 1);
        assert_eq!(bridge.supervisor().running_pids().await.len(), 1);
        bridge.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_process_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, notifier) = bridge(dir.path());

        let payload = bridge
            .invoke(
                &BridgeRequest::new("node:init", ["fail"])
                    .context("initialization")
                    .timeout_ms(5_000),
            )
            .await
            .unwrap();
        assert!(payload.is_none());

        let notes = notifier.all();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message, "boom");
        assert_eq!(notes[0].text(), "Error occurred during initialization: boom");
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error_not_a_notification() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let supervisor = ProcessSupervisor::new(&config, ChannelHub::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let bridge = ChannelRpcBridge::new(supervisor, notifier.clone());

        let err = bridge
            .invoke(&BridgeRequest::new("data", ["ready"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Supervisor(SupervisorError::BinaryMissing(_))
        ));
        assert!(notifier.all().is_empty());
        assert_eq!(bridge.supervisor().hub().listener_count("data"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_invokes_do_not_cross_deliver() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, notifier) = bridge(dir.path());

        for _ in 0..5 {
            let a = BridgeRequest::new("channel:a", ["echo", "payload-a"]).timeout_ms(5_000);
            let b = BridgeRequest::new("channel:b", ["echo", "payload-b"]).timeout_ms(5_000);
            let (ra, rb) = tokio::join!(bridge.invoke(&a), bridge.invoke(&b));
            assert_eq!(ra.unwrap().as_deref(), Some("payload-a"));
            assert_eq!(rb.unwrap().as_deref(), Some("payload-b"));
        }
        assert!(notifier.all().is_empty());
    }

    #[tokio::test]
    async fn test_channel_notifier_publishes_for_ui() {
        let hub = ChannelHub::new();
        let mut notes = hub.subscribe(CHANNEL_NOTIFICATION);
        ChannelNotifier::new(hub.clone()).notify(Notification::error(Some("download"), "offline"));

        match notes.try_recv() {
            Some(ChannelMessage::Notification(n)) => {
                assert_eq!(n.text(), "Error occurred during download: offline")
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }
}
