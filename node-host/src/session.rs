//! NodeSession - the one light node the UI drives
//!
//! Tracks the selected network and [`NodeStatus`]; runs init, start, auth
//! and RPC queries through the bridge. The status goes back to `Stopped` on
//! its own when the running node exits.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use shared_types::{
    ChannelMessage, NetworkInfo, NodeInitialization, NodeStatus, Notification, CHANNEL_PROCESS_PID,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, BridgeRequest, ChannelRpcBridge};
use crate::channel::Subscription;
use crate::handlers::NodeLayout;
use crate::networks::{self, Network};
use crate::supervisor::SupervisorError;

pub const CHANNEL_INIT: &str = "node:init";
pub const CHANNEL_DATA: &str = "node:data";
pub const CHANNEL_AUTH: &str = "node:auth";

const AUTH_TIMEOUT_MS: u64 = 1_000;
const RPC_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {action} while node is {status}")]
    InvalidState {
        action: &'static str,
        status: &'static str,
    },

    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("node produced no response: {0}")]
    NoResponse(String),

    #[error("could not parse node output: {0}")]
    Parse(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub network: NetworkInfo,
    #[serde(flatten)]
    pub status: NodeStatus,
}

struct SessionState {
    network: &'static Network,
    status: NodeStatus,
    /// pid of the node started by this session, until it exits
    node_pid: Option<u32>,
}

#[derive(Clone)]
pub struct NodeSession {
    bridge: ChannelRpcBridge,
    layout: NodeLayout,
    state: Arc<Mutex<SessionState>>,
}

impl NodeSession {
    pub fn new(
        bridge: ChannelRpcBridge,
        layout: NodeLayout,
        network: &str,
    ) -> Result<Self, SessionError> {
        let network =
            networks::find(network).ok_or_else(|| SessionError::UnknownNetwork(network.to_string()))?;
        Ok(Self {
            bridge,
            layout,
            state: Arc::new(Mutex::new(SessionState {
                network,
                status: NodeStatus::Checking,
                node_pid: None,
            })),
        })
    }

    pub async fn status(&self) -> NodeStatus {
        self.state.lock().await.status.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            network: state.network.info(),
            status: state.status.clone(),
        }
    }

    /// Re-check the installation. A starting or running node is left alone.
    pub async fn refresh(&self) -> Result<NodeStatus, SessionError> {
        let mut state = self.state.lock().await;
        if matches!(state.status, NodeStatus::Starting | NodeStatus::Running { .. }) {
            return Ok(state.status.clone());
        }
        state.status = NodeStatus::Checking;
        let exists = self
            .layout
            .node_dir(state.network.id)
            .map(|dir| dir.is_dir())
            .unwrap_or(false);
        state.status = if exists {
            NodeStatus::Stopped
        } else {
            NodeStatus::Uninitialized
        };
        debug!(network = state.network.id, status = state.status.as_str(), "session refreshed");
        Ok(state.status.clone())
    }

    pub async fn select_network(&self, id: &str) -> Result<NodeStatus, SessionError> {
        let network = networks::find(id).ok_or_else(|| SessionError::UnknownNetwork(id.to_string()))?;
        {
            let mut state = self.state.lock().await;
            ensure_idle(&state.status, "switch network")?;
            state.network = network;
        }
        info!(network = id, "network selected");
        self.refresh().await
    }

    /// Create the node's keys. `None` when the node failed and the user was
    /// already notified.
    pub async fn initialize(&self) -> Result<Option<NodeInitialization>, SessionError> {
        let network = {
            let state = self.state.lock().await;
            if state.status != NodeStatus::Uninitialized {
                return Err(SessionError::InvalidState {
                    action: "initialize",
                    status: state.status.as_str(),
                });
            }
            state.network
        };

        let request = BridgeRequest::new(
            CHANNEL_INIT,
            ["light", "init", "--p2p.network", network.p2p_network],
        )
        .context("initialization");
        let Some(output) = self.bridge.invoke(&request).await? else {
            return Ok(None);
        };

        let init = parse_initialization(&output)?;
        info!(network = network.id, name = %init.name, address = %init.address, "node initialized");
        self.state.lock().await.status = NodeStatus::Stopped;
        Ok(Some(init))
    }

    /// Start the node and authorize against it.
    ///
    /// Resolves once the session is `Running`, or `Stopped` again when the
    /// auth token could not be obtained.
    pub async fn start(&self) -> Result<NodeStatus, SessionError> {
        let network = {
            let mut state = self.state.lock().await;
            if state.status != NodeStatus::Stopped {
                return Err(SessionError::InvalidState {
                    action: "start",
                    status: state.status.as_str(),
                });
            }
            state.status = NodeStatus::Starting;
            state.network
        };

        let hub = self.bridge.supervisor().hub();
        let mut pids = hub.subscribe(CHANNEL_PROCESS_PID);
        let mut data = hub.subscribe(CHANNEL_DATA);

        let args: Vec<String> = [
            "light",
            "start",
            "--core.ip",
            network.core_ip,
            "--p2p.network",
            network.p2p_network,
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let running = match self.bridge.supervisor().spawn(CHANNEL_DATA, &args).await {
            Ok(running) => running,
            Err(e) => {
                self.set_stopped(None).await;
                return Err(e.into());
            }
        };
        let spawned_pid = running.pid();
        self.state.lock().await.node_pid = Some(spawned_pid);

        let (exited_tx, mut exited) = oneshot::channel();
        let session = self.clone();
        tokio::spawn(async move {
            let outcome = running.wait().await;
            if let Err(e) = &outcome {
                warn!(pid = spawned_pid, "node stopped: {e}");
                session.bridge.notify(Notification::error(
                    Some("starting the node"),
                    e.to_string(),
                ));
            }
            session.set_stopped(Some(spawned_pid)).await;
            let _ = exited_tx.send(());
        });

        let pid = first_announced_pid(&mut pids, spawned_pid).await;
        pids.unsubscribe();
        debug!(pid, "node pid announced");

        tokio::select! {
            _ = first_chunk(&mut data) => {}
            _ = &mut exited => {
                return Err(SessionError::NoResponse(
                    "node exited before producing output".to_string(),
                ));
            }
        }
        data.unsubscribe();

        let request = BridgeRequest::new(
            CHANNEL_AUTH,
            ["light", "auth", "admin", "--p2p.network", network.p2p_network],
        )
        .context("authorization")
        .timeout_ms(AUTH_TIMEOUT_MS);
        let auth = match self.bridge.invoke(&request).await {
            Ok(auth) => auth,
            Err(e) => {
                warn!(pid, "authorization could not run; stopping node: {e}");
                self.abandon(pid).await;
                return Err(e.into());
            }
        };

        let mut state = self.state.lock().await;
        if state.node_pid != Some(pid) {
            // The node died while we were authorizing.
            return Ok(state.status.clone());
        }
        match auth.map(|token| token.trim().to_string()) {
            Some(auth) if !auth.is_empty() => {
                state.status = NodeStatus::Running { pid, auth };
                info!(pid, network = network.id, "node running");
            }
            _ => {
                warn!(pid, "no auth token; stopping node");
                drop(state);
                self.abandon(pid).await;
                return Ok(self.status().await);
            }
        }
        Ok(state.status.clone())
    }

    /// Kill the running node. The status flips to `Stopped` once it exits.
    pub async fn stop(&self) -> Result<u32, SessionError> {
        let pid = {
            let state = self.state.lock().await;
            state.node_pid.ok_or(SessionError::InvalidState {
                action: "stop",
                status: state.status.as_str(),
            })?
        };
        Ok(self.bridge.supervisor().kill(pid).await?)
    }

    /// Query the running node over its RPC CLI and return the `result` field.
    pub async fn rpc(
        &self,
        section: &str,
        method: &str,
        params: &[String],
        timeout_ms: Option<u64>,
    ) -> Result<Option<Value>, SessionError> {
        let auth = match &self.state.lock().await.status {
            NodeStatus::Running { auth, .. } => auth.clone(),
            other => {
                return Err(SessionError::InvalidState {
                    action: "query",
                    status: other.as_str(),
                })
            }
        };

        let mut args = vec!["rpc".to_string(), section.to_string(), method.to_string()];
        args.extend(params.iter().cloned());
        args.push("--auth".to_string());
        args.push(auth);

        let request = BridgeRequest::new(format!("node:{section}_{method}"), args)
            .context(format!("fetching {section} {method}"))
            .timeout_ms(timeout_ms.unwrap_or(RPC_TIMEOUT_MS))
            .retry(false);
        let Some(body) = self.bridge.invoke(&request).await? else {
            return Ok(None);
        };

        let mut json: Value =
            serde_json::from_str(&body).map_err(|e| SessionError::Parse(format!("{e}: {body}")))?;
        match json.get_mut("result") {
            Some(result) => Ok(Some(result.take())),
            None => Err(SessionError::Parse(format!("missing result: {body}"))),
        }
    }

    /// Kill a node this session can no longer drive and forget it.
    async fn abandon(&self, pid: u32) {
        // Already gone is fine.
        let _ = self.bridge.supervisor().kill(pid).await;
        self.set_stopped(Some(pid)).await;
    }

    /// Back to `Stopped`, unless `pid` no longer belongs to this session.
    async fn set_stopped(&self, pid: Option<u32>) {
        let mut state = self.state.lock().await;
        if pid.is_some() && state.node_pid != pid {
            return;
        }
        state.node_pid = None;
        if matches!(state.status, NodeStatus::Starting | NodeStatus::Running { .. }) {
            state.status = NodeStatus::Stopped;
            info!(network = state.network.id, "node stopped");
        }
    }
}

fn ensure_idle(status: &NodeStatus, action: &'static str) -> Result<(), SessionError> {
    match status {
        NodeStatus::Starting | NodeStatus::Running { .. } => Err(SessionError::InvalidState {
            action,
            status: status.as_str(),
        }),
        _ => Ok(()),
    }
}

/// Announcements repeat; the first one for our pid is all that matters.
async fn first_announced_pid(pids: &mut Subscription, expected: u32) -> u32 {
    while let Some(message) = pids.recv().await {
        if let ChannelMessage::Pid { pid } = message {
            if pid == expected {
                return pid;
            }
        }
    }
    expected
}

async fn first_chunk(data: &mut Subscription) {
    while let Some(message) = data.recv().await {
        if matches!(message, ChannelMessage::Data { .. }) {
            return;
        }
    }
    std::future::pending().await
}

/// Parse `init` output of the form
///
/// ```text
/// NAME: my_celes_key
/// ADDRESS: celestia1...
/// MNEMONIC (save this somewhere safe!!!):
/// word word word ...
/// ```
pub fn parse_initialization(output: &str) -> Result<NodeInitialization, SessionError> {
    let joined = output.replacen(": \n", ": ", 1);
    let mut name = None;
    let mut address = None;
    let mut mnemonic = None;

    for line in joined.lines().filter(|l| !l.trim().is_empty()) {
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        let value = value.trim().to_string();
        match key.split(' ').next() {
            Some("NAME") => name = Some(value),
            Some("ADDRESS") => address = Some(value),
            Some("MNEMONIC") => mnemonic = Some(value),
            _ => {}
        }
    }

    match (name, address, mnemonic) {
        (Some(name), Some(address), Some(mnemonic)) => Ok(NodeInitialization {
            name,
            address,
            mnemonic,
        }),
        _ => Err(SessionError::Parse(format!(
            "expected NAME, ADDRESS and MNEMONIC in init output: {output:?}"
        ))),
    }
}
