//! BoundaryHandlers - the named operations the UI process may call
//!
//! Every operation is addressed as `namespace:operation` and takes a JSON
//! argument array. Results are JSON values; failures are [`HandlerError`]s
//! that the API layer maps onto status codes.

use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::channel::ChannelHub;
use crate::config::Config;
use crate::networks;
use crate::provisioner::{BinaryProvisioner, ProvisionError};
use crate::session::{NodeSession, SessionError};
use crate::supervisor::{ProcessSupervisor, SupervisorError};

/// Every operation [`BoundaryHandlers::dispatch`] accepts.
pub const OPERATIONS: &[&str] = &[
    "binary:exists",
    "binary:downloadBinary",
    "process:run",
    "process:kill",
    "process:list",
    "node:exists",
    "node:keysExist",
    "node:dataExists",
    "node:removeNode",
    "node:removeKeys",
    "node:removeData",
    "networks:list",
    "session:status",
    "session:refresh",
    "session:selectNetwork",
    "session:initialize",
    "session:start",
    "session:stop",
    "session:rpc",
];

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    /// Stable machine-readable name for the UI.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::UnknownOperation(_) => "unknown_operation",
            HandlerError::InvalidArgument(_) => "invalid_argument",
            HandlerError::NotFound(_) => "not_found",
            HandlerError::Provision(_) => "provision",
            HandlerError::Supervisor(SupervisorError::BinaryMissing(_)) => "binary_missing",
            HandlerError::Supervisor(SupervisorError::UnknownProcess(_)) => "unknown_process",
            HandlerError::Supervisor(SupervisorError::AbnormalExit { .. }) => "abnormal_exit",
            HandlerError::Supervisor(_) => "supervisor",
            HandlerError::Session(SessionError::InvalidState { .. }) => "invalid_state",
            HandlerError::Session(SessionError::UnknownNetwork(_)) => "unknown_network",
            HandlerError::Session(_) => "session",
            HandlerError::Io(_) => "io",
        }
    }
}

/// On-disk layout of the node installation.
///
/// `<install_home>/<network>` holds one network's node, with `keys` and
/// `data` beneath it.
#[derive(Debug, Clone)]
pub struct NodeLayout {
    install_home: PathBuf,
}

impl NodeLayout {
    pub fn new(install_home: impl Into<PathBuf>) -> Self {
        Self {
            install_home: install_home.into(),
        }
    }

    pub fn node_dir(&self, network: &str) -> Result<PathBuf, HandlerError> {
        validate_network(network)?;
        Ok(self.install_home.join(network))
    }

    pub fn keys_dir(&self, network: &str) -> Result<PathBuf, HandlerError> {
        Ok(self.node_dir(network)?.join("keys"))
    }

    pub fn data_dir(&self, network: &str) -> Result<PathBuf, HandlerError> {
        Ok(self.node_dir(network)?.join("data"))
    }
}

/// A network id must name exactly one directory below the install home.
fn validate_network(network: &str) -> Result<(), HandlerError> {
    let single = matches!(
        Path::new(network).components().collect::<Vec<_>>().as_slice(),
        [Component::Normal(_)]
    );
    if !single || network.contains(['/', '\\']) {
        return Err(HandlerError::InvalidArgument(format!(
            "network must be a single path component, got {network:?}"
        )));
    }
    Ok(())
}

async fn remove_tree(path: PathBuf) -> Result<(), HandlerError> {
    match tokio::fs::metadata(&path).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "nothing to remove");
            return Err(HandlerError::NotFound(path));
        }
        Err(e) => return Err(e.into()),
    }
    tokio::fs::remove_dir_all(&path).await?;
    info!(path = %path.display(), "removed");
    Ok(())
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> Result<T, HandlerError> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| HandlerError::InvalidArgument(format!("missing argument {index} ({name})")))?;
    serde_json::from_value(value)
        .map_err(|e| HandlerError::InvalidArgument(format!("argument {index} ({name}): {e}")))
}

fn optional_arg<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<Option<T>, HandlerError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg(args, index, name).map(Some),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, HandlerError> {
    serde_json::to_value(value).map_err(|e| HandlerError::Io(std::io::Error::other(e)))
}

pub struct BoundaryHandlers {
    provisioner: BinaryProvisioner,
    supervisor: ProcessSupervisor,
    session: NodeSession,
    layout: NodeLayout,
}

impl BoundaryHandlers {
    pub fn new(
        provisioner: BinaryProvisioner,
        supervisor: ProcessSupervisor,
        session: NodeSession,
        layout: NodeLayout,
    ) -> Self {
        Self {
            provisioner,
            supervisor,
            session,
            layout,
        }
    }

    /// Wire up every component against one hub.
    pub fn from_config(config: &Config, hub: ChannelHub) -> Result<Self, HandlerError> {
        let provisioner = BinaryProvisioner::new(config, hub.clone())?;
        let supervisor = ProcessSupervisor::new(config, hub);
        let layout = NodeLayout::new(&config.install_home);
        let session = NodeSession::new(
            crate::bridge::ChannelRpcBridge::with_channel_notifier(supervisor.clone()),
            layout.clone(),
            &config.default_network,
        )?;
        Ok(Self::new(provisioner, supervisor, session, layout))
    }

    pub fn operations() -> &'static [&'static str] {
        OPERATIONS
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn session(&self) -> &NodeSession {
        &self.session
    }

    pub async fn dispatch(&self, operation: &str, args: &[Value]) -> Result<Value, HandlerError> {
        match operation {
            "binary:exists" => Ok(json!(self.provisioner.exists())),
            "binary:downloadBinary" => {
                self.provisioner.download_binary().await?;
                Ok(Value::Null)
            }
            "process:run" => {
                let channel: String = arg(args, 0, "channel")?;
                let argv: Vec<String> = arg(args, 1, "args")?;
                let exit = self.supervisor.run(&channel, &argv).await?;
                to_value(exit)
            }
            "process:kill" => {
                let pid: u32 = arg(args, 0, "pid")?;
                Ok(json!(self.supervisor.kill(pid).await?))
            }
            "process:list" => to_value(self.supervisor.snapshot().await),
            "node:exists" => Ok(json!(self.node_exists(&arg::<String>(args, 0, "network")?)?)),
            "node:keysExist" => Ok(json!(self.keys_exist(&arg::<String>(args, 0, "network")?)?)),
            "node:dataExists" => Ok(json!(self.data_exists(&arg::<String>(args, 0, "network")?)?)),
            "node:removeNode" => {
                let network: String = arg(args, 0, "network")?;
                remove_tree(self.layout.node_dir(&network)?).await?;
                Ok(Value::Null)
            }
            "node:removeKeys" => {
                let network: String = arg(args, 0, "network")?;
                remove_tree(self.layout.keys_dir(&network)?).await?;
                Ok(Value::Null)
            }
            "node:removeData" => {
                let network: String = arg(args, 0, "network")?;
                remove_tree(self.layout.data_dir(&network)?).await?;
                Ok(Value::Null)
            }
            "networks:list" => to_value(
                networks::all()
                    .iter()
                    .map(|n| n.info())
                    .collect::<Vec<_>>(),
            ),
            "session:status" => to_value(self.session.snapshot().await),
            "session:refresh" => to_value(self.session.refresh().await?),
            "session:selectNetwork" => {
                let network: String = arg(args, 0, "network")?;
                to_value(self.session.select_network(&network).await?)
            }
            "session:initialize" => to_value(self.session.initialize().await?),
            "session:start" => to_value(self.session.start().await?),
            "session:stop" => Ok(json!(self.session.stop().await?)),
            "session:rpc" => {
                let section: String = arg(args, 0, "section")?;
                let method: String = arg(args, 1, "method")?;
                let params: Vec<String> = optional_arg(args, 2, "params")?.unwrap_or_default();
                let timeout_ms: Option<u64> = optional_arg(args, 3, "timeoutMs")?;
                to_value(self.session.rpc(&section, &method, &params, timeout_ms).await?)
            }
            other => Err(HandlerError::UnknownOperation(other.to_string())),
        }
    }

    pub fn node_exists(&self, network: &str) -> Result<bool, HandlerError> {
        Ok(self.layout.node_dir(network)?.is_dir())
    }

    pub fn keys_exist(&self, network: &str) -> Result<bool, HandlerError> {
        Ok(self.layout.keys_dir(network)?.is_dir())
    }

    pub fn data_exists(&self, network: &str) -> Result<bool, HandlerError> {
        Ok(self.layout.data_dir(network)?.is_dir())
    }
}
