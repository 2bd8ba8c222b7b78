//! Data structures shared across the chute daemon.
//!
//! These types are serialised using [`serde`](https://serde.rs/).  The
//! [`Chute`] record is the durable unit of persistence; the cache
//! field names keep their historical camelCase spelling because the
//! control plane consumes the on-disk format directly.

use std::fmt;
use std::net::Ipv4Addr;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Lifecycle state of a chute, as recorded in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChuteState {
    /// Created but never started; no container exists yet.
    Created,
    Running,
    /// A stop or restart is in flight.
    Stopping,
    Stopped,
    /// The container is up but its network interfaces could not be
    /// attached.  The operator decides whether to stop or retry.
    Failed,
}

impl fmt::Display for ChuteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChuteState::Created => "created",
            ChuteState::Running => "running",
            ChuteState::Stopping => "stopping",
            ChuteState::Stopped => "stopped",
            ChuteState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A port published from the chute's container to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBindingSpec {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Host configuration options a chute is allowed to request.
///
/// Only port bindings and DNS servers pass through to the container
/// runtime.  Every other runtime option is pinned by the adapter so a
/// chute cannot request privilege escalation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfigOptions {
    #[serde(default)]
    pub port_bindings: Vec<PortBindingSpec>,
    #[serde(default)]
    pub dns: Vec<String>,
}

/// A network interface declared by a chute's config.  Only `wifi`
/// type interfaces receive a host interface binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub net_type: String,
    /// Interface name inside the container, e.g. `wlan0`.
    pub intf: String,
}

/// Declarative spec for a chute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChuteConfig {
    /// Dockerfile content used as the image build source.
    pub dockerfile: String,
    #[serde(default)]
    pub host_config: HostConfigOptions,
    #[serde(default)]
    pub net: Vec<NetworkInterfaceSpec>,
}

/// A lease of device-level networking resources to one chute.
///
/// At most one binding is active per `(chute, internalIntf)` pair; the
/// external name is derived from that pair, which enforces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceBinding {
    pub net_type: String,
    pub internal_intf: String,
    pub external_intf: String,
    pub ipaddr_with_prefix: String,
}

impl NetworkInterfaceBinding {
    /// The leased address without its prefix length, if parseable.
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.ipaddr_with_prefix.split('/').next()?.parse().ok()
    }
}

/// Derived runtime data that is not part of the declared config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChuteCache {
    #[serde(default, rename = "networkInterfaces")]
    pub network_interfaces: Vec<NetworkInterfaceBinding>,
}

/// Durable record of one chute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chute {
    pub name: String,
    pub state: ChuteState,
    pub config: ChuteConfig,
    #[serde(default)]
    pub cache: ChuteCache,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Chute {
    pub fn new(name: String, config: ChuteConfig) -> Self {
        Self {
            name,
            state: ChuteState::Created,
            config,
            cache: ChuteCache::default(),
            warnings: Vec::new(),
        }
    }
}

/// Chute names become container names and file names, so they are
/// restricted to a safe character set.
pub fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    name.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateClass {
    Chute,
    Router,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Create,
    Start,
    Stop,
    Restart,
    Remove,
    #[serde(rename = "sethostconfig")]
    SetHostConfig,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateType::Create => "create",
            UpdateType::Start => "start",
            UpdateType::Stop => "stop",
            UpdateType::Restart => "restart",
            UpdateType::Remove => "remove",
            UpdateType::SetHostConfig => "sethostconfig",
        };
        f.write_str(s)
    }
}

/// Outcome of an update, delivered once on the completion channel.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub success: bool,
    pub message: String,
}

/// A queued lifecycle operation against one chute.
///
/// Owned by the update executor from submission until it resolves;
/// the submitter may subscribe to the completion channel beforehand.
pub struct Update {
    pub class: UpdateClass,
    pub update_type: UpdateType,
    pub name: String,
    /// Monotonically increasing ordering key; stale tokens are rejected.
    pub token: u64,
    pub payload: Option<ChuteConfig>,
    /// Optional sink for build progress lines.
    pub progress: Option<mpsc::Sender<String>>,
    completion: Option<oneshot::Sender<UpdateResult>>,
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("class", &self.class)
            .field("type", &self.update_type)
            .field("name", &self.name)
            .field("token", &self.token)
            .finish()
    }
}

impl Update {
    pub fn new(
        class: UpdateClass,
        update_type: UpdateType,
        name: impl Into<String>,
        token: u64,
        payload: Option<ChuteConfig>,
    ) -> Self {
        Self {
            class,
            update_type,
            name: name.into(),
            token,
            payload,
            progress: None,
            completion: None,
        }
    }

    /// Attach a sink that will receive build output lines.
    pub fn with_progress(mut self, sink: mpsc::Sender<String>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Returns a receiver that resolves exactly once when this update
    /// is done.  Replaces any previous subscription.
    pub fn subscribe(&mut self) -> oneshot::Receiver<UpdateResult> {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    /// Queue key: operations sharing a key are serialized.
    pub(crate) fn key(&self) -> String {
        match self.class {
            UpdateClass::Chute => format!("chute/{}", self.name),
            UpdateClass::Router => "router".to_string(),
        }
    }

    /// Resolve the update.  Invoked exactly once by the executor.
    pub(crate) fn complete(&mut self, success: bool, message: impl Into<String>) {
        let message = message.into();
        if success {
            info!("update {:?} succeeded: {}", self, message);
        } else {
            warn!("update {:?} failed: {}", self, message);
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(UpdateResult { success, message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_name("app1"));
        assert!(valid_name("my-chute_2"));
        assert!(!valid_name(""));
        assert!(!valid_name("-leading-dash"));
        assert!(!valid_name("has space"));
        assert!(!valid_name("dot./traversal"));
    }

    #[test]
    fn binding_address_parses() {
        let binding = NetworkInterfaceBinding {
            net_type: "wifi".into(),
            internal_intf: "wlan0".into(),
            external_intf: "wlan0-app1".into(),
            ipaddr_with_prefix: "10.0.0.5/24".into(),
        };
        assert_eq!(binding.address(), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn chute_record_uses_documented_field_names() {
        let mut chute = Chute::new(
            "app1".into(),
            ChuteConfig {
                dockerfile: "FROM alpine".into(),
                host_config: HostConfigOptions::default(),
                net: vec![],
            },
        );
        chute.cache.network_interfaces.push(NetworkInterfaceBinding {
            net_type: "wifi".into(),
            internal_intf: "wlan0".into(),
            external_intf: "wlan0-app1".into(),
            ipaddr_with_prefix: "10.0.0.5/24".into(),
        });
        let json = serde_json::to_value(&chute).unwrap();
        let iface = &json["cache"]["networkInterfaces"][0];
        assert_eq!(iface["netType"], "wifi");
        assert_eq!(iface["internalIntf"], "wlan0");
        assert_eq!(iface["externalIntf"], "wlan0-app1");
        assert_eq!(iface["ipaddrWithPrefix"], "10.0.0.5/24");
        assert_eq!(json["state"], "created");
    }
}
