use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding one JSON record per chute.
    pub storage_dir: PathBuf,
    /// Identity of this device, stamped into chute environments.
    pub router_id: String,
    /// Subnet the chute address pool allocates from, CIDR notation.
    pub subnet: String,
    /// Helper executable that links host interfaces into containers.
    pub pipework_bin: PathBuf,
    /// Directory containing the docker client, appended to the
    /// helper's PATH.
    pub docker_bin_dir: PathBuf,
    /// If set, the runtime options file rewritten on startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_conf: Option<PathBuf>,
    /// Unix socket where the network daemon reports status.
    pub confd_socket: PathBuf,
    /// Gate for the boot reconciliation protocol.
    pub reconcile_enabled: bool,
    /// Report target reserved for system config sections.
    pub reserved_section: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: "/var/lib/chuted/chutes".into(),
            router_id: "unprovisioned".into(),
            subnet: "10.0.0.0/24".into(),
            pipework_bin: "/usr/local/bin/pipework".into(),
            docker_bin_dir: "/usr/bin".into(),
            docker_conf: None,
            confd_socket: "/var/run/confd/status.sock".into(),
            reconcile_enabled: true,
            reserved_section: "__system__".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("chuted.toml"))
            .merge(Json::file("chuted.json"))
            .merge(Env::prefixed("CHUTED_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // The provisioned identity usually arrives as a file.
        if let Ok(id_file) = std::env::var("CHUTED_ROUTER_ID_FILE") {
            config.router_id = std::fs::read_to_string(id_file)?.trim().to_string();
        }

        Ok(config)
    }
}
