//! Network resource allocation and interface binding.
//!
//! Addresses and external interface names are leases from a shared
//! pool.  Leases live in the chute's cache so they survive restarts;
//! boot reconciliation reclaims them before anything is reallocated.
//! Attaching an interface into a running container is delegated to an
//! external helper (pipework).

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::errors::ChuteError;
use crate::types::{Chute, NetworkInterfaceBinding};

/// Linux IFNAMSIZ minus the trailing NUL.
const MAX_IFNAME_LEN: usize = 15;

struct AddressPool {
    network: u32,
    prefix: u8,
    in_use: HashSet<Ipv4Addr>,
    interfaces: HashSet<String>,
}

impl AddressPool {
    fn new(cidr: &str) -> Result<Self, ChuteError> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| ChuteError::InvalidSpec(format!("missing '/' in subnet: {}", cidr)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| ChuteError::InvalidSpec(format!("bad subnet address: {}", cidr)))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| (8..=30).contains(p))
            .ok_or_else(|| ChuteError::InvalidSpec(format!("bad subnet prefix: {}", cidr)))?;
        let network = u32::from(addr) & (!0u32 << (32 - prefix));
        Ok(Self {
            network,
            prefix,
            in_use: HashSet::new(),
            interfaces: HashSet::new(),
        })
    }

    /// First free host address.  Host 0 is the network address, host 1
    /// is reserved for the bridge gateway, the last is broadcast.
    fn allocate_addr(&mut self) -> Option<Ipv4Addr> {
        let size = 1u32 << (32 - self.prefix);
        for host in 2..size - 1 {
            let addr = Ipv4Addr::from(self.network + host);
            if !self.in_use.contains(&addr) {
                self.in_use.insert(addr);
                return Some(addr);
            }
        }
        None
    }

    fn release_addr(&mut self, addr: Ipv4Addr) {
        self.in_use.remove(&addr);
    }
}

pub struct NetworkResourceManager {
    pool: Mutex<AddressPool>,
    pipework_bin: PathBuf,
    docker_bin_dir: PathBuf,
}

impl NetworkResourceManager {
    pub fn new(cfg: &Config) -> Result<Self, ChuteError> {
        Ok(Self {
            pool: Mutex::new(AddressPool::new(&cfg.subnet)?),
            pipework_bin: cfg.pipework_bin.clone(),
            docker_bin_dir: cfg.docker_bin_dir.clone(),
        })
    }

    /// Mark a chute's persisted leases as in use without touching the
    /// chute.  Called once per stored chute at startup so a stale
    /// lease can never be handed out twice.
    pub async fn adopt(&self, chute: &Chute) {
        let mut pool = self.pool.lock().await;
        for binding in &chute.cache.network_interfaces {
            if let Some(addr) = binding.address() {
                pool.in_use.insert(addr);
            }
            pool.interfaces.insert(binding.external_intf.clone());
        }
    }

    /// Fill the chute's cache with one binding per declared wifi
    /// interface.  A chute that already holds a lease keeps it.
    pub async fn allocate(&self, chute: &mut Chute) -> Result<(), ChuteError> {
        if !chute.cache.network_interfaces.is_empty() {
            return Ok(());
        }

        let mut pool = self.pool.lock().await;
        let mut bindings = Vec::new();
        for spec in chute.config.net.iter().filter(|s| s.net_type == "wifi") {
            let external = external_name(&spec.intf, &chute.name);
            if pool.interfaces.contains(&external) {
                release(&mut pool, &bindings);
                return Err(ChuteError::InterfaceInUse(external));
            }
            let addr = match pool.allocate_addr() {
                Some(addr) => addr,
                None => {
                    release(&mut pool, &bindings);
                    return Err(ChuteError::PoolExhausted);
                }
            };
            pool.interfaces.insert(external.clone());
            bindings.push(NetworkInterfaceBinding {
                net_type: spec.net_type.clone(),
                internal_intf: spec.intf.clone(),
                external_intf: external,
                ipaddr_with_prefix: format!("{}/{}", addr, pool.prefix),
            });
        }

        if !bindings.is_empty() {
            debug!("allocated {} binding(s) for chute {}", bindings.len(), chute.name);
        }
        chute.cache.network_interfaces = bindings;
        Ok(())
    }

    /// Return every lease recorded in the chute's cache to the pool
    /// and clear the cache.  Safe to call on a chute with nothing to
    /// reclaim, and safe to call twice.
    pub async fn reclaim(&self, chute: &mut Chute) {
        if chute.cache.network_interfaces.is_empty() {
            return;
        }
        let mut pool = self.pool.lock().await;
        for binding in chute.cache.network_interfaces.drain(..) {
            if let Some(addr) = binding.address() {
                pool.release_addr(addr);
            }
            pool.interfaces.remove(&binding.external_intf);
            debug!(
                "reclaimed {} ({}) from chute {}",
                binding.external_intf, binding.ipaddr_with_prefix, chute.name
            );
        }
    }

    /// Attach each leased wifi interface into the chute's container.
    /// Helper failure is a hard error and is never retried here.
    pub async fn bind(&self, chute: &Chute) -> Result<(), ChuteError> {
        for iface in &chute.cache.network_interfaces {
            if iface.net_type != "wifi" {
                continue;
            }
            self.run_pipework(chute, iface).await?;
        }
        Ok(())
    }

    async fn run_pipework(
        &self,
        chute: &Chute,
        iface: &NetworkInterfaceBinding,
    ) -> Result<(), ChuteError> {
        // pipework shells out to the docker client, which is not on
        // PATH in every deployment.
        let mut path = std::env::var("PATH").unwrap_or_default();
        let docker_dir = self.docker_bin_dir.to_string_lossy();
        if !path.split(':').any(|p| p == docker_dir) {
            if !path.is_empty() {
                path.push(':');
            }
            path.push_str(&docker_dir);
        }

        info!(
            "calling {} {} -i {} {} {}",
            self.pipework_bin.display(),
            iface.external_intf,
            iface.internal_intf,
            chute.name,
            iface.ipaddr_with_prefix
        );
        let mut child = Command::new(&self.pipework_bin)
            .arg(&iface.external_intf)
            .arg("-i")
            .arg(&iface.internal_intf)
            .arg(&chute.name)
            .arg(&iface.ipaddr_with_prefix)
            .env("PATH", path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ChuteError::NetworkBindFailure(format!(
                    "failed to launch {}: {}",
                    self.pipework_bin.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = async {
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("pipework: {}", line.trim());
                }
            }
        };
        let err_task = async {
            if let Some(err) = stderr {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("pipework: {}", line.trim());
                }
            }
        };
        tokio::join!(out_task, err_task);

        let status = child.wait().await.map_err(|e| {
            ChuteError::NetworkBindFailure(format!("waiting for helper failed: {}", e))
        })?;
        if !status.success() {
            return Err(ChuteError::NetworkBindFailure(format!(
                "helper exited with {} while binding {}",
                status, iface.external_intf
            )));
        }
        Ok(())
    }
}

fn release(pool: &mut AddressPool, bindings: &[NetworkInterfaceBinding]) {
    for binding in bindings {
        if let Some(addr) = binding.address() {
            pool.release_addr(addr);
        }
        pool.interfaces.remove(&binding.external_intf);
    }
}

fn external_name(intf: &str, chute: &str) -> String {
    let mut name = format!("{}-{}", intf, chute);
    name.truncate(MAX_IFNAME_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChuteConfig, HostConfigOptions, NetworkInterfaceSpec};

    fn manager(subnet: &str) -> NetworkResourceManager {
        let cfg = Config {
            subnet: subnet.into(),
            ..Config::default()
        };
        NetworkResourceManager::new(&cfg).unwrap()
    }

    fn wifi_chute(name: &str) -> Chute {
        Chute::new(
            name.to_string(),
            ChuteConfig {
                dockerfile: "FROM alpine".into(),
                host_config: HostConfigOptions::default(),
                net: vec![NetworkInterfaceSpec {
                    net_type: "wifi".into(),
                    intf: "wlan0".into(),
                }],
            },
        )
    }

    #[tokio::test]
    async fn allocates_within_subnet() {
        let net = manager("10.0.0.0/24");
        let mut chute = wifi_chute("app1");
        net.allocate(&mut chute).await.unwrap();
        let binding = &chute.cache.network_interfaces[0];
        assert_eq!(binding.internal_intf, "wlan0");
        assert_eq!(binding.external_intf, "wlan0-app1");
        let addr = binding.address().unwrap();
        assert!(addr.octets()[..3] == [10, 0, 0]);
        assert!(binding.ipaddr_with_prefix.ends_with("/24"));
    }

    #[tokio::test]
    async fn allocate_is_a_noop_with_existing_lease() {
        let net = manager("10.0.0.0/24");
        let mut chute = wifi_chute("app1");
        net.allocate(&mut chute).await.unwrap();
        let before = chute.cache.network_interfaces.clone();
        net.allocate(&mut chute).await.unwrap();
        assert_eq!(
            chute.cache.network_interfaces[0].ipaddr_with_prefix,
            before[0].ipaddr_with_prefix
        );
    }

    #[tokio::test]
    async fn reclaim_is_idempotent() {
        let net = manager("10.0.0.0/24");
        let mut chute = wifi_chute("app1");
        net.allocate(&mut chute).await.unwrap();
        net.reclaim(&mut chute).await;
        assert!(chute.cache.network_interfaces.is_empty());
        // Second call has nothing to do and must not error.
        net.reclaim(&mut chute).await;
        assert!(chute.cache.network_interfaces.is_empty());

        // Reclaim on a chute that never held a lease.
        let mut fresh = wifi_chute("app2");
        net.reclaim(&mut fresh).await;
    }

    #[tokio::test]
    async fn pool_exhaustion_rolls_back() {
        // A /30 has exactly one usable host address here.
        let net = manager("10.1.0.0/30");
        let mut first = wifi_chute("app1");
        net.allocate(&mut first).await.unwrap();

        let mut second = wifi_chute("app2");
        match net.allocate(&mut second).await {
            Err(ChuteError::PoolExhausted) => {}
            other => panic!("expected pool exhaustion, got {:?}", other.map(|_| ())),
        }
        assert!(second.cache.network_interfaces.is_empty());

        // Releasing the first lease makes the address available again.
        let taken = first.cache.network_interfaces[0].ipaddr_with_prefix.clone();
        net.reclaim(&mut first).await;
        net.allocate(&mut second).await.unwrap();
        assert_eq!(second.cache.network_interfaces[0].ipaddr_with_prefix, taken);
    }

    #[tokio::test]
    async fn duplicate_interface_names_are_refused() {
        let net = manager("10.0.0.0/24");
        let mut chute = wifi_chute("app1");
        net.allocate(&mut chute).await.unwrap();

        // Another chute record claiming the same (chute, intf) pair.
        let mut twin = wifi_chute("app1");
        match net.allocate(&mut twin).await {
            Err(ChuteError::InterfaceInUse(name)) => assert_eq!(name, "wlan0-app1"),
            other => panic!("expected interface clash, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn adopted_leases_block_allocation_until_reclaimed() {
        let net = manager("10.0.0.0/30");
        let mut stale = wifi_chute("app1");
        stale.cache.network_interfaces.push(NetworkInterfaceBinding {
            net_type: "wifi".into(),
            internal_intf: "wlan0".into(),
            external_intf: "wlan0-app1".into(),
            ipaddr_with_prefix: "10.0.0.2/30".into(),
        });
        net.adopt(&stale).await;

        let mut other = wifi_chute("app2");
        assert!(matches!(
            net.allocate(&mut other).await,
            Err(ChuteError::PoolExhausted)
        ));

        net.reclaim(&mut stale).await;
        net.allocate(&mut other).await.unwrap();
        assert_eq!(
            other.cache.network_interfaces[0].ipaddr_with_prefix,
            "10.0.0.2/30"
        );
    }

    #[test]
    fn external_names_respect_kernel_limit() {
        let name = external_name("wlan0", "a-very-long-chute-name");
        assert!(name.len() <= MAX_IFNAME_LEN);
        assert!(name.starts_with("wlan0-"));
    }
}
