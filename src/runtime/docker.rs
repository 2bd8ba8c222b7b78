use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use log::{info, warn};
use tokio::sync::mpsc;

use super::ContainerRuntime;
use crate::errors::ChuteError;
use crate::network::NetworkResourceManager;
use crate::types::{Chute, HostConfigOptions};

/// Options file content for the container runtime.  The runtime must
/// not bring chute containers back up on its own after a power cycle;
/// boot reconciliation decides what restarts.
const DAEMON_OPTIONS: &str = "\
# Container runtime configuration
#
# This file was automatically generated by chuted.  Any changes will
# be overwritten on startup.

DOCKER_OPTIONS=\"--restart=false\"
";

/// Rewrite the runtime options file, if its directory exists.
pub async fn write_daemon_options(path: &Path) -> bool {
    let parent = match path.parent() {
        Some(p) => p,
        None => return false,
    };
    if !parent.exists() {
        warn!("no directory {} found, runtime options left unchanged", parent.display());
        return false;
    }
    match tokio::fs::write(path, DAEMON_OPTIONS).await {
        Ok(()) => true,
        Err(e) => {
            warn!("error writing {}: {}", path.display(), e);
            false
        }
    }
}

/// Before/after baseline used to unwind a failed build or start.
pub(crate) struct RuntimeSnapshot {
    images: HashSet<String>,
    containers: HashSet<String>,
}

impl RuntimeSnapshot {
    async fn capture(docker: &Docker) -> Result<Self, ChuteError> {
        let images = docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| ChuteError::RuntimeFailure {
                op: "list images",
                source: e,
            })?
            .into_iter()
            .map(|i| i.id)
            .collect();
        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| ChuteError::RuntimeFailure {
                op: "list containers",
                source: e,
            })?
            .into_iter()
            .filter_map(|c| c.id)
            .collect();
        Ok(Self { images, containers })
    }

    /// Ids present now that were not present at capture time.
    fn orphans(&self, now_images: &[String], now_containers: &[String]) -> (Vec<String>, Vec<String>) {
        let images = now_images
            .iter()
            .filter(|id| !self.images.contains(*id))
            .cloned()
            .collect();
        let containers = now_containers
            .iter()
            .filter(|id| !self.containers.contains(*id))
            .cloned()
            .collect();
        (images, containers)
    }

    /// Remove everything created since the snapshot.  Cleanup errors
    /// are logged, not raised; the original failure is what matters.
    async fn cleanup(&self, docker: &Docker) {
        let now_containers: Vec<String> = match docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
        {
            Ok(list) => list.into_iter().filter_map(|c| c.id).collect(),
            Err(e) => {
                warn!("cleanup could not list containers: {}", e);
                Vec::new()
            }
        };
        let now_images: Vec<String> = match docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
        {
            Ok(list) => list.into_iter().map(|i| i.id).collect(),
            Err(e) => {
                warn!("cleanup could not list images: {}", e);
                Vec::new()
            }
        };

        let (images, containers) = self.orphans(&now_images, &now_containers);
        for id in containers {
            info!("removing leftover container {}", short_id(&id));
            if let Err(e) = docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!("failed to remove container {}: {}", short_id(&id), e);
            }
        }
        for id in images {
            info!("removing leftover image {}", short_id(&id));
            if let Err(e) = docker.remove_image(&id, None, None).await {
                warn!("failed to remove image {}: {}", short_id(&id), e);
            }
        }
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn status_err(err: &DockerError, code: u16) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

/// Wrap the chute's Dockerfile in a single-file tar archive, the
/// build context format the runtime expects.
fn build_context(dockerfile: &str) -> Result<Bytes, ChuteError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
    Ok(Bytes::from(builder.into_inner()?))
}

/// Translate the allowlisted chute options into the runtime's host
/// configuration.  Only port bindings and DNS servers pass through;
/// every privilege-relevant option is pinned here regardless of what
/// the caller supplied.
fn host_config_for(opts: &HostConfigOptions) -> HostConfig {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for pb in &opts.port_bindings {
        port_bindings.insert(
            format!("{}/{}", pb.container_port, pb.protocol),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(pb.host_port.to_string()),
            }]),
        );
    }

    HostConfig {
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        dns: (!opts.dns.is_empty()).then(|| opts.dns.clone()),
        // Chutes live on an isolated bridge; NET_ADMIN is the single
        // capability they need to manage their leased interfaces.
        network_mode: Some("bridge".to_string()),
        cap_add: Some(vec!["NET_ADMIN".to_string()]),
        cap_drop: None,
        privileged: Some(false),
        publish_all_ports: Some(false),
        dns_search: Some(Vec::new()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::ON_FAILURE),
            maximum_retry_count: Some(5),
        }),
        ..Default::default()
    }
}

pub struct DockerRuntime {
    router_id: String,
    net: Arc<NetworkResourceManager>,
}

impl DockerRuntime {
    pub fn new(router_id: String, net: Arc<NetworkResourceManager>) -> Self {
        Self { router_id, net }
    }

    fn connect() -> Result<Docker, ChuteError> {
        // Connect to the local daemon using default settings.  This
        // handles the unix socket on Linux.
        Docker::connect_with_local_defaults().map_err(|e| ChuteError::RuntimeFailure {
            op: "connect",
            source: e,
        })
    }

    /// Environment for a chute container.  Applications can key their
    /// behavior off the device they landed on.
    fn environment(&self, chute: &Chute) -> Vec<String> {
        vec![
            format!("CHUTE_NAME={}", chute.name),
            format!("ROUTER_ID={}", self.router_id),
        ]
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_and_start(
        &self,
        chute: &Chute,
        progress: mpsc::Sender<String>,
    ) -> Result<(), ChuteError> {
        info!("attempting to start new chute {}", chute.name);
        let docker = Self::connect()?;
        let repo = format!("{}:latest", chute.name);

        // Baseline for rollback if the build or start goes sideways.
        let snapshot = RuntimeSnapshot::capture(&docker).await?;

        let context = build_context(&chute.config.dockerfile)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: repo.clone(),
            rm: true,
            ..Default::default()
        };

        let mut failure: Option<String> = None;
        let mut stream = docker.build_image(options, None, Some(context));
        while let Some(item) = stream.next().await {
            match item {
                Ok(msg) => {
                    // An error marks the build failed, but remaining
                    // output is still forwarded to the caller.
                    if let Some(detail) = msg.error_detail {
                        failure =
                            Some(detail.message.unwrap_or_else(|| "unknown build error".into()));
                    } else if let Some(err) = msg.error {
                        failure = Some(err);
                    }
                    for line in [msg.stream, msg.status].into_iter().flatten() {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let _ = progress.send(line.to_string()).await;
                    }
                }
                Err(e) => failure = Some(e.to_string()),
            }
        }
        if let Some(reason) = failure {
            snapshot.cleanup(&docker).await;
            return Err(ChuteError::BuildFailure(reason));
        }

        let created = async {
            docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: chute.name.as_str(),
                        platform: None,
                    }),
                    ContainerConfig::<String> {
                        image: Some(repo.clone()),
                        env: Some(self.environment(chute)),
                        host_config: Some(host_config_for(&chute.config.host_config)),
                        ..Default::default()
                    },
                )
                .await?;
            docker
                .start_container(&chute.name, None::<StartContainerOptions<String>>)
                .await?;
            Ok::<_, DockerError>(())
        }
        .await;
        if let Err(e) = created {
            snapshot.cleanup(&docker).await;
            return Err(ChuteError::RuntimeFailure {
                op: "create/start",
                source: e,
            });
        }
        info!("successfully started chute {}", chute.name);

        // The container is up at this point.  A bind failure is
        // reported distinctly so the caller can decide what to do
        // with a chute that runs without connectivity.
        self.net.bind(chute).await
    }

    async fn stop(&self, chute: &Chute) -> Result<(), ChuteError> {
        info!("attempting to stop chute {}", chute.name);
        let docker = Self::connect()?;
        match docker
            .stop_container(&chute.name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(e) if status_err(&e, 304) => Ok(()),
            Err(e) => Err(ChuteError::RuntimeFailure {
                op: "stop",
                source: e,
            }),
        }
    }

    async fn restart(&self, chute: &Chute) -> Result<(), ChuteError> {
        info!("attempting to restart chute {}", chute.name);
        let docker = Self::connect()?;
        match docker
            .start_container(&chute.name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(e) if status_err(&e, 304) => {}
            Err(e) => {
                return Err(ChuteError::RuntimeFailure {
                    op: "start",
                    source: e,
                })
            }
        }
        self.net.bind(chute).await
    }

    async fn remove(&self, chute: &Chute) -> Result<(), ChuteError> {
        info!("attempting to remove chute {}", chute.name);
        let docker = Self::connect()?;
        let repo = format!("{}:latest", chute.name);

        match docker
            .remove_container(
                &chute.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {}
            // A chute that was never started has no container.
            Err(e) if status_err(&e, 404) => {}
            Err(e) => {
                return Err(ChuteError::RuntimeFailure {
                    op: "remove container",
                    source: e,
                })
            }
        }

        match docker
            .remove_image(
                &repo,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if status_err(&e, 404) => Ok(()),
            Err(e) => Err(ChuteError::RuntimeFailure {
                op: "remove image",
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(images: &[&str], containers: &[&str]) -> RuntimeSnapshot {
        RuntimeSnapshot {
            images: images.iter().map(|s| s.to_string()).collect(),
            containers: containers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orphan_diff_only_reports_new_ids() {
        let snap = snapshot(&["img-a"], &["ctr-a"]);
        let (images, containers) = snap.orphans(
            &["img-a".into(), "img-b".into()],
            &["ctr-a".into(), "ctr-b".into()],
        );
        assert_eq!(images, vec!["img-b".to_string()]);
        assert_eq!(containers, vec!["ctr-b".to_string()]);
    }

    #[test]
    fn orphan_diff_is_empty_when_nothing_changed() {
        let snap = snapshot(&["img-a"], &["ctr-a"]);
        let (images, containers) = snap.orphans(&["img-a".into()], &["ctr-a".into()]);
        assert!(images.is_empty());
        assert!(containers.is_empty());
    }

    #[test]
    fn host_config_pins_the_security_boundary() {
        let opts = HostConfigOptions {
            port_bindings: vec![crate::types::PortBindingSpec {
                host_port: 8080,
                container_port: 80,
                protocol: "tcp".into(),
            }],
            dns: vec!["9.9.9.9".into()],
        };
        let hc = host_config_for(&opts);
        assert_eq!(hc.network_mode.as_deref(), Some("bridge"));
        assert_eq!(hc.privileged, Some(false));
        assert_eq!(hc.publish_all_ports, Some(false));
        assert_eq!(hc.cap_add, Some(vec!["NET_ADMIN".to_string()]));
        let bindings = hc.port_bindings.unwrap();
        assert!(bindings.contains_key("80/tcp"));
        assert_eq!(hc.dns, Some(vec!["9.9.9.9".to_string()]));
    }

    #[test]
    fn host_config_is_pinned_even_for_empty_options() {
        let hc = host_config_for(&HostConfigOptions::default());
        assert_eq!(hc.network_mode.as_deref(), Some("bridge"));
        assert_eq!(hc.privileged, Some(false));
        assert!(hc.port_bindings.is_none());
        assert!(hc.dns.is_none());
    }

    #[test]
    fn build_context_is_a_tar_with_a_dockerfile() {
        let bytes = build_context("FROM alpine\n").unwrap();
        let mut archive = tar::Archive::new(bytes.as_ref());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["Dockerfile".to_string()]);
    }
}
