//! Docker Effector (spec §2): the only external system the Reconciler
//! controls directly. Thin wrapper over `bollard` exposing exactly the
//! capability surface spec §2 names — `run`, `stop`, `remove`, `restart`,
//! `inspect`, `list_running` — nothing else.

pub mod launch;

use std::collections::HashMap;

use anyhow::{Context, Result};
use bollard::models::{ContainerCreateBody, ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateImageOptions, InspectContainerOptions, ListContainersOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::{info, warn};

const DOCKER_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Assembled request to launch one reserved container (spec §4.4).
#[derive(Debug, Clone)]
pub struct ContainerRunSpec {
    pub name: String,
    pub image: String,
    /// `(host_path, container_path, read_only)`.
    pub volumes: Vec<(String, String, bool)>,
    /// `device=i1,i2,...` — `None` when no GPUs are reserved.
    pub gpu_device_request: Option<String>,
    pub memory_limit_gb: f64,
    pub shm_size_gb: f64,
    pub cpus: f64,
    /// `(outside_port, inside_port)`.
    pub published_ports: Vec<(u16, u16)>,
    /// Size in GiB of an in-memory `/home/user/ram_disk` tmpfs mount, or
    /// `None` when `ramDiskSizePercent` was `0` (spec §4.4, §B).
    pub ram_disk_size_gb: Option<f64>,
}

const RAM_DISK_MOUNT_PATH: &str = "/home/user/ram_disk";

/// The subset of a Docker container's lifecycle state the Reconciler cares
/// about (spec §4.3 `restartCrashedServers`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Other,
}

#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub name: String,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub struct DockerEffector {
    docker: Docker,
    registry_address: String,
}

impl DockerEffector {
    pub async fn connect(docker_host: &str, registry_address: &str) -> Result<Self> {
        std::env::set_var("DOCKER_HOST", docker_host);
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to Docker")?;

        let version = docker
            .version()
            .await
            .context("failed to get Docker version — is the Docker socket mounted?")?;
        info!(
            docker_version = version.version.as_deref().unwrap_or("unknown"),
            "connected to Docker"
        );

        Ok(Self {
            docker,
            registry_address: registry_address.to_string(),
        })
    }

    /// Construct a dummy effector for tests that never actually reach Docker.
    #[cfg(test)]
    pub fn test_dummy() -> Self {
        let docker =
            Docker::connect_with_http("http://localhost:1", 1, bollard::API_DEFAULT_VERSION)
                .expect("dummy Docker client");
        Self {
            docker,
            registry_address: "registry.test".to_string(),
        }
    }

    pub fn qualify_image(&self, image_name: &str) -> String {
        format!("{}/{}", self.registry_address, image_name)
    }

    /// `run(spec) -> id` (spec §2). Pulls the image first (`pull=always`,
    /// spec §4.4 step 7), then creates and starts the container.
    pub async fn run(&self, spec: &ContainerRunSpec) -> Result<String> {
        self.pull_image(&spec.image).await?;

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for (outside, inside) in &spec.published_ports {
            let key = format!("{inside}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(outside.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|(host, container, read_only)| {
                let mode = if *read_only { "ro" } else { "rw" };
                format!("{host}:{container}:{mode}")
            })
            .collect();

        let device_requests = spec.gpu_device_request.as_ref().map(|devices| {
            vec![bollard::models::DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(devices.split(',').map(|s| s.to_string()).collect()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let tmpfs = spec.ram_disk_size_gb.map(|gb| {
            let bytes = (gb * 1024.0 * 1024.0 * 1024.0) as i64;
            HashMap::from([(
                RAM_DISK_MOUNT_PATH.to_string(),
                format!("size={bytes}"),
            )])
        });

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            memory: Some((spec.memory_limit_gb * 1024.0 * 1024.0 * 1024.0) as i64),
            shm_size: Some((spec.shm_size_gb * 1024.0 * 1024.0 * 1024.0) as i64),
            nano_cpus: Some((spec.cpus * 1_000_000_000.0) as i64),
            device_requests,
            tmpfs,
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = bollard::query_parameters::CreateContainerOptionsBuilder::new()
            .name(&spec.name)
            .build();

        let created = tokio::time::timeout(
            DOCKER_CALL_TIMEOUT,
            self.docker.create_container(Some(create_options), config),
        )
        .await
        .context("docker create_container timed out")?
        .context("docker create_container failed")?;

        tokio::time::timeout(
            DOCKER_CALL_TIMEOUT,
            self.docker
                .start_container(&spec.name, None::<StartContainerOptions>),
        )
        .await
        .context("docker start_container timed out")?
        .context("docker start_container failed")?;

        Ok(created.id)
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        tokio::time::timeout(
            DOCKER_CALL_TIMEOUT,
            self.docker
                .stop_container(name, None::<StopContainerOptions>),
        )
        .await
        .context("docker stop timed out")?
        .context("docker stop failed")
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        tokio::time::timeout(
            DOCKER_CALL_TIMEOUT,
            self.docker.remove_container(name, Some(options)),
        )
        .await
        .context("docker remove timed out")?
        .context("docker remove failed")
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        tokio::time::timeout(
            DOCKER_CALL_TIMEOUT,
            self.docker
                .restart_container(name, None::<RestartContainerOptions>),
        )
        .await
        .context("docker restart timed out")?
        .context("docker restart failed")
    }

    pub async fn inspect(&self, name: &str) -> Result<ContainerState> {
        let detail = tokio::time::timeout(
            DOCKER_CALL_TIMEOUT,
            self.docker
                .inspect_container(name, None::<InspectContainerOptions>),
        )
        .await
        .context("docker inspect timed out")?
        .context("docker inspect failed")?;

        let status = detail.state.and_then(|s| s.status);
        Ok(match status {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
            _ => ContainerState::Other,
        })
    }

    /// All running containers named `reservation-*` (spec §4.3 Sweep).
    pub async fn list_running(&self) -> Result<Vec<RunningContainer>> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        let containers = tokio::time::timeout(
            DOCKER_CALL_TIMEOUT,
            self.docker.list_containers(Some(ListContainersOptions {
                all: false,
                filters: Some(filters),
                ..Default::default()
            })),
        )
        .await
        .context("docker list_containers timed out")?
        .context("docker list_containers failed")?;

        let mut out = Vec::new();
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            if !name.starts_with("reservation-") {
                continue;
            }
            let started_at = c
                .created
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0));
            out.push(RunningContainer { name, started_at });
        }
        Ok(out)
    }

    /// Set the SSH password inside a running container via exec (spec §4.4
    /// step 8). Uses `chpasswd` against the conventional in-image `root` user.
    pub async fn exec_set_ssh_password(&self, name: &str, password: &str) -> Result<()> {
        use bollard::exec::CreateExecOptions;

        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec![
                        "bash".to_string(),
                        "-c".to_string(),
                        format!("echo 'root:{password}' | chpasswd"),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("docker exec create failed")?;

        self.docker
            .start_exec(&exec.id, None)
            .await
            .context("docker exec start failed")?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (repo, tag) = match image.rsplit_once(':') {
            Some((r, t)) => (r, t),
            None => (image, "latest"),
        };

        if self.docker.inspect_image(image).await.is_ok() {
            // Still honor `pull=always` (spec §4.4 step 7): re-pull to catch
            // updates, but don't fail the launch if the registry is
            // unreachable and we already have a local copy.
            if let Err(e) = self.pull_from_registry(repo, tag).await {
                warn!(image = %image, error = %e, "pull=always re-pull failed, using cached image");
            }
            return Ok(());
        }

        self.pull_from_registry(repo, tag).await
    }

    async fn pull_from_registry(&self, repo: &str, tag: &str) -> Result<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(repo.to_string()),
                tag: Some(tag.to_string()),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            result.context("image pull stream failed")?;
        }
        Ok(())
    }
}
