use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{LabError, Result};

use super::{labels, ContainerDriver, ContainerSpec, ManagedContainer};

/// How long a probed port stays reserved for the create that requested it.
/// Containers bind their ports well inside this window; after it expires
/// the port is probed again like any other.
const PORT_RESERVATION_WINDOW: Duration = Duration::from_secs(60);

/// Bind-probes host ports, remembering recent grants so back-to-back
/// creates cannot land on the same port before the first container binds.
struct PortProber {
    limit: u16,
    reserved: Mutex<HashMap<u16, Instant>>,
}

impl PortProber {
    fn new(limit: u16) -> Self {
        Self {
            limit,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    fn find_available(&self, start_port: u16) -> Result<u16> {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        reserved.retain(|_, handed_out| now.duration_since(*handed_out) < PORT_RESERVATION_WINDOW);

        for port in start_port..start_port.saturating_add(self.limit) {
            if reserved.contains_key(&port) {
                continue;
            }
            // Bind-probe is the source of truth for availability
            if TcpListener::bind(("0.0.0.0", port)).is_ok() {
                reserved.insert(port, now);
                return Ok(port);
            }
        }
        Err(LabError::ResourceExhausted(format!(
            "no free port in {}..{}",
            start_port,
            start_port.saturating_add(self.limit)
        )))
    }
}

/// Docker adapter. Container identity is by name everywhere; the engine id
/// is only reported back for bookkeeping.
pub struct DockerDriver {
    docker: Docker,
    network: Option<String>,
    stop_timeout: i64,
    prober: PortProber,
}

impl DockerDriver {
    /// Connect to the Docker daemon and verify it answers.
    pub async fn connect(config: &OrchestratorConfig) -> Result<Self> {
        let driver = Self::new(config)?;
        let version = driver
            .docker
            .version()
            .await
            .map_err(|e| LabError::Driver(format!("docker daemon unreachable: {}", e)))?;
        info!(
            "connected to docker daemon version {}",
            version.version.unwrap_or_default()
        );
        Ok(driver)
    }

    /// Build the client without touching the daemon.
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let docker = match &config.docker_socket {
            Some(socket) => Docker::connect_with_socket(socket, 120, &API_DEFAULT_VERSION),
            None => Docker::connect_with_socket_defaults(),
        }
        .map_err(|e| LabError::Driver(format!("docker client setup failed: {}", e)))?;

        Ok(Self {
            docker,
            network: config.network.clone(),
            stop_timeout: config.stop_timeout_secs,
            prober: PortProber::new(config.port_probe_limit),
        })
    }

    async fn pull_if_missing(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!("pulling image {}", image);

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(update) => {
                    if let Some(status) = update.status {
                        debug!("pull {}: {}", image, status);
                    }
                }
                Err(e) => {
                    return Err(LabError::Driver(format!("image pull failed: {}", e)));
                }
            }
        }
        info!("pulled image {}", image);
        Ok(())
    }

    fn status_str(status: ContainerStateStatusEnum) -> &'static str {
        match status {
            ContainerStateStatusEnum::CREATED => "created",
            ContainerStateStatusEnum::RUNNING => "running",
            ContainerStateStatusEnum::PAUSED => "paused",
            ContainerStateStatusEnum::RESTARTING => "restarting",
            ContainerStateStatusEnum::REMOVING => "removing",
            ContainerStateStatusEnum::EXITED => "exited",
            ContainerStateStatusEnum::DEAD => "dead",
            _ => "unknown",
        }
    }

    fn is_not_found(err: &bollard::errors::Error) -> bool {
        matches!(
            err,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }

    fn port_bindings(spec: &ContainerSpec) -> HashMap<String, Option<Vec<PortBinding>>> {
        spec.ports
            .iter()
            .map(|(internal, external)| {
                (
                    internal.clone(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(external.to_string()),
                    }]),
                )
            })
            .collect()
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.pull_if_missing(&spec.image).await?;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let mounts: Vec<Mount> = spec
            .volumes
            .iter()
            .map(|(host, target)| Mount {
                target: Some(target.clone()),
                source: Some(host.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            memory: Some(spec.memory_limit),
            memory_swap: Some(spec.memory_limit), // no swap on top of the cap
            cpu_quota: Some((spec.cpu_limit * 100000.0) as i64),
            cpu_period: Some(100000),
            port_bindings: Some(Self::port_bindings(spec)),
            mounts: Some(mounts),
            network_mode: self.network.clone(),
            auto_remove: Some(false), // keep stopped containers for resume
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(
                spec.ports
                    .keys()
                    .map(|internal| (internal.clone(), HashMap::new()))
                    .collect(),
            ),
            working_dir: spec.volumes.first().map(|(_, target)| target.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| LabError::Driver(format!("container create failed: {}", e)))?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| LabError::Driver(format!("container start failed: {}", e)))?;

        info!("container {} started ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn stop_container(&self, name: &str) -> Result<bool> {
        let options = StopContainerOptions {
            t: self.stop_timeout,
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => {
                info!("container {} stopped", name);
                Ok(true)
            }
            Err(e) if Self::is_not_found(&e) => Ok(false),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(true),
            Err(e) => Err(LabError::Driver(format!("container stop failed: {}", e))),
        }
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<bool> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                info!("container {} removed", name);
                Ok(true)
            }
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(LabError::Driver(format!("container remove failed: {}", e))),
        }
    }

    async fn get_container_status(&self, name: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| LabError::Driver(format!("container inspect failed: {}", e)))?;

        let status = inspect
            .state
            .and_then(|state| state.status)
            .unwrap_or(ContainerStateStatusEnum::EMPTY);
        Ok(Self::status_str(status).to_string())
    }

    async fn find_available_port(&self, start_port: u16) -> Result<u16> {
        self.prober.find_available(start_port)
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", labels::MANAGED)],
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| LabError::Driver(format!("container list failed: {}", e)))?;

        let mut managed = Vec::new();
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            // Inspect for the full picture: labels, state, and the port
            // bindings as originally requested (summaries drop bindings
            // for stopped containers).
            let inspect = match self
                .docker
                .inspect_container(&id, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => inspect,
                Err(e) => {
                    warn!("inspect of managed container {} failed: {}", id, e);
                    continue;
                }
            };

            let name = inspect
                .name
                .as_deref()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());
            let state = inspect
                .state
                .as_ref()
                .and_then(|state| state.status)
                .map(Self::status_str)
                .unwrap_or("unknown")
                .to_string();
            let container_labels = inspect
                .config
                .as_ref()
                .and_then(|config| config.labels.clone())
                .unwrap_or_default();

            let mut ports = HashMap::new();
            if let Some(bindings) = inspect
                .host_config
                .as_ref()
                .and_then(|host| host.port_bindings.as_ref())
            {
                for (internal, binding) in bindings {
                    let external = binding
                        .as_ref()
                        .and_then(|list| list.first())
                        .and_then(|b| b.host_port.as_deref())
                        .and_then(|raw| raw.parse::<u16>().ok());
                    if let Some(external) = external {
                        ports.insert(internal.clone(), external);
                    }
                }
            }

            let created_at = inspect
                .created
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|ts| ts.with_timezone(&Utc));

            managed.push(ManagedContainer {
                id,
                name,
                state,
                labels: container_labels,
                ports,
                created_at,
            });
        }
        Ok(managed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_status_strings_are_stable() {
        assert_eq!(
            DockerDriver::status_str(ContainerStateStatusEnum::RUNNING),
            "running"
        );
        assert_eq!(
            DockerDriver::status_str(ContainerStateStatusEnum::EXITED),
            "exited"
        );
        assert_eq!(
            DockerDriver::status_str(ContainerStateStatusEnum::EMPTY),
            "unknown"
        );
    }

    #[test]
    fn port_probe_skips_bound_ports() {
        let prober = PortProber::new(100);
        let taken = TcpListener::bind(("0.0.0.0", 45710)).expect("test port busy");

        let port = prober.find_available(45710).unwrap();
        assert_ne!(port, 45710);
        assert!((45711..45810).contains(&port));
        drop(taken);
    }

    #[test]
    fn consecutive_probes_never_hand_out_the_same_port() {
        let prober = PortProber::new(100);
        let first = prober.find_available(45900).unwrap();
        let second = prober.find_available(45900).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn binding_map_has_engine_shape() {
        let spec = ContainerSpec {
            image: "labdock/vscode-python:latest".to_string(),
            name: "labdock-test".to_string(),
            ports: [("8080/tcp".to_string(), 31000)].into_iter().collect(),
            volumes: Vec::new(),
            env: HashMap::new(),
            labels: HashMap::new(),
            cpu_limit: 1.0,
            memory_limit: 1024,
        };
        let bindings = DockerDriver::port_bindings(&spec);
        let binding = bindings["8080/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("31000"));
    }
}
