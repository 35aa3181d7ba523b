//! Docker API access for container sites
//!
//! Stacks are started and stopped through the compose CLI; this module only
//! reads their live state from the daemon, matching containers by compose
//! project label.

use bollard::container::ListContainersOptions;
use bollard::Docker;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Label compose puts on every container of a project
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label compose puts on every container with its service name
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// One container of a compose project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContainer {
    pub service: String,
    /// Docker state string (`running`, `exited`, `restarting`, ...)
    pub state: String,
}

impl ServiceContainer {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

pub struct DockerManager {
    client: Docker,
}

/// Shared reference to a Docker manager
pub type SharedDockerManager = Arc<DockerManager>;

impl DockerManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Self::connect_with_defaults().await?
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths = [
            "/var/run/docker.sock".to_string(),
            "/run/docker.sock".to_string(),
            format!("{}/docker.sock", xdg_runtime),
            format!("{}/podman/podman.sock", xdg_runtime),
        ];

        for path in &socket_paths {
            if path.starts_with('/') && std::path::Path::new(path).exists() {
                debug!(path = %path, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults()
            .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))
    }

    /// All containers (running or not) belonging to a compose project
    pub async fn project_containers(&self, project: &str) -> anyhow::Result<Vec<ServiceContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", COMPOSE_PROJECT_LABEL, project)],
        );

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ServiceContainer {
                service: c
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(COMPOSE_SERVICE_LABEL).cloned())
                    .unwrap_or_default(),
                state: c.state.unwrap_or_default(),
            })
            .collect())
    }
}
