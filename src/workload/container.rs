//! Container sites as compose stacks
//!
//! A stack is an `app` service plus a `db` data store sharing one compose
//! project (`site-<name>`). The compose file and the stack's generated
//! credentials live next to the site's files, so redeploys reuse the same
//! data volume with the same password.

use super::{write_site_files, SiteLayout, WorkloadDriver, WorkloadError, WorkloadRef, WorkloadStatus};
use crate::command::{self, CommandOutput};
use crate::config::{ContainerConfig, TimeoutsConfig};
use crate::docker::{DockerManager, ServiceContainer, SharedDockerManager};
use crate::site::Site;
use futures::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Compose project prefix
pub const PROJECT_PREFIX: &str = "site-";

/// Services every stack runs
pub const STACK_SERVICES: [&str; 2] = ["app", "db"];

const DATA_VOLUME: &str = "db-data";

/// Credentials generated once per stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackCredentials {
    pub db_password: String,
    pub db_root_password: String,
}

impl StackCredentials {
    pub fn generate() -> Self {
        Self {
            db_password: random_secret(32),
            db_root_password: random_secret(32),
        }
    }
}

fn random_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Serialize)]
struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
    volumes: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Default, Serialize)]
struct ComposeService {
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build: Option<String>,
    restart: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    depends_on: BTreeMap<String, DependsOn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<Healthcheck>,
}

#[derive(Debug, Serialize)]
struct DependsOn {
    condition: String,
}

#[derive(Debug, Serialize)]
struct Healthcheck {
    test: Vec<String>,
    interval: String,
    timeout: String,
    retries: u32,
}

/// How the app service gets its code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSource {
    /// Build the site's own Dockerfile
    Dockerfile,
    /// Run the configured image, mounting the site's files
    ImageWithFiles,
    /// Run the configured image as is
    Image,
}

impl AppSource {
    pub fn detect(files: &BTreeMap<String, String>) -> Self {
        if files.contains_key("Dockerfile") {
            AppSource::Dockerfile
        } else if files.is_empty() {
            AppSource::Image
        } else {
            AppSource::ImageWithFiles
        }
    }
}

/// Render the compose file for one stack
pub fn render_compose(
    port: u16,
    source: AppSource,
    credentials: &StackCredentials,
    config: &ContainerConfig,
) -> Result<String, WorkloadError> {
    let prefix = &config.db_env_prefix;

    let mut app_env = config.env.clone();
    app_env.insert("PORT".to_string(), config.container_port.to_string());
    app_env.insert(format!("{}DB_HOST", prefix), "db".to_string());
    app_env.insert(format!("{}DB_NAME", prefix), config.database_name.clone());
    app_env.insert(format!("{}DB_USER", prefix), config.database_user.clone());
    app_env.insert(format!("{}DB_PASSWORD", prefix), credentials.db_password.clone());

    let mut app = ComposeService {
        restart: "unless-stopped".to_string(),
        ports: vec![format!("127.0.0.1:{}:{}", port, config.container_port)],
        environment: app_env,
        ..Default::default()
    };
    match source {
        AppSource::Dockerfile => app.build = Some("./app".to_string()),
        AppSource::ImageWithFiles => {
            app.image = Some(config.app_image.clone());
            app.volumes = vec![format!("./app:{}", config.files_mount)];
        }
        AppSource::Image => app.image = Some(config.app_image.clone()),
    }
    app.depends_on.insert(
        "db".to_string(),
        DependsOn {
            condition: "service_healthy".to_string(),
        },
    );

    let mut db_env = BTreeMap::new();
    db_env.insert("MYSQL_DATABASE".to_string(), config.database_name.clone());
    db_env.insert("MYSQL_USER".to_string(), config.database_user.clone());
    db_env.insert("MYSQL_PASSWORD".to_string(), credentials.db_password.clone());
    db_env.insert("MYSQL_ROOT_PASSWORD".to_string(), credentials.db_root_password.clone());

    let db = ComposeService {
        image: Some(config.data_store_image.clone()),
        restart: "unless-stopped".to_string(),
        environment: db_env,
        volumes: vec![format!("{}:/var/lib/mysql", DATA_VOLUME)],
        healthcheck: Some(Healthcheck {
            test: ["CMD", "mysqladmin", "ping", "-h", "localhost"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
            retries: 10,
        }),
        ..Default::default()
    };

    let mut services = BTreeMap::new();
    services.insert("app".to_string(), app);
    services.insert("db".to_string(), db);

    let mut volumes = BTreeMap::new();
    volumes.insert(DATA_VOLUME.to_string(), BTreeMap::new());

    serde_yaml::to_string(&ComposeFile { services, volumes })
        .map_err(|e| WorkloadError::Start { output: format!("cannot render compose file: {}", e) })
}

/// Combine container states into a stack status. A stack that is only
/// partly running is `Unknown`.
pub fn stack_status(containers: &[ServiceContainer]) -> WorkloadStatus {
    let running = STACK_SERVICES
        .iter()
        .filter(|service| {
            containers
                .iter()
                .any(|c| c.service == **service && c.is_running())
        })
        .count();

    if running == STACK_SERVICES.len() {
        WorkloadStatus::Running
    } else if running == 0 {
        WorkloadStatus::Stopped
    } else {
        WorkloadStatus::Unknown
    }
}

pub struct ContainerDriver {
    layout: SiteLayout,
    config: ContainerConfig,
    timeouts: TimeoutsConfig,
    /// Docker manager (lazily initialized on the first status query)
    docker: tokio::sync::OnceCell<SharedDockerManager>,
}

impl ContainerDriver {
    pub fn new(layout: SiteLayout, config: ContainerConfig, timeouts: TimeoutsConfig) -> Self {
        Self {
            layout,
            config,
            timeouts,
            docker: tokio::sync::OnceCell::new(),
        }
    }

    fn site_name<'r>(workload_ref: &'r WorkloadRef) -> &'r str {
        workload_ref
            .as_str()
            .strip_prefix(PROJECT_PREFIX)
            .unwrap_or(workload_ref.as_str())
    }

    /// `<compose> -p <project> [-f <file>] <args...>`
    fn compose(&self, workload_ref: &WorkloadRef, args: &[&str]) -> Result<tokio::process::Command, WorkloadError> {
        let compose_file = self.layout.compose_file(Self::site_name(workload_ref));

        let mut argv = self.config.compose_command.clone();
        argv.push("-p".to_string());
        argv.push(workload_ref.as_str().to_string());
        if compose_file.exists() {
            argv.push("-f".to_string());
            argv.push(compose_file.to_string_lossy().to_string());
        }
        argv.extend(args.iter().map(|s| s.to_string()));

        Ok(command::command_from(&argv)?)
    }

    async fn run_compose(
        &self,
        workload_ref: &WorkloadRef,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, WorkloadError> {
        let mut cmd = self.compose(workload_ref, args)?;
        Ok(command::run(&mut cmd, timeout).await?)
    }

    async fn docker(&self) -> anyhow::Result<&SharedDockerManager> {
        self.docker
            .get_or_try_init(|| async {
                let manager = DockerManager::new(self.config.docker_host.as_deref()).await?;
                Ok::<_, anyhow::Error>(Arc::new(manager))
            })
            .await
    }

    /// Read the stack's credentials, generating and persisting them on
    /// first deploy
    async fn credentials(&self, site_name: &str) -> Result<StackCredentials, WorkloadError> {
        let path = self.layout.stack_file(site_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                if let Ok(credentials) = serde_json::from_str(&content) {
                    return Ok(credentials);
                }
                warn!(site = site_name, path = %path.display(), "Stack credentials unreadable, regenerating");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(WorkloadError::io(&path, e)),
        }

        let credentials = StackCredentials::generate();
        let content = serde_json::to_string_pretty(&credentials)
            .map_err(|e| WorkloadError::Start { output: e.to_string() })?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| WorkloadError::io(&path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| WorkloadError::io(&path, e))?;
        }

        Ok(credentials)
    }

    async fn up(&self, site: &Site, port: u16, files: &BTreeMap<String, String>, workload_ref: &WorkloadRef) -> Result<(), WorkloadError> {
        let credentials = self.credentials(&site.name).await?;
        let compose = render_compose(port, AppSource::detect(files), &credentials, &self.config)?;

        let compose_path = self.layout.compose_file(&site.name);
        tokio::fs::write(&compose_path, compose)
            .await
            .map_err(|e| WorkloadError::io(&compose_path, e))?;

        let timeout = self.timeouts.build() + self.timeouts.start();
        let output = self
            .run_compose(workload_ref, &["up", "-d", "--build", "--remove-orphans"], timeout)
            .await?;
        if !output.success {
            return Err(WorkloadError::Start { output: output.tail() });
        }
        Ok(())
    }
}

impl WorkloadDriver for ContainerDriver {
    fn workload_ref(&self, site_name: &str) -> WorkloadRef {
        WorkloadRef::new(format!("{}{}", PROJECT_PREFIX, site_name))
    }

    fn materialize<'a>(
        &'a self,
        site: &'a Site,
        files: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<WorkloadRef, WorkloadError>> {
        Box::pin(async move {
            let port = site.port.ok_or_else(|| WorkloadError::NoPort(site.name.clone()))?;
            let workload_ref = self.workload_ref(&site.name);

            self.stop(&workload_ref).await?;
            write_site_files(&self.layout.app_dir(&site.name), files).await?;

            if let Err(e) = self.up(site, port, files, &workload_ref).await {
                if let Err(stop_err) = self.stop(&workload_ref).await {
                    warn!(site = %site.name, error = %stop_err, "Cleanup after failed start did not complete");
                }
                return Err(e);
            }

            info!(site = %site.name, project = %workload_ref, port, "Stack started");
            Ok(workload_ref)
        })
    }

    fn stop<'a>(&'a self, workload_ref: &'a WorkloadRef) -> BoxFuture<'a, Result<(), WorkloadError>> {
        Box::pin(async move {
            let output = self
                .run_compose(workload_ref, &["down", "--remove-orphans"], self.timeouts.stop())
                .await?;
            if output.success {
                debug!(project = %workload_ref, "Stack down");
                Ok(())
            } else {
                Err(WorkloadError::Stop { output: output.tail() })
            }
        })
    }

    fn status<'a>(&'a self, workload_ref: &'a WorkloadRef) -> BoxFuture<'a, WorkloadStatus> {
        Box::pin(async move {
            let docker = match self.docker().await {
                Ok(docker) => docker,
                Err(e) => {
                    warn!(project = %workload_ref, error = %e, "Docker unavailable");
                    return WorkloadStatus::Unknown;
                }
            };

            match docker.project_containers(workload_ref.as_str()).await {
                Ok(containers) => stack_status(&containers),
                Err(e) => {
                    warn!(project = %workload_ref, error = %e, "Could not list stack containers");
                    WorkloadStatus::Unknown
                }
            }
        })
    }

    fn discard<'a>(&'a self, site_name: &'a str) -> BoxFuture<'a, Result<(), WorkloadError>> {
        Box::pin(async move {
            let workload_ref = self.workload_ref(site_name);
            let output = self
                .run_compose(&workload_ref, &["down", "-v", "--remove-orphans"], self.timeouts.stop())
                .await?;
            if !output.success {
                return Err(WorkloadError::Stop { output: output.tail() });
            }
            self.layout.remove_site(site_name).await
        })
    }

    fn import_data<'a>(
        &'a self,
        site: &'a Site,
        dump: &'a Path,
        rewrite_urls: Option<&'a (String, String)>,
    ) -> BoxFuture<'a, Result<(), WorkloadError>> {
        Box::pin(async move {
            let workload_ref = self.workload_ref(&site.name);
            if !self.layout.compose_file(&site.name).exists() {
                return Err(WorkloadError::Import {
                    output: format!("site '{}' has no stack on disk", site.name),
                });
            }

            let dump_file = tokio::fs::File::open(dump)
                .await
                .map_err(|e| WorkloadError::io(dump, e))?
                .into_std()
                .await;

            // Credentials come from the db container's own environment
            let mut load = self.compose(
                &workload_ref,
                &[
                    "exec",
                    "-T",
                    "db",
                    "sh",
                    "-c",
                    "exec mysql -u\"$MYSQL_USER\" -p\"$MYSQL_PASSWORD\" \"$MYSQL_DATABASE\"",
                ],
            )?;
            load.stdin(Stdio::from(dump_file));

            info!(site = %site.name, dump = %dump.display(), "Importing data dump");
            let output = command::run(&mut load, self.timeouts.import()).await?;
            if !output.success {
                return Err(WorkloadError::Import { output: output.tail() });
            }

            if let Some((from, to)) = rewrite_urls {
                let rewrite = command::expand(
                    &self.config.rewrite_command,
                    &[("from", from.as_str()), ("to", to.as_str())],
                );
                let mut args: Vec<&str> = vec!["exec", "-T", "app"];
                args.extend(rewrite.iter().map(String::as_str));

                info!(site = %site.name, from = %from, to = %to, "Rewriting URLs");
                let output = self.run_compose(&workload_ref, &args, self.timeouts.import()).await?;
                if !output.success {
                    return Err(WorkloadError::Import { output: output.tail() });
                }
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> StackCredentials {
        StackCredentials {
            db_password: "secret".to_string(),
            db_root_password: "rootsecret".to_string(),
        }
    }

    fn container(service: &str, state: &str) -> ServiceContainer {
        ServiceContainer {
            service: service.to_string(),
            state: state.to_string(),
        }
    }

    #[test]
    fn test_render_compose_image_stack() {
        let config = ContainerConfig::default();
        let rendered = render_compose(3005, AppSource::Image, &credentials(), &config).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();

        let app = &value["services"]["app"];
        assert_eq!(app["image"].as_str(), Some("wordpress:latest"));
        assert_eq!(app["ports"][0].as_str(), Some("127.0.0.1:3005:80"));
        assert_eq!(app["environment"]["WORDPRESS_DB_HOST"].as_str(), Some("db"));
        assert_eq!(app["environment"]["WORDPRESS_DB_PASSWORD"].as_str(), Some("secret"));
        assert_eq!(app["depends_on"]["db"]["condition"].as_str(), Some("service_healthy"));
        assert!(app.get("build").is_none());
        assert!(app.get("volumes").is_none());

        let db = &value["services"]["db"];
        assert_eq!(db["image"].as_str(), Some("mysql:8.0"));
        assert_eq!(db["environment"]["MYSQL_ROOT_PASSWORD"].as_str(), Some("rootsecret"));
        assert_eq!(db["healthcheck"]["test"][2].as_str(), Some("ping"));
        assert!(value["volumes"].get("db-data").is_some());
    }

    #[test]
    fn test_render_compose_sources() {
        let config = ContainerConfig {
            db_env_prefix: String::new(),
            ..ContainerConfig::default()
        };

        let rendered = render_compose(3001, AppSource::Dockerfile, &credentials(), &config).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(value["services"]["app"]["build"].as_str(), Some("./app"));
        assert!(value["services"]["app"].get("image").is_none());
        assert_eq!(value["services"]["app"]["environment"]["DB_NAME"].as_str(), Some("site"));

        let rendered = render_compose(3001, AppSource::ImageWithFiles, &credentials(), &config).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(
            value["services"]["app"]["volumes"][0].as_str(),
            Some("./app:/var/www/html/wp-content")
        );
    }

    #[test]
    fn test_app_source_detect() {
        let mut files = BTreeMap::new();
        assert_eq!(AppSource::detect(&files), AppSource::Image);
        files.insert("themes/custom/style.css".to_string(), String::new());
        assert_eq!(AppSource::detect(&files), AppSource::ImageWithFiles);
        files.insert("Dockerfile".to_string(), "FROM nginx".to_string());
        assert_eq!(AppSource::detect(&files), AppSource::Dockerfile);
    }

    #[test]
    fn test_stack_status() {
        assert_eq!(stack_status(&[]), WorkloadStatus::Stopped);
        assert_eq!(
            stack_status(&[container("app", "running"), container("db", "running")]),
            WorkloadStatus::Running
        );
        assert_eq!(
            stack_status(&[container("app", "exited"), container("db", "exited")]),
            WorkloadStatus::Stopped
        );
        assert_eq!(
            stack_status(&[container("app", "restarting"), container("db", "running")]),
            WorkloadStatus::Unknown
        );
    }

    #[test]
    fn test_generated_credentials() {
        let credentials = StackCredentials::generate();
        assert_eq!(credentials.db_password.len(), 32);
        assert!(credentials.db_password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(credentials.db_password, credentials.db_root_password);
    }

    fn fake_compose(dir: &Path) -> (Vec<String>, std::path::PathBuf) {
        let script = dir.join("compose.sh");
        let log = dir.join("compose.log");
        std::fs::write(
            &script,
            r#"log="$1"; shift
echo "$@" >> "$log"
case "$*" in
  *" exec -T db "*) cat > "$log.dump" ;;
esac
exit 0
"#,
        )
        .unwrap();
        (
            vec!["sh".to_string(), script.to_string_lossy().to_string(), log.to_string_lossy().to_string()],
            log,
        )
    }

    fn log_lines(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    fn driver(dir: &Path, compose_command: Vec<String>) -> ContainerDriver {
        let config = ContainerConfig {
            compose_command,
            ..ContainerConfig::default()
        };
        ContainerDriver::new(SiteLayout::new(dir.join("sites")), config, TimeoutsConfig::default())
    }

    #[tokio::test]
    async fn test_materialize_writes_stack_and_keeps_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (compose, log) = fake_compose(dir.path());
        let driver = driver(dir.path(), compose);

        let mut site = Site::pending("shop", crate::site::SiteKind::Container, "shop.example.com");
        site.port = Some(3002);
        let files = BTreeMap::new();

        let workload_ref = driver.materialize(&site, &files).await.unwrap();
        assert_eq!(workload_ref.as_str(), "site-shop");

        let layout = SiteLayout::new(dir.path().join("sites"));
        assert!(layout.compose_file("shop").exists());
        let first = std::fs::read_to_string(layout.stack_file("shop")).unwrap();

        driver.materialize(&site, &files).await.unwrap();
        let second = std::fs::read_to_string(layout.stack_file("shop")).unwrap();
        assert_eq!(first, second);

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("-p site-shop"));
        assert!(calls.contains("up -d --build"));
        assert!(calls.contains("down --remove-orphans"));
    }

    #[tokio::test]
    async fn test_failed_up_is_followed_by_down() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("compose.sh");
        let log = dir.path().join("compose.log");
        std::fs::write(
            &script,
            r#"log="$1"; shift
echo "$@" >> "$log"
case "$*" in
  *" up -d "*) echo "Error response from daemon: port is already allocated" >&2; exit 1 ;;
esac
exit 0
"#,
        )
        .unwrap();
        let compose = vec![
            "sh".to_string(),
            script.to_string_lossy().to_string(),
            log.to_string_lossy().to_string(),
        ];
        let driver = driver(dir.path(), compose);

        let mut site = Site::pending("shop", crate::site::SiteKind::Container, "shop.example.com");
        site.port = Some(3002);

        let err = driver.materialize(&site, &BTreeMap::new()).await.unwrap_err();
        match err {
            WorkloadError::Start { output } => assert!(output.contains("already allocated")),
            other => panic!("expected start error, got {:?}", other),
        }

        let calls = log_lines(&log);
        let up = calls
            .iter()
            .position(|c| c.contains("up -d --build"))
            .expect("compose up was called");
        assert!(calls[up + 1..].iter().any(|c| c.contains("down --remove-orphans")));
    }

    #[tokio::test]
    async fn test_import_pipes_dump_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let (compose, log) = fake_compose(dir.path());
        let driver = driver(dir.path(), compose);

        let mut site = Site::pending("shop", crate::site::SiteKind::Container, "shop.example.com");
        site.port = Some(3002);
        driver.materialize(&site, &BTreeMap::new()).await.unwrap();

        let dump = dir.path().join("dump.sql");
        std::fs::write(&dump, "CREATE TABLE t (id INT);\n").unwrap();
        let rewrite = ("http://old.example.com".to_string(), "https://shop.example.com".to_string());

        driver.import_data(&site, &dump, Some(&rewrite)).await.unwrap();

        let piped = std::fs::read_to_string(format!("{}.dump", log.display())).unwrap();
        assert_eq!(piped, "CREATE TABLE t (id INT);\n");
        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("exec -T app wp search-replace http://old.example.com https://shop.example.com"));
    }

    #[tokio::test]
    async fn test_import_without_stack_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (compose, _) = fake_compose(dir.path());
        let driver = driver(dir.path(), compose);
        let site = Site::pending("ghost", crate::site::SiteKind::Container, "ghost.example.com");

        let result = driver.import_data(&site, Path::new("/nonexistent.sql"), None).await;
        assert!(matches!(result, Err(WorkloadError::Import { .. })));
    }
}
