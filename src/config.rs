//! Control plane configuration
//!
//! Loaded from a TOML file found via `--config`, `SITEPLANE_CONFIG`, the
//! system path or the user config dir, with every field defaulted.
//! `validate` rejects settings the pipeline cannot run with.

use crate::ports::PortRange;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SITEPLANE_CONFIG";

/// System-wide config location
pub const SYSTEM_CONFIG_PATH: &str = "/etc/siteplane/config.toml";

/// Control plane configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Ports handed out to sites, inclusive
    #[serde(default)]
    pub port_range: PortRange,

    /// One directory per site lives under here
    #[serde(default = "default_site_root_path")]
    pub site_root_path: PathBuf,

    /// Directory the reverse proxy includes rule files from
    #[serde(default = "default_proxy_config_dir")]
    pub proxy_config_dir: PathBuf,

    /// SQLite registry file
    #[serde(default = "default_registry_store_path")]
    pub registry_store_path: PathBuf,

    /// Skip ports something else on the host is already bound to
    #[serde(default = "default_true")]
    pub probe_host_ports: bool,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Validates a staged rule. `{config}` is a wrapper config including
    /// the rule, `{rule}` the staged rule itself.
    #[serde(default = "default_validate_command")]
    pub validate_command: Vec<String>,

    /// Makes the proxy pick up the active directory
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,

    /// Where rules are written before validation (default:
    /// `<proxy_config_dir>/.siteplane-staging`, so the final move is a
    /// same-filesystem rename)
    pub staging_dir: Option<PathBuf>,

    /// Certificates are read from `<cert_dir>/<domain>/fullchain.pem` and
    /// `privkey.pem`
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Also route `www.<domain>`
    #[serde(default = "default_true")]
    pub www_alias: bool,

    /// Upstream connect/send/read timeout written into rules
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// pm2-compatible supervisor command line
    #[serde(default = "default_supervisor")]
    pub supervisor: Vec<String>,

    /// Command the supervisor runs, split with shell quoting rules
    #[serde(default = "default_start_command")]
    pub start_command: String,

    /// Run when the site has a `package.json`
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,

    /// Run when `package.json` defines `scripts.build`
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,

    #[serde(default = "default_node_env")]
    pub node_env: String,

    /// Supervisor restarts the process above this memory use
    #[serde(default = "default_max_memory_restart")]
    pub max_memory_restart: String,

    /// Extra environment for every process site
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainerConfig {
    /// Compose command line (`docker compose` or `docker-compose`)
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,

    /// Image for the app service when the site ships no Dockerfile
    #[serde(default = "default_app_image")]
    pub app_image: String,

    /// Port the app listens on inside its container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Where the site's files are mounted when it ships no Dockerfile
    #[serde(default = "default_files_mount")]
    pub files_mount: String,

    #[serde(default = "default_data_store_image")]
    pub data_store_image: String,

    #[serde(default = "default_database_name")]
    pub database_name: String,

    #[serde(default = "default_database_user")]
    pub database_user: String,

    /// Prefix for the database variables given to the app service
    /// (`<prefix>DB_HOST`, `<prefix>DB_NAME`, ...)
    #[serde(default = "default_db_env_prefix")]
    pub db_env_prefix: String,

    /// Runs inside the app service after an import when a URL rewrite is
    /// requested. `{from}` and `{to}` are substituted.
    #[serde(default = "default_rewrite_command")]
    pub rewrite_command: Vec<String>,

    /// Docker API endpoint for status queries (default: local socket)
    pub docker_host: Option<String>,

    /// Extra environment for the app service
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct TimeoutsConfig {
    /// Each install or build command
    #[serde(default = "default_build_timeout")]
    pub build_secs: u64,

    /// Starting the workload
    #[serde(default = "default_start_timeout")]
    pub start_secs: u64,

    /// Stopping the workload
    #[serde(default = "default_stop_timeout")]
    pub stop_secs: u64,

    /// Each proxy validate or reload command
    #[serde(default = "default_proxy_timeout")]
    pub proxy_secs: u64,

    /// Loading a dump and rewriting URLs
    #[serde(default = "default_import_timeout")]
    pub import_secs: u64,
}

impl TimeoutsConfig {
    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }

    pub fn proxy(&self) -> Duration {
        Duration::from_secs(self.proxy_secs)
    }

    pub fn import(&self) -> Duration {
        Duration::from_secs(self.import_secs)
    }

    /// Upper bound for a whole materialize step: stop the old workload,
    /// install, build, start
    pub fn materialize(&self) -> Duration {
        Duration::from_secs(self.stop_secs + 2 * self.build_secs + self.start_secs)
    }

    /// Upper bound for a whole route step: validate and reload
    pub fn route(&self) -> Duration {
        Duration::from_secs(2 * self.proxy_secs + 5)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            build_secs: default_build_timeout(),
            start_secs: default_start_timeout(),
            stop_secs: default_stop_timeout(),
            proxy_secs: default_proxy_timeout(),
            import_secs: default_import_timeout(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            validate_command: default_validate_command(),
            reload_command: default_reload_command(),
            staging_dir: None,
            cert_dir: default_cert_dir(),
            www_alias: true,
            upstream_timeout_secs: default_upstream_timeout(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            supervisor: default_supervisor(),
            start_command: default_start_command(),
            install_command: default_install_command(),
            build_command: default_build_command(),
            node_env: default_node_env(),
            max_memory_restart: default_max_memory_restart(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            compose_command: default_compose_command(),
            app_image: default_app_image(),
            container_port: default_container_port(),
            files_mount: default_files_mount(),
            data_store_image: default_data_store_image(),
            database_name: default_database_name(),
            database_user: default_database_user(),
            db_env_prefix: default_db_env_prefix(),
            rewrite_command: default_rewrite_command(),
            docker_host: None,
            env: BTreeMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            site_root_path: default_site_root_path(),
            proxy_config_dir: default_proxy_config_dir(),
            registry_store_path: default_registry_store_path(),
            probe_host_ports: true,
            proxy: ProxyConfig::default(),
            process: ProcessConfig::default(),
            container: ContainerConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_site_root_path() -> PathBuf {
    PathBuf::from("/var/www/domains")
}

fn default_proxy_config_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d")
}

fn default_registry_store_path() -> PathBuf {
    PathBuf::from("/var/lib/siteplane/registry.db")
}

fn default_validate_command() -> Vec<String> {
    vec!["nginx".into(), "-t".into(), "-q".into(), "-c".into(), "{config}".into()]
}

fn default_reload_command() -> Vec<String> {
    vec!["systemctl".into(), "reload".into(), "nginx".into()]
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_supervisor() -> Vec<String> {
    vec!["pm2".into()]
}

fn default_start_command() -> String {
    "npm start".to_string()
}

fn default_install_command() -> Vec<String> {
    vec!["npm".into(), "install".into()]
}

fn default_build_command() -> Vec<String> {
    vec!["npm".into(), "run".into(), "build".into()]
}

fn default_node_env() -> String {
    "production".to_string()
}

fn default_max_memory_restart() -> String {
    "1G".to_string()
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".into(), "compose".into()]
}

fn default_app_image() -> String {
    "wordpress:latest".to_string()
}

fn default_container_port() -> u16 {
    80
}

fn default_files_mount() -> String {
    "/var/www/html/wp-content".to_string()
}

fn default_data_store_image() -> String {
    "mysql:8.0".to_string()
}

fn default_database_name() -> String {
    "site".to_string()
}

fn default_database_user() -> String {
    "site".to_string()
}

fn default_db_env_prefix() -> String {
    "WORDPRESS_".to_string()
}

fn default_rewrite_command() -> Vec<String> {
    ["wp", "search-replace", "{from}", "{to}", "--all-tables", "--allow-root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_build_timeout() -> u64 {
    900 // 15 minutes
}

fn default_start_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    60
}

fn default_proxy_timeout() -> u64 {
    30
}

fn default_import_timeout() -> u64 {
    1800
}

impl Config {
    /// Load and validate a config file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Pick the config file to use: explicit path, then `SITEPLANE_CONFIG`,
    /// then the system path, then the user config dir. `None` means run on
    /// defaults.
    pub fn resolve_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
        if explicit.is_some() {
            return explicit;
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Some(system);
        }

        dirs_next::config_dir()
            .map(|dir| dir.join("siteplane").join("config.toml"))
            .filter(|path| path.exists())
    }

    /// Staging directory for proxy rules
    pub fn proxy_staging_dir(&self) -> PathBuf {
        self.proxy
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.proxy_config_dir.join(".siteplane-staging"))
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.port_range.low == 0 {
            errors.push("port_range: low must be greater than 0".to_string());
        }
        if self.port_range.low > self.port_range.high {
            errors.push(format!(
                "port_range: low ({}) must not exceed high ({})",
                self.port_range.low, self.port_range.high
            ));
        }

        for (key, path) in [
            ("site_root_path", &self.site_root_path),
            ("proxy_config_dir", &self.proxy_config_dir),
            ("registry_store_path", &self.registry_store_path),
        ] {
            if path.as_os_str().is_empty() {
                errors.push(format!("{} must not be empty", key));
            }
        }

        for (key, argv) in [
            ("proxy.validate_command", &self.proxy.validate_command),
            ("proxy.reload_command", &self.proxy.reload_command),
            ("process.supervisor", &self.process.supervisor),
            ("process.install_command", &self.process.install_command),
            ("process.build_command", &self.process.build_command),
            ("container.compose_command", &self.container.compose_command),
        ] {
            if argv.is_empty() {
                errors.push(format!("{} must not be empty", key));
            }
        }

        match shell_words::split(&self.process.start_command) {
            Ok(words) if words.is_empty() => {
                errors.push("process.start_command must not be empty".to_string())
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("process.start_command: {}", e)),
        }

        if self.container.container_port == 0 {
            errors.push("container.container_port must be greater than 0".to_string());
        }

        for (key, secs) in [
            ("timeouts.build_secs", self.timeouts.build_secs),
            ("timeouts.start_secs", self.timeouts.start_secs),
            ("timeouts.stop_secs", self.timeouts.stop_secs),
            ("timeouts.proxy_secs", self.timeouts.proxy_secs),
            ("timeouts.import_secs", self.timeouts.import_secs),
        ] {
            if secs == 0 {
                errors.push(format!("{} must be greater than 0", key));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
