//! Reverse-proxy rule management (nginx)
//!
//! One rule file per domain lives in the active directory the proxy
//! includes. A rule is written to a staging directory first and checked by
//! the proxy binary; only a valid rule is renamed into the active
//! directory, followed by a reload.

use crate::command::{self, CommandError};
use crate::config::Config;
use crate::site::DomainConfig;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// First line of every rule this crate writes. Files without it are never
/// touched.
pub const RULE_MARKER: &str = "# Managed by siteplane:";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy rejected the rule for {domain}:\n{output}")]
    Validation { domain: String, output: String },
    #[error("proxy reload failed:\n{output}")]
    Reload { output: String },
    #[error("proxy rule I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ProxyError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Deterministic rule file name for a domain
pub fn rule_file_name(domain: &str) -> String {
    format!("{}.conf", domain)
}

pub struct ProxyConfigManager {
    active_dir: PathBuf,
    staging_dir: PathBuf,
    validate_command: Vec<String>,
    reload_command: Vec<String>,
    cert_dir: PathBuf,
    www_alias: bool,
    upstream_timeout_secs: u64,
    command_timeout: Duration,
}

impl ProxyConfigManager {
    pub fn new(active_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        let defaults = crate::config::ProxyConfig::default();
        Self {
            active_dir: active_dir.into(),
            staging_dir: staging_dir.into(),
            validate_command: defaults.validate_command,
            reload_command: defaults.reload_command,
            cert_dir: defaults.cert_dir,
            www_alias: defaults.www_alias,
            upstream_timeout_secs: defaults.upstream_timeout_secs,
            command_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            active_dir: config.proxy_config_dir.clone(),
            staging_dir: config.proxy_staging_dir(),
            validate_command: config.proxy.validate_command.clone(),
            reload_command: config.proxy.reload_command.clone(),
            cert_dir: config.proxy.cert_dir.clone(),
            www_alias: config.proxy.www_alias,
            upstream_timeout_secs: config.proxy.upstream_timeout_secs,
            command_timeout: config.timeouts.proxy(),
        }
    }

    pub fn with_commands(mut self, validate: Vec<String>, reload: Vec<String>) -> Self {
        self.validate_command = validate;
        self.reload_command = reload;
        self
    }

    pub fn with_www_alias(mut self, enabled: bool) -> Self {
        self.www_alias = enabled;
        self
    }

    pub fn with_cert_dir(mut self, cert_dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = cert_dir.into();
        self
    }

    pub fn active_dir(&self) -> &Path {
        &self.active_dir
    }

    pub fn rule_path(&self, domain: &str) -> PathBuf {
        self.active_dir.join(rule_file_name(domain))
    }

    /// Whether an active rule exists for `domain`
    pub fn has_rule(&self, domain: &str) -> bool {
        self.rule_path(domain).exists()
    }

    /// Names a rule for `domain` routes: the domain, its aliases and, when
    /// enabled, the `www.` variant
    pub fn routed_names(&self, domain: &str, aliases: &[String]) -> Vec<String> {
        let mut names = vec![domain.to_string()];
        for alias in aliases {
            if !names.contains(alias) {
                names.push(alias.clone());
            }
        }
        if self.www_alias && !domain.starts_with("www.") {
            let www = format!("www.{}", domain);
            if !names.contains(&www) {
                names.push(www);
            }
        }
        names
    }

    /// Render the nginx rule for one site
    pub fn render_rule(&self, config: &DomainConfig) -> String {
        let names = self.routed_names(&config.domain, &config.aliases).join(" ");
        let t = self.upstream_timeout_secs;
        let location = format!(
            r#"    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
        proxy_connect_timeout {t}s;
        proxy_send_timeout {t}s;
        proxy_read_timeout {t}s;
    }}
"#,
            port = config.target_port,
            t = t
        );

        let mut rule = format!("{} {}\n", RULE_MARKER, config.domain);

        if config.tls_enabled {
            let cert_dir = self.cert_dir.join(&config.domain);
            rule.push_str(&format!(
                r#"server {{
    listen 80;
    listen [::]:80;
    server_name {names};
    return 301 https://$host$request_uri;
}}

server {{
    listen 443 ssl;
    listen [::]:443 ssl;
    server_name {names};

    ssl_certificate {cert};
    ssl_certificate_key {key};

{location}}}
"#,
                names = names,
                cert = cert_dir.join("fullchain.pem").display(),
                key = cert_dir.join("privkey.pem").display(),
                location = location
            ));
        } else {
            rule.push_str(&format!(
                r#"server {{
    listen 80;
    listen [::]:80;
    server_name {names};

{location}}}
"#,
                names = names,
                location = location
            ));
        }

        rule
    }

    /// Stage, validate, activate and reload the rule for a site. A rule the
    /// proxy rejects never reaches the active directory.
    pub async fn apply(&self, config: &DomainConfig) -> Result<(), ProxyError> {
        let domain = config.domain.as_str();
        self.ensure_dirs().await?;

        let staged = self.stage(&self.render_rule(config))?;
        self.validate(domain, staged.path()).await?;

        let active = self.rule_path(domain);
        let previous = match tokio::fs::read_to_string(&active).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ProxyError::io(&active, e)),
        };

        staged
            .persist(&active)
            .map_err(|e| ProxyError::io(&active, e.error))?;
        debug!(domain, path = %active.display(), "Rule activated");

        if let Err(e) = self.reload().await {
            self.restore(&active, previous).await;
            return Err(e);
        }

        info!(domain, port = config.target_port, "Proxy rule applied");
        Ok(())
    }

    /// Remove the rule for `domain` if present, reloading only when a file
    /// was removed. Returns whether a rule existed.
    pub async fn remove(&self, domain: &str) -> Result<bool, ProxyError> {
        let path = self.rule_path(domain);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(domain, "No rule to remove");
                return Ok(false);
            }
            Err(e) => return Err(ProxyError::io(&path, e)),
        }

        self.reload().await?;
        info!(domain, "Proxy rule removed");
        Ok(true)
    }

    /// Ask the proxy to pick up the active directory
    pub async fn reload(&self) -> Result<(), ProxyError> {
        let output = self
            .run(&self.reload_command)
            .await
            .map_err(|e| ProxyError::Reload { output: e.to_string() })?;

        if output.success {
            Ok(())
        } else {
            Err(ProxyError::Reload { output: output.tail() })
        }
    }

    /// Domains that have a rule written by this crate in the active
    /// directory
    pub async fn active_domains(&self) -> Result<Vec<String>, ProxyError> {
        let mut entries = match tokio::fs::read_dir(&self.active_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProxyError::io(&self.active_dir, e)),
        };

        let mut domains = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProxyError::io(&self.active_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conf") {
                continue;
            }
            // Unreadable entries and directories named *.conf are skipped
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let domain = content
                .lines()
                .next()
                .and_then(|line| line.strip_prefix(RULE_MARKER))
                .map(|rest| rest.trim().to_string());
            if let Some(domain) = domain {
                if path.file_name().and_then(|n| n.to_str()) == Some(rule_file_name(&domain).as_str()) {
                    domains.push(domain);
                }
            }
        }

        domains.sort();
        Ok(domains)
    }

    async fn ensure_dirs(&self) -> Result<(), ProxyError> {
        for dir in [&self.active_dir, &self.staging_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ProxyError::io(dir, e))?;
        }
        Ok(())
    }

    fn stage(&self, content: &str) -> Result<NamedTempFile, ProxyError> {
        let mut staged = NamedTempFile::new_in(&self.staging_dir)
            .map_err(|e| ProxyError::io(&self.staging_dir, e))?;
        staged
            .write_all(content.as_bytes())
            .and_then(|_| staged.flush())
            .map_err(|e| ProxyError::io(staged.path(), e))?;
        Ok(staged)
    }

    async fn validate(&self, domain: &str, staged: &Path) -> Result<(), ProxyError> {
        // nginx only checks full configs, so wrap the rule in a minimal one
        let wrapper = self.stage(&format!(
            "events {{}}\nhttp {{\n    include {};\n}}\n",
            staged.display()
        ))?;

        let rule = staged.to_string_lossy().to_string();
        let config = wrapper.path().to_string_lossy().to_string();
        let argv = command::expand(
            &self.validate_command,
            &[("config", config.as_str()), ("rule", rule.as_str())],
        );

        let output = self.run(&argv).await.map_err(|e| ProxyError::Validation {
            domain: domain.to_string(),
            output: e.to_string(),
        })?;

        if output.success {
            Ok(())
        } else {
            warn!(domain, "Proxy rejected rule");
            Err(ProxyError::Validation {
                domain: domain.to_string(),
                output: output.tail(),
            })
        }
    }

    /// Put back whatever was active before a failed apply, then reload so
    /// the proxy matches the directory again
    async fn restore(&self, active: &Path, previous: Option<String>) {
        let restored = match previous {
            Some(content) => tokio::fs::write(active, content).await,
            None => tokio::fs::remove_file(active).await,
        };
        if let Err(e) = restored {
            warn!(path = %active.display(), error = %e, "Could not restore previous rule");
            return;
        }
        if let Err(e) = self.reload().await {
            warn!(error = %e, "Reload after restoring rule failed");
        }
    }

    async fn run(&self, argv: &[String]) -> Result<command::CommandOutput, CommandError> {
        let mut cmd = command::command_from(argv)?;
        command::run(&mut cmd, self.command_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn blog(port: u16) -> DomainConfig {
        DomainConfig {
            domain: "blog.example.com".to_string(),
            aliases: vec![],
            target_port: port,
            tls_enabled: false,
        }
    }

    fn manager(dir: &Path, validate: &[&str], reload: &[&str]) -> ProxyConfigManager {
        ProxyConfigManager::new(dir.join("active"), dir.join("staging"))
            .with_commands(argv(validate), argv(reload))
    }

    #[test]
    fn test_routed_names() {
        let manager = ProxyConfigManager::new("/tmp/a", "/tmp/s");
        let aliases = vec!["store.example.com".to_string(), "shop.example.com".to_string()];
        assert_eq!(
            manager.routed_names("shop.example.com", &aliases),
            vec!["shop.example.com", "store.example.com", "www.shop.example.com"]
        );
        assert_eq!(manager.routed_names("www.example.com", &[]), vec!["www.example.com"]);

        let manager = manager.with_www_alias(false);
        assert_eq!(manager.routed_names("example.com", &[]), vec!["example.com"]);
    }

    #[test]
    fn test_render_plain_rule() {
        let manager = ProxyConfigManager::new("/tmp/a", "/tmp/s");
        let rule = manager.render_rule(&blog(3000));

        assert!(rule.starts_with("# Managed by siteplane: blog.example.com\n"));
        assert!(rule.contains("server_name blog.example.com www.blog.example.com;"));
        assert!(rule.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(rule.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(rule.contains("proxy_read_timeout 60s;"));
        assert!(!rule.contains("ssl_certificate"));
    }

    #[test]
    fn test_render_tls_rule_with_aliases() {
        let manager = ProxyConfigManager::new("/tmp/a", "/tmp/s")
            .with_www_alias(false)
            .with_cert_dir("/etc/certs");
        let config = DomainConfig {
            domain: "shop.example.com".to_string(),
            aliases: vec!["store.example.com".to_string()],
            target_port: 3001,
            tls_enabled: true,
        };
        let rule = manager.render_rule(&config);

        assert!(rule.contains("server_name shop.example.com store.example.com;"));
        assert!(rule.contains("return 301 https://$host$request_uri;"));
        assert!(rule.contains("listen 443 ssl;"));
        assert!(rule.contains("ssl_certificate /etc/certs/shop.example.com/fullchain.pem;"));
        assert!(rule.contains("ssl_certificate_key /etc/certs/shop.example.com/privkey.pem;"));
        assert!(rule.contains("proxy_pass http://127.0.0.1:3001;"));
    }

    #[tokio::test]
    async fn test_apply_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &["true"], &["true"]);

        manager.apply(&blog(3000)).await.unwrap();
        assert!(manager.has_rule("blog.example.com"));
        assert_eq!(manager.active_domains().await.unwrap(), vec!["blog.example.com".to_string()]);

        assert!(manager.remove("blog.example.com").await.unwrap());
        assert!(!manager.remove("blog.example.com").await.unwrap());
        assert!(!manager.has_rule("blog.example.com"));
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_active_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let good = manager(dir.path(), &["true"], &["true"]);
        good.apply(&blog(3000)).await.unwrap();
        let before = std::fs::read_to_string(good.rule_path("blog.example.com")).unwrap();

        let bad = manager(dir.path(), &["false"], &["true"]);
        let result = bad.apply(&blog(3005)).await;
        assert!(matches!(result, Err(ProxyError::Validation { .. })));

        let after = std::fs::read_to_string(good.rule_path("blog.example.com")).unwrap();
        assert_eq!(before, after);
        // Staged files are cleaned up
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_validate_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            dir.path(),
            &["sh", "-c", "grep -q 'proxy_pass http://127.0.0.1:3000' \"$0\" && grep -q include \"$1\"", "{rule}", "{config}"],
            &["true"],
        );
        manager.apply(&blog(3000)).await.unwrap();

        let wrong_port = manager.apply(&blog(3001)).await;
        assert!(matches!(wrong_port, Err(ProxyError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_reload_failure_removes_new_rule() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &["true"], &["false"]);

        let result = manager.apply(&blog(3000)).await;
        assert!(matches!(result, Err(ProxyError::Reload { .. })));
        assert!(!manager.has_rule("blog.example.com"));
    }

    #[tokio::test]
    async fn test_reload_failure_restores_previous_rule() {
        let dir = tempfile::tempdir().unwrap();
        let ok = manager(dir.path(), &["true"], &["true"]);
        ok.apply(&blog(3000)).await.unwrap();

        let failing = manager(dir.path(), &["true"], &["false"]);
        assert!(failing.apply(&blog(3009)).await.is_err());

        let content = std::fs::read_to_string(ok.rule_path("blog.example.com")).unwrap();
        assert!(content.contains("127.0.0.1:3000"));
    }

    #[tokio::test]
    async fn test_remove_reloads_only_when_rule_existed() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("reloads.log");
        let reload = format!("echo reload >> {}", log.display());
        let manager = manager(dir.path(), &["true"], &["sh", "-c", &reload]);

        assert!(!manager.remove("blog.example.com").await.unwrap());
        assert!(!log.exists());

        manager.apply(&blog(3000)).await.unwrap();
        manager.remove("blog.example.com").await.unwrap();
        let reloads = std::fs::read_to_string(&log).unwrap();
        assert_eq!(reloads.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_active_domains_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &["true"], &["true"]);
        std::fs::create_dir_all(manager.active_dir()).unwrap();
        std::fs::write(manager.active_dir().join("default.conf"), "server { listen 80; }\n").unwrap();
        std::fs::write(
            manager.active_dir().join("shop.example.com.conf"),
            "# Managed by siteplane: shop.example.com\nserver {}\n",
        )
        .unwrap();

        assert_eq!(manager.active_domains().await.unwrap(), vec!["shop.example.com".to_string()]);
    }
}
