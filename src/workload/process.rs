//! Process sites under a pm2-compatible supervisor
//!
//! Each site is one supervised process named after the site. The driver
//! writes an ecosystem file next to the site's files and asks the
//! supervisor to start it; crash restarts are left to the supervisor.

use super::{write_site_files, SiteLayout, WorkloadDriver, WorkloadError, WorkloadRef, WorkloadStatus};
use crate::command::{self, CommandOutput};
use crate::config::{ProcessConfig, TimeoutsConfig};
use crate::site::Site;
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

pub struct ProcessDriver {
    layout: SiteLayout,
    config: ProcessConfig,
    timeouts: TimeoutsConfig,
}

impl ProcessDriver {
    pub fn new(layout: SiteLayout, config: ProcessConfig, timeouts: TimeoutsConfig) -> Self {
        Self {
            layout,
            config,
            timeouts,
        }
    }

    async fn supervisor(&self, args: &[&str], timeout: std::time::Duration) -> Result<CommandOutput, WorkloadError> {
        let mut argv = self.config.supervisor.clone();
        argv.extend(args.iter().map(|s| s.to_string()));
        let mut cmd = command::command_from(&argv)?;
        Ok(command::run(&mut cmd, timeout).await?)
    }

    /// Install dependencies and run the build script, when the site is an
    /// npm project
    async fn build(&self, site_name: &str, app_dir: &Path) -> Result<(), WorkloadError> {
        let manifest_path = app_dir.join("package.json");
        let manifest = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(site = site_name, "No package.json, skipping build");
                return Ok(());
            }
            Err(e) => return Err(WorkloadError::io(&manifest_path, e)),
        };

        info!(site = site_name, "Installing dependencies");
        let mut install = command::command_in(&self.config.install_command, app_dir)?;
        let output = command::run(&mut install, self.timeouts.build()).await?;
        if !output.success {
            return Err(WorkloadError::Build { output: output.tail() });
        }

        if has_build_script(&manifest) {
            info!(site = site_name, "Running build script");
            let mut build = command::command_in(&self.config.build_command, app_dir)?;
            let output = command::run(&mut build, self.timeouts.build()).await?;
            if !output.success {
                return Err(WorkloadError::Build { output: output.tail() });
            }
        }

        Ok(())
    }

    async fn start(&self, site: &Site, port: u16) -> Result<(), WorkloadError> {
        let ecosystem = render_ecosystem(
            &site.name,
            &self.layout.app_dir(&site.name),
            port,
            &self.config,
        )?;
        let ecosystem_path = self.layout.ecosystem_file(&site.name);
        tokio::fs::write(&ecosystem_path, ecosystem)
            .await
            .map_err(|e| WorkloadError::io(&ecosystem_path, e))?;

        let path = ecosystem_path.to_string_lossy().to_string();
        let output = self.supervisor(&["start", &path], self.timeouts.start()).await?;
        if !output.success {
            return Err(WorkloadError::Start { output: output.tail() });
        }

        // Persist the process list so it survives a host reboot
        match self.supervisor(&["save"], self.timeouts.stop()).await {
            Ok(output) if output.success => {}
            Ok(output) => warn!(site = %site.name, output = %output.tail(), "Supervisor save failed"),
            Err(e) => warn!(site = %site.name, error = %e, "Supervisor save failed"),
        }

        Ok(())
    }

    /// Names of processes the supervisor knows about, with their status
    async fn process_list(&self) -> Result<Vec<(String, String)>, WorkloadError> {
        let output = self.supervisor(&["jlist"], self.timeouts.stop()).await?;
        if !output.success {
            return Err(WorkloadError::Stop { output: output.tail() });
        }
        parse_jlist(&output.stdout).ok_or_else(|| WorkloadError::Stop {
            output: format!("unparseable process list: {}", command::tail(&output.stdout, 200)),
        })
    }
}

impl WorkloadDriver for ProcessDriver {
    fn workload_ref(&self, site_name: &str) -> WorkloadRef {
        WorkloadRef::new(site_name)
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

            let app_dir = self.layout.app_dir(&site.name);
            write_site_files(&app_dir, files).await?;
            self.build(&site.name, &app_dir).await?;

            if let Err(e) = self.start(site, port).await {
                if let Err(stop_err) = self.stop(&workload_ref).await {
                    warn!(site = %site.name, error = %stop_err, "Cleanup after failed start did not complete");
                }
                return Err(e);
            }

            info!(site = %site.name, port, "Process started");
            Ok(workload_ref)
        })
    }

    fn stop<'a>(&'a self, workload_ref: &'a WorkloadRef) -> BoxFuture<'a, Result<(), WorkloadError>> {
        Box::pin(async move {
            let output = self
                .supervisor(&["delete", workload_ref.as_str()], self.timeouts.stop())
                .await?;
            if output.success {
                info!(workload = %workload_ref, "Process stopped");
                return Ok(());
            }

            if output.combined().contains("not found") {
                debug!(workload = %workload_ref, "Process already gone");
                return Ok(());
            }

            // Some supervisors report unknown names differently; trust the list
            let processes = self.process_list().await?;
            if processes.iter().all(|(name, _)| name != workload_ref.as_str()) {
                return Ok(());
            }

            Err(WorkloadError::Stop { output: output.tail() })
        })
    }

    fn status<'a>(&'a self, workload_ref: &'a WorkloadRef) -> BoxFuture<'a, WorkloadStatus> {
        Box::pin(async move {
            match self.process_list().await {
                Ok(processes) => {
                    match processes.iter().find(|(name, _)| name == workload_ref.as_str()) {
                        Some((_, status)) if status == "online" => WorkloadStatus::Running,
                        _ => WorkloadStatus::Stopped,
                    }
                }
                Err(e) => {
                    warn!(workload = %workload_ref, error = %e, "Could not query supervisor");
                    WorkloadStatus::Unknown
                }
            }
        })
    }

    fn discard<'a>(&'a self, site_name: &'a str) -> BoxFuture<'a, Result<(), WorkloadError>> {
        Box::pin(async move { self.layout.remove_site(site_name).await })
    }
}

fn has_build_script(manifest: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(manifest)
        .ok()
        .and_then(|value| value.get("scripts")?.get("build").cloned())
        .is_some()
}

/// Render the supervisor's ecosystem file for one site
pub fn render_ecosystem(
    site_name: &str,
    app_dir: &Path,
    port: u16,
    config: &ProcessConfig,
) -> Result<String, WorkloadError> {
    let words = shell_words::split(&config.start_command)
        .map_err(|e| WorkloadError::Start { output: format!("bad start command: {}", e) })?;
    let (script, args) = words
        .split_first()
        .ok_or_else(|| WorkloadError::Start { output: "empty start command".to_string() })?;

    let mut env: BTreeMap<String, String> = config.env.clone();
    env.insert("PORT".to_string(), port.to_string());
    env.insert("NODE_ENV".to_string(), config.node_env.clone());

    let ecosystem = json!({
        "apps": [{
            "name": site_name,
            "cwd": app_dir,
            "script": script,
            "args": args,
            "env": env,
            "instances": 1,
            "exec_mode": "fork",
            "autorestart": true,
            "watch": false,
            "max_memory_restart": config.max_memory_restart,
        }]
    });

    serde_json::to_string_pretty(&ecosystem)
        .map_err(|e| WorkloadError::Start { output: e.to_string() })
}

/// Parse `jlist` output into (name, status) pairs. Supervisors may print
/// banner lines (which can themselves start with `[`) before the JSON.
pub fn parse_jlist(stdout: &str) -> Option<Vec<(String, String)>> {
    let entries: Vec<serde_json::Value> = stdout
        .match_indices('[')
        .filter(|(idx, _)| *idx == 0 || stdout[..*idx].ends_with('\n'))
        .find_map(|(idx, _)| serde_json::from_str(stdout[idx..].trim()).ok())?;

    Some(
        entries
            .iter()
            .filter_map(|entry| {
                let name = entry.get("name")?.as_str()?.to_string();
                let status = entry
                    .get("pm2_env")
                    .and_then(|env| env.get("status"))
                    .and_then(|s| s.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                Some((name, status))
            })
            .collect(),
    )
}
