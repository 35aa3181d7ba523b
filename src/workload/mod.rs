//! Workload drivers
//!
//! A [`WorkloadDriver`] turns a site's files into something running on the
//! site's port. There are two drivers, one per [`SiteKind`]: a supervised
//! process and a container stack. The pipeline only ever talks to the trait.

pub mod container;
pub mod process;

pub use container::ContainerDriver;
pub use process::ProcessDriver;

use crate::command::CommandError;
use crate::site::{Site, SiteKind};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub use crate::site::WorkloadRef;

/// Live status of a workload as reported by its runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Running,
    Stopped,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("invalid site file path '{0}'")]
    InvalidPath(String),
    #[error("site '{0}' has no port assigned")]
    NoPort(String),
    #[error("file operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("build failed:\n{output}")]
    Build { output: String },
    #[error("start failed:\n{output}")]
    Start { output: String },
    #[error("stop failed:\n{output}")]
    Stop { output: String },
    #[error("import failed:\n{output}")]
    Import { output: String },
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl WorkloadError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        WorkloadError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Runs and tears down the workload behind a site
pub trait WorkloadDriver: Send + Sync {
    /// Deterministic handle for a site's workload
    fn workload_ref(&self, site_name: &str) -> WorkloadRef;

    /// Write `files` into the site's directory, build if needed and start
    /// the workload bound to `site.port`. An existing workload for the site
    /// is stopped first. On failure nothing is left running on the port.
    fn materialize<'a>(
        &'a self,
        site: &'a Site,
        files: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<WorkloadRef, WorkloadError>>;

    /// Stop the workload. Unknown or already stopped refs succeed.
    fn stop<'a>(&'a self, workload_ref: &'a WorkloadRef) -> BoxFuture<'a, Result<(), WorkloadError>>;

    fn status<'a>(&'a self, workload_ref: &'a WorkloadRef) -> BoxFuture<'a, WorkloadStatus>;

    /// Remove everything the driver stored for a site (files, volumes)
    fn discard<'a>(&'a self, site_name: &'a str) -> BoxFuture<'a, Result<(), WorkloadError>>;

    /// Load a data dump into the site's data store, then optionally rewrite
    /// URLs through the workload's own data layer
    fn import_data<'a>(
        &'a self,
        site: &'a Site,
        dump: &'a Path,
        rewrite_urls: Option<&'a (String, String)>,
    ) -> BoxFuture<'a, Result<(), WorkloadError>> {
        let _ = (dump, rewrite_urls);
        Box::pin(async move {
            Err(WorkloadError::Unsupported(format!(
                "{} sites have no data store to import into",
                site.kind
            )))
        })
    }
}

/// The two drivers, selected by site kind
#[derive(Clone)]
pub struct Workloads {
    process: Arc<dyn WorkloadDriver>,
    container: Arc<dyn WorkloadDriver>,
}

impl Workloads {
    pub fn new(process: Arc<dyn WorkloadDriver>, container: Arc<dyn WorkloadDriver>) -> Self {
        Self { process, container }
    }

    /// Use the same driver for both kinds
    pub fn uniform(driver: Arc<dyn WorkloadDriver>) -> Self {
        Self {
            process: driver.clone(),
            container: driver,
        }
    }

    pub fn driver(&self, kind: SiteKind) -> &dyn WorkloadDriver {
        match kind {
            SiteKind::Process => self.process.as_ref(),
            SiteKind::Container => self.container.as_ref(),
        }
    }
}

/// On-disk layout of the site root: one directory per site, with the
/// deployed files under `app/` and driver metadata next to it.
#[derive(Debug, Clone)]
pub struct SiteLayout {
    root: PathBuf,
}

impl SiteLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn site_dir(&self, site_name: &str) -> PathBuf {
        self.root.join(site_name)
    }

    pub fn app_dir(&self, site_name: &str) -> PathBuf {
        self.site_dir(site_name).join("app")
    }

    pub fn ecosystem_file(&self, site_name: &str) -> PathBuf {
        self.site_dir(site_name).join("ecosystem.config.json")
    }

    pub fn compose_file(&self, site_name: &str) -> PathBuf {
        self.site_dir(site_name).join("docker-compose.yml")
    }

    pub fn stack_file(&self, site_name: &str) -> PathBuf {
        self.site_dir(site_name).join("stack.json")
    }

    /// Remove a site's directory; missing directories are fine
    pub async fn remove_site(&self, site_name: &str) -> Result<(), WorkloadError> {
        let dir = self.site_dir(site_name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(site = site_name, dir = %dir.display(), "Removed site directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkloadError::io(&dir, e)),
        }
    }
}

/// Check that a relative file path stays inside the app directory
pub fn validate_relative_path(path: &str) -> Result<PathBuf, WorkloadError> {
    let candidate = Path::new(path);
    if path.is_empty() || candidate.is_absolute() {
        return Err(WorkloadError::InvalidPath(path.to_string()));
    }

    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(WorkloadError::InvalidPath(path.to_string())),
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(WorkloadError::InvalidPath(path.to_string()));
    }
    Ok(clean)
}

/// Replace the contents of `app_dir` with `files`
pub async fn write_site_files(
    app_dir: &Path,
    files: &BTreeMap<String, String>,
) -> Result<(), WorkloadError> {
    // Reject bad paths before touching the existing directory
    let resolved = files
        .iter()
        .map(|(path, content)| Ok((validate_relative_path(path)?, content)))
        .collect::<Result<Vec<_>, WorkloadError>>()?;

    match tokio::fs::remove_dir_all(app_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(WorkloadError::io(app_dir, e)),
    }
    tokio::fs::create_dir_all(app_dir)
        .await
        .map_err(|e| WorkloadError::io(app_dir, e))?;

    for (relative, content) in resolved {
        let target = app_dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkloadError::io(parent, e))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| WorkloadError::io(&target, e))?;
    }

    debug!(dir = %app_dir.display(), count = files.len(), "Wrote site files");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_relative_path() {
        assert_eq!(validate_relative_path("index.js").unwrap(), PathBuf::from("index.js"));
        assert_eq!(
            validate_relative_path("./public/app.css").unwrap(),
            PathBuf::from("public/app.css")
        );
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("../escape.js").is_err());
        assert!(validate_relative_path("public/../../escape.js").is_err());
        assert!(validate_relative_path(".").is_err());
    }

    #[test]
    fn test_layout_paths() {
        let layout = SiteLayout::new("/var/www/domains");
        assert_eq!(layout.app_dir("blog"), PathBuf::from("/var/www/domains/blog/app"));
        assert_eq!(
            layout.compose_file("shop"),
            PathBuf::from("/var/www/domains/shop/docker-compose.yml")
        );
    }

    #[tokio::test]
    async fn test_write_site_files_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("blog").join("app");

        let mut files = BTreeMap::new();
        files.insert("index.js".to_string(), "console.log(1)".to_string());
        files.insert("lib/util.js".to_string(), "module.exports = {}".to_string());
        write_site_files(&app_dir, &files).await.unwrap();

        assert_eq!(std::fs::read_to_string(app_dir.join("lib/util.js")).unwrap(), "module.exports = {}");

        let mut files = BTreeMap::new();
        files.insert("server.js".to_string(), "// v2".to_string());
        write_site_files(&app_dir, &files).await.unwrap();

        assert!(app_dir.join("server.js").exists());
        assert!(!app_dir.join("index.js").exists());
    }

    #[tokio::test]
    async fn test_write_site_files_rejects_escape_without_touching_dir() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("app");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("keep.txt"), "old").unwrap();

        let mut files = BTreeMap::new();
        files.insert("../evil.sh".to_string(), "rm -rf /".to_string());
        let result = write_site_files(&app_dir, &files).await;

        assert!(matches!(result, Err(WorkloadError::InvalidPath(_))));
        assert!(app_dir.join("keep.txt").exists());
        assert!(!dir.path().join("evil.sh").exists());
    }

    #[tokio::test]
    async fn test_remove_missing_site_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SiteLayout::new(dir.path());
        layout.remove_site("nothing-here").await.unwrap();
    }
}
