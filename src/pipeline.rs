//! Deployment pipeline
//!
//! The pipeline is the only writer of site state transitions. A deploy
//! moves a site through `Pending -> Provisioning -> Routing -> Live`; a
//! failure at any step runs compensation (remove the proxy rule, stop the
//! workload, release the port) and leaves the site in `Error` with the
//! failing step recorded. Runs for the same site name are serialized by a
//! per-name lock; runs for different names proceed in parallel. Every
//! hostname a site routes is claimed in the registry at reserve, so two
//! sites never share a `server_name`.

use crate::audit::{AuditAction, AuditLog, AuditStatus, DeploymentRecord};
use crate::config::{Config, TimeoutsConfig};
use crate::error::{ErrorKind, PipelineError, Step};
use crate::ports::{PortAllocator, PortError};
use crate::proxy::{ProxyConfigManager, ProxyError};
use crate::registry::{Registry, RegistryError};
use crate::site::{
    derive_site_name, normalize_domain, validate_site_name, DeleteRequest, DeleteResult,
    DeployRequest, DeployResult, ImportRequest, Site, SiteState, WorkloadRef,
};
use crate::workload::{
    validate_relative_path, ContainerDriver, ProcessDriver, SiteLayout, WorkloadError,
    WorkloadStatus, Workloads,
};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of a successful import
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub site_name: String,
    pub urls_rewritten: bool,
}

/// Registry state of a site combined with what is actually running
#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    #[serde(flatten)]
    pub site: Site,
    /// `None` when the site has no workload yet
    pub workload: Option<WorkloadStatus>,
    pub rule_active: bool,
    /// Every hostname the site's rule routes
    pub hostnames: Vec<String>,
}

/// What a reconcile pass found and did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Sites left in a transitional state by an interrupted run, now `Error`
    pub compensated: Vec<String>,
    /// Live sites without an active proxy rule
    pub missing_rules: Vec<String>,
    /// Live sites whose workload is not running
    pub stopped_workloads: Vec<String>,
    /// Live sites whose workload status could not be determined
    pub unknown_workloads: Vec<String>,
    /// Sites in `Error` or `Deleting` waiting for a deploy or delete
    pub needs_attention: Vec<String>,
    /// Rule files removed because no live site owns their domain
    pub orphan_rules_removed: Vec<String>,
    /// Sites skipped because a pipeline run holds their lock
    pub busy: Vec<String>,
}

/// Audit context for one pipeline run
struct Run<'a> {
    audit: &'a AuditLog,
    id: String,
    site_name: String,
    action: AuditAction,
}

impl Run<'_> {
    fn ok(&self, step: Step, message: &str) {
        self.audit
            .record(&self.id, &self.site_name, self.action, step, AuditStatus::Success, message);
    }

    fn failed(&self, err: &PipelineError) {
        self.audit.record(
            &self.id,
            &self.site_name,
            self.action,
            err.step,
            AuditStatus::Failure,
            &format!("{}: {}", err.kind, err.message),
        );
    }
}

/// Per-name async locks. An entry lives while a run holds or waits on it
/// and is dropped once its site is gone.
#[derive(Default)]
struct SiteLocks {
    inner: DashMap<String, Arc<Mutex<()>>>,
}

impl SiteLocks {
    fn handle(&self, name: &str) -> Arc<Mutex<()>> {
        self.inner
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        self.handle(name).lock_owned().await
    }

    fn try_lock(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        self.handle(name).try_lock_owned().ok()
    }

    /// Drop the entry for `name` unless some run still holds a handle
    fn forget(&self, name: &str) {
        self.inner.remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.len()
    }
}

pub struct Pipeline {
    registry: Registry,
    ports: PortAllocator,
    workloads: Workloads,
    proxy: ProxyConfigManager,
    audit: AuditLog,
    timeouts: TimeoutsConfig,
    locks: SiteLocks,
}

impl Pipeline {
    pub fn new(
        registry: Registry,
        ports: PortAllocator,
        workloads: Workloads,
        proxy: ProxyConfigManager,
        timeouts: TimeoutsConfig,
    ) -> Self {
        Self {
            audit: AuditLog::new(registry.clone()),
            registry,
            ports,
            workloads,
            proxy,
            timeouts,
            locks: SiteLocks::default(),
        }
    }

    /// Open the registry and build both drivers from configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let registry = Registry::open(&config.registry_store_path)?;
        let ports = PortAllocator::new(config.port_range, registry.clone(), config.probe_host_ports);

        let layout = SiteLayout::new(&config.site_root_path);
        let workloads = Workloads::new(
            Arc::new(ProcessDriver::new(layout.clone(), config.process.clone(), config.timeouts)),
            Arc::new(ContainerDriver::new(layout, config.container.clone(), config.timeouts)),
        );

        Ok(Self::new(
            registry,
            ports,
            workloads,
            ProxyConfigManager::from_config(config),
            config.timeouts,
        ))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn proxy(&self) -> &ProxyConfigManager {
        &self.proxy
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    fn run(&self, site_name: &str, action: AuditAction) -> Run<'_> {
        Run {
            audit: &self.audit,
            id: Uuid::new_v4().to_string(),
            site_name: site_name.to_string(),
            action,
        }
    }

    // ==================== Deploy ====================

    /// Deploy a new site or redeploy an existing one
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployResult, PipelineError> {
        let domain = normalize_domain(&request.domain)
            .map_err(|e| PipelineError::invalid(Step::Reserve, e))?;
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| derive_site_name(&domain));
        validate_site_name(&name).map_err(|e| PipelineError::invalid(Step::Reserve, e))?;

        let mut aliases = Vec::new();
        for alias in &request.aliases {
            let alias = normalize_domain(alias)
                .map_err(|e| PipelineError::invalid(Step::Reserve, e))?;
            if alias != domain && !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }
        for path in request.files.keys() {
            validate_relative_path(path)
                .map_err(|e| PipelineError::invalid(Step::Reserve, e.to_string()))?;
        }

        let _guard = self.locks.lock(&name).await;
        let run = self.run(&name, AuditAction::Deploy);
        info!(site = %name, domain = %domain, kind = %request.kind, run_id = %run.id, "Deploy started");

        let previous_port = match self.reserve(&name, &domain, aliases, &request) {
            Ok(port) => port,
            Err(e) => {
                run.failed(&e);
                return Err(e);
            }
        };
        self.step_done(&run, Step::Reserve, "");

        let result = self
            .provision_and_route(&run, &name, previous_port, &request)
            .await;

        match result {
            Ok(result) => {
                info!(site = %name, port = result.port, "Site live");
                Ok(result)
            }
            Err(e) => {
                let e = self.compensate(&run, &name, e).await;
                run.failed(&e);
                Err(e)
            }
        }
    }

    /// Reserve the name and domain, or validate a redeploy. Returns the
    /// port a redeploy must keep.
    fn reserve(
        &self,
        name: &str,
        domain: &str,
        aliases: Vec<String>,
        request: &DeployRequest,
    ) -> Result<Option<u16>, PipelineError> {
        let existing = self
            .registry
            .get(name)
            .map_err(|e| registry_error(Step::Reserve, e))?;

        let hostnames = self.proxy.routed_names(domain, &aliases);

        let Some(site) = existing else {
            let site = Site::pending(name, request.kind, domain)
                .with_aliases(aliases)
                .with_tls(request.tls);
            self.registry
                .create(&site, &hostnames)
                .map_err(|e| registry_error(Step::Reserve, e))?;
            return Ok(None);
        };

        if site.domain != domain || site.kind != request.kind {
            return Err(PipelineError::new(
                ErrorKind::DuplicateName,
                Step::Reserve,
                format!(
                    "site '{}' already exists as a {} site for {}",
                    name, site.kind, site.domain
                ),
            ));
        }

        if site.state == SiteState::Deleting || site.state.is_transitional() {
            return Err(PipelineError::new(
                ErrorKind::ReconciliationRequired,
                Step::Reserve,
                format!("site '{}' is in state {}; run reconcile or delete first", name, site.state),
            ));
        }

        self.registry
            .update_routing(name, &aliases, request.tls, &hostnames)
            .map_err(|e| registry_error(Step::Reserve, e))?;

        Ok(site.port)
    }

    async fn provision_and_route(
        &self,
        run: &Run<'_>,
        name: &str,
        previous_port: Option<u16>,
        request: &DeployRequest,
    ) -> Result<DeployResult, PipelineError> {
        // Provisioning: port, then workload
        let port = match previous_port {
            Some(port) => self.ports.reserve_exact(name, port),
            None => self.ports.allocate(name, request.preferred_port),
        }
        .map_err(port_error)?;
        self.step_done(run, Step::Allocate, &format!("port {}", port));

        let site = self.load(name, Step::Materialize)?;
        let driver = self.workloads.driver(site.kind);

        let workload_ref = with_timeout(
            Step::Materialize,
            self.timeouts.materialize(),
            driver.materialize(&site, &request.files),
        )
        .await?
        .map_err(|e| workload_error(Step::Materialize, e))?;

        self.registry
            .set_workload_ref(name, Some(&workload_ref))
            .map_err(|e| registry_error(Step::Materialize, e))?;
        self.step_done(run, Step::Materialize, workload_ref.as_str());

        // Routing: activated only once the workload runs
        self.registry
            .update_state(name, SiteState::Routing)
            .map_err(|e| registry_error(Step::Route, e))?;

        let site = self.load(name, Step::Route)?;
        let domain_config = site.domain_config().ok_or_else(|| {
            PipelineError::new(ErrorKind::StorageFailed, Step::Route, "port vanished from registry")
        })?;

        with_timeout(Step::Route, self.timeouts.route(), self.proxy.apply(&domain_config))
            .await?
            .map_err(|e| proxy_error(Step::Route, e))?;
        self.step_done(run, Step::Route, &site.domain);

        // Commit
        self.registry
            .mark_live(name, port, &workload_ref)
            .map_err(|e| registry_error(Step::Commit, e))?;
        self.step_done(run, Step::Commit, &format!("{} -> {}", site.domain, port));

        Ok(DeployResult {
            site_name: name.to_string(),
            port,
            domain: site.domain,
            state: SiteState::Live,
        })
    }

    /// Undo a failed deploy: remove the rule, stop the workload, release
    /// the port, then mark the site `Error`. The port stays held when the
    /// rule or workload could not be removed, so nothing else gets routed
    /// onto a still-bound port.
    async fn compensate(&self, run: &Run<'_>, name: &str, err: PipelineError) -> PipelineError {
        warn!(site = name, step = %err.step, kind = %err.kind, message = %err.message, "Deploy failed, compensating");

        let site = match self.registry.get(name) {
            Ok(Some(site)) => site,
            Ok(None) => return err,
            Err(e) => {
                error!(site = name, error = %e, "Cannot read site for compensation");
                return err;
            }
        };

        let mut problems = self.undo(&site).await;
        if problems.is_empty() {
            if let Some(port) = site.port {
                if let Err(e) = self.ports.release(port) {
                    problems.push(format!("release port {}: {}", port, e));
                }
            }
        }

        let mut last_error = format!("{}: {}", err.step, err.message);
        if !problems.is_empty() {
            error!(site = name, problems = ?problems, "Compensation incomplete");
            last_error.push_str(&format!(" (compensation incomplete: {})", problems.join("; ")));
            run.audit.record(
                &run.id,
                name,
                run.action,
                err.step,
                AuditStatus::Failure,
                &format!("compensation incomplete: {}", problems.join("; ")),
            );
        }

        if let Err(e) = self.registry.record_failure(name, SiteState::Error, &last_error) {
            error!(site = name, error = %e, "Cannot mark site as failed");
        }

        err
    }

    /// Remove the rule and stop the workload of a site, collecting what
    /// went wrong
    async fn undo(&self, site: &Site) -> Vec<String> {
        let mut problems = Vec::new();

        if let Err(e) = self.proxy.remove(&site.domain).await {
            problems.push(format!("remove rule: {}", e));
        }

        let driver = self.workloads.driver(site.kind);
        let workload_ref = self.workload_ref_of(site);
        match tokio::time::timeout(self.timeouts.stop(), driver.stop(&workload_ref)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => problems.push(format!("stop workload: {}", e)),
            Err(_) => problems.push("stop workload: timed out".to_string()),
        }

        problems
    }

    fn workload_ref_of(&self, site: &Site) -> WorkloadRef {
        site.workload_ref
            .clone()
            .unwrap_or_else(|| self.workloads.driver(site.kind).workload_ref(&site.name))
    }

    fn step_done(&self, run: &Run<'_>, step: Step, message: &str) {
        run.ok(step, message);
        if let Err(e) = self.registry.set_last_step(&run.site_name, step.as_str()) {
            warn!(site = %run.site_name, %step, error = %e, "Could not record last step");
        }
    }

    fn load(&self, name: &str, step: Step) -> Result<Site, PipelineError> {
        self.registry
            .get(name)
            .map_err(|e| registry_error(step, e))?
            .ok_or_else(|| PipelineError::not_found(step, name))
    }

    // ==================== Delete ====================

    /// Tear a site down. Every step is idempotent, so a failed delete can
    /// simply be retried.
    pub async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, PipelineError> {
        let name = request.site_name;
        validate_site_name(&name).map_err(|e| PipelineError::invalid(Step::RemoveRoute, e))?;

        let guard = self.locks.lock(&name).await;
        let run = self.run(&name, AuditAction::Delete);

        let site = match self.load(&name, Step::RemoveRoute) {
            Ok(site) => site,
            Err(e) => {
                run.failed(&e);
                drop(guard);
                if e.kind == ErrorKind::NotFound {
                    self.locks.forget(&name);
                }
                return Err(e);
            }
        };
        info!(site = %name, state = %site.state, run_id = %run.id, "Delete started");

        match self.teardown(&run, &site).await {
            Ok(()) => {
                drop(guard);
                self.locks.forget(&name);
                info!(site = %name, "Site deleted");
                Ok(DeleteResult {
                    site_name: name,
                    state: SiteState::Deleted,
                })
            }
            Err(e) => {
                let last_error = format!("{}: {}", e.step, e.message);
                if let Err(re) = self.registry.record_failure(&name, SiteState::Deleting, &last_error) {
                    error!(site = %name, error = %re, "Cannot record delete failure");
                }
                run.failed(&e);
                Err(e)
            }
        }
    }

    async fn teardown(&self, run: &Run<'_>, site: &Site) -> Result<(), PipelineError> {
        let name = site.name.as_str();
        self.registry
            .update_state(name, SiteState::Deleting)
            .map_err(|e| registry_error(Step::RemoveRoute, e))?;

        // Routing goes first so no traffic reaches a stopping workload
        self.proxy
            .remove(&site.domain)
            .await
            .map_err(|e| proxy_error(Step::RemoveRoute, e))?;
        run.ok(Step::RemoveRoute, &site.domain);

        let driver = self.workloads.driver(site.kind);
        let workload_ref = self.workload_ref_of(site);
        with_timeout(Step::StopWorkload, self.timeouts.stop(), driver.stop(&workload_ref))
            .await?
            .map_err(|e| workload_error(Step::StopWorkload, e))?;
        run.ok(Step::StopWorkload, workload_ref.as_str());

        with_timeout(Step::RemoveFiles, self.timeouts.stop(), driver.discard(name))
            .await?
            .map_err(|e| workload_error(Step::RemoveFiles, e))?;
        run.ok(Step::RemoveFiles, "");

        if let Some(port) = site.port {
            self.ports.release(port).map_err(port_error_at(Step::ReleasePort))?;
            run.ok(Step::ReleasePort, &format!("port {}", port));
        }

        self.registry
            .delete(name)
            .map_err(|e| registry_error(Step::RemoveRecord, e))?;
        run.ok(Step::RemoveRecord, "");

        Ok(())
    }

    // ==================== Import ====================

    /// Load a data dump into a live site's data store
    pub async fn import(&self, request: ImportRequest) -> Result<ImportResult, PipelineError> {
        let name = request.site_name.clone();
        validate_site_name(&name).map_err(|e| PipelineError::invalid(Step::Import, e))?;
        if !request.dump_path.is_file() {
            return Err(PipelineError::invalid(
                Step::Import,
                format!("dump file {} does not exist", request.dump_path.display()),
            ));
        }

        let _guard = self.locks.lock(&name).await;
        let run = self.run(&name, AuditAction::Import);

        let result = self.import_locked(&request).await;
        match &result {
            Ok(_) => run.ok(Step::Import, &request.dump_path.display().to_string()),
            Err(e) => run.failed(e),
        }
        result
    }

    async fn import_locked(&self, request: &ImportRequest) -> Result<ImportResult, PipelineError> {
        let site = self.load(&request.site_name, Step::Import)?;
        if site.state != SiteState::Live {
            return Err(PipelineError::new(
                ErrorKind::ReconciliationRequired,
                Step::Import,
                format!("site '{}' is {}, not live", site.name, site.state),
            ));
        }

        let driver = self.workloads.driver(site.kind);
        with_timeout(
            Step::Import,
            self.timeouts.import(),
            driver.import_data(&site, &request.dump_path, request.rewrite_urls.as_ref()),
        )
        .await?
        .map_err(|e| match e {
            WorkloadError::Unsupported(message) => PipelineError::invalid(Step::Import, message),
            other => PipelineError::new(ErrorKind::ImportFailed, Step::Import, other.to_string()),
        })?;

        info!(site = %site.name, "Import finished");
        Ok(ImportResult {
            site_name: site.name,
            urls_rewritten: request.rewrite_urls.is_some(),
        })
    }

    // ==================== Queries ====================

    pub fn list(&self) -> Result<Vec<Site>, PipelineError> {
        self.registry
            .list()
            .map_err(|e| PipelineError::storage(Step::Reconcile, e))
    }

    /// Registry state plus live workload status and rule presence
    pub async fn status(&self, name: &str) -> Result<SiteStatus, PipelineError> {
        let site = self.load(name, Step::Reconcile)?;
        let workload = match &site.workload_ref {
            Some(workload_ref) => Some(self.workloads.driver(site.kind).status(workload_ref).await),
            None => None,
        };
        let rule_active = self.proxy.has_rule(&site.domain);
        let hostnames = self
            .registry
            .hostnames(name)
            .map_err(|e| registry_error(Step::Reconcile, e))?;

        Ok(SiteStatus {
            site,
            workload,
            rule_active,
            hostnames,
        })
    }

    /// Deployment records, newest first
    pub fn audit(&self, site_name: Option<&str>, limit: usize) -> Result<Vec<DeploymentRecord>, PipelineError> {
        match site_name {
            Some(name) => self.audit.for_site(name, limit),
            None => self.audit.recent(limit),
        }
        .map_err(|e| PipelineError::storage(Step::Reconcile, e))
    }

    // ==================== Reconcile ====================

    /// Repair state left behind by interrupted runs and report drift
    pub async fn reconcile(&self) -> Result<ReconcileReport, PipelineError> {
        let mut report = ReconcileReport::default();
        let sites = self.list()?;

        for site in &sites {
            let Some(_guard) = self.locks.try_lock(&site.name) else {
                report.busy.push(site.name.clone());
                continue;
            };

            match site.state {
                SiteState::Pending | SiteState::Provisioning | SiteState::Routing => {
                    let run = self.run(&site.name, AuditAction::Reconcile);
                    let err = PipelineError::new(
                        ErrorKind::ReconciliationRequired,
                        Step::Reconcile,
                        format!("run interrupted in state {}", site.state),
                    );
                    let err = self.compensate(&run, &site.name, err).await;
                    run.failed(&err);
                    report.compensated.push(site.name.clone());
                }
                SiteState::Live => {
                    if !self.proxy.has_rule(&site.domain) {
                        report.missing_rules.push(site.name.clone());
                    }
                    let workload_ref = self.workload_ref_of(site);
                    match self.workloads.driver(site.kind).status(&workload_ref).await {
                        WorkloadStatus::Running => {}
                        WorkloadStatus::Stopped => report.stopped_workloads.push(site.name.clone()),
                        WorkloadStatus::Unknown => report.unknown_workloads.push(site.name.clone()),
                    }
                }
                SiteState::Error | SiteState::Deleting => {
                    report.needs_attention.push(site.name.clone())
                }
                SiteState::Deleted => {}
            }
        }

        let domains = self
            .proxy
            .active_domains()
            .await
            .map_err(|e| proxy_error(Step::Reconcile, e))?;
        for domain in domains {
            let owner = self
                .registry
                .get_by_domain(&domain)
                .map_err(|e| registry_error(Step::Reconcile, e))?;

            let _guard = match &owner {
                Some(site) if site.state == SiteState::Live => continue,
                Some(site) => match self.locks.try_lock(&site.name) {
                    Some(guard) => Some(guard),
                    None => continue,
                },
                None => None,
            };

            // Re-read under the lock; a deploy may have finished meanwhile
            if let Some(site) = &owner {
                match self.registry.get(&site.name) {
                    Ok(Some(current)) if current.state == SiteState::Live => continue,
                    _ => {}
                }
            }

            let run = self.run(
                owner.as_ref().map(|s| s.name.as_str()).unwrap_or(domain.as_str()),
                AuditAction::Reconcile,
            );
            match self.proxy.remove(&domain).await {
                Ok(_) => {
                    run.ok(Step::RemoveRoute, &format!("orphan rule {}", domain));
                    report.orphan_rules_removed.push(domain);
                }
                Err(e) => warn!(domain = %domain, error = %e, "Could not remove orphan rule"),
            }
        }

        info!(
            compensated = report.compensated.len(),
            orphans = report.orphan_rules_removed.len(),
            "Reconcile finished"
        );
        Ok(report)
    }
}

async fn with_timeout<T>(
    step: Step,
    limit: Duration,
    fut: impl Future<Output = T>,
) -> Result<T, PipelineError> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        let kind = match step {
            Step::Route => ErrorKind::ProxyReloadFailed,
            Step::Import => ErrorKind::ImportFailed,
            Step::Materialize => ErrorKind::WorkloadStartFailed,
            _ => ErrorKind::ReconciliationRequired,
        };
        PipelineError::new(kind, step, format!("timed out after {}s", limit.as_secs()))
    })
}

fn registry_error(step: Step, err: RegistryError) -> PipelineError {
    let kind = match &err {
        RegistryError::DuplicateName(_) => ErrorKind::DuplicateName,
        RegistryError::DuplicateDomain(_) => ErrorKind::DuplicateDomain,
        RegistryError::NotFound(_) => ErrorKind::NotFound,
        RegistryError::PortConflict(_) | RegistryError::InvalidTransition { .. } => {
            ErrorKind::ReconciliationRequired
        }
        RegistryError::Database(_) | RegistryError::Io(_) => ErrorKind::StorageFailed,
    };
    PipelineError::new(kind, step, err.to_string())
}

fn port_error(err: PortError) -> PipelineError {
    port_error_at(Step::Allocate)(err)
}

fn port_error_at(step: Step) -> impl Fn(PortError) -> PipelineError {
    move |err| match err {
        PortError::ExhaustedRange { .. } => {
            PipelineError::new(ErrorKind::ExhaustedRange, step, err.to_string())
        }
        PortError::Unavailable(_) => {
            PipelineError::new(ErrorKind::ReconciliationRequired, step, err.to_string())
        }
        PortError::Registry(e) => registry_error(step, e),
    }
}

fn workload_error(step: Step, err: WorkloadError) -> PipelineError {
    let kind = match (&err, step) {
        (WorkloadError::InvalidPath(_), _) => ErrorKind::InvalidRequest,
        (_, Step::Materialize) => ErrorKind::WorkloadStartFailed,
        _ => ErrorKind::ReconciliationRequired,
    };
    PipelineError::new(kind, step, err.to_string())
}

fn proxy_error(step: Step, err: ProxyError) -> PipelineError {
    let kind = match &err {
        ProxyError::Validation { .. } | ProxyError::Io { .. } => ErrorKind::ProxyValidationFailed,
        ProxyError::Reload { .. } => ErrorKind::ProxyReloadFailed,
    };
    PipelineError::new(kind, step, err.to_string())
}
