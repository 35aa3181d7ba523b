//! Append-only audit log of pipeline step outcomes
//!
//! Writes go to the registry's `deployment_records` table. Recording never
//! fails the caller: a failed write is reported on the `siteplane::ops`
//! tracing target and counted.

use crate::error::Step;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Default number of records returned by queries
pub const DEFAULT_QUERY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Deploy,
    Delete,
    Import,
    Reconcile,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditAction::Deploy => "deploy",
            AuditAction::Delete => "delete",
            AuditAction::Import => "import",
            AuditAction::Reconcile => "reconcile",
        })
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" => Ok(AuditAction::Deploy),
            "delete" => Ok(AuditAction::Delete),
            "import" => Ok(AuditAction::Import),
            "reconcile" => Ok(AuditAction::Reconcile),
            other => Err(format!("unknown audit action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
        })
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditStatus::Success),
            "failure" => Ok(AuditStatus::Failure),
            other => Err(format!("unknown audit status '{}'", other)),
        }
    }
}

/// One audit entry. Never mutated once written.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Identifies all records written by one pipeline run
    pub run_id: String,
    pub site_name: String,
    pub action: AuditAction,
    pub step: String,
    pub status: AuditStatus,
    pub message: String,
}

pub struct AuditLog {
    registry: Registry,
    failures: AtomicU64,
}

impl AuditLog {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            failures: AtomicU64::new(0),
        }
    }

    /// Append a record. Errors are logged on the operational channel and
    /// swallowed.
    pub fn record(
        &self,
        run_id: &str,
        site_name: &str,
        action: AuditAction,
        step: Step,
        status: AuditStatus,
        message: &str,
    ) {
        let record = DeploymentRecord {
            id: 0,
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            site_name: site_name.to_string(),
            action,
            step: step.to_string(),
            status,
            message: message.to_string(),
        };

        match self.registry.append_record(&record) {
            Ok(id) => debug!(id, site = site_name, %action, %step, %status, "Audit record written"),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: "siteplane::ops",
                    site = site_name,
                    %action,
                    %step,
                    %status,
                    error = %e,
                    "Failed to write audit record"
                );
            }
        }
    }

    /// Number of records that could not be written since startup
    pub fn write_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Records for one site, newest first
    pub fn for_site(&self, site_name: &str, limit: usize) -> crate::registry::Result<Vec<DeploymentRecord>> {
        self.registry.records(Some(site_name), limit)
    }

    /// Records for all sites, newest first
    pub fn recent(&self, limit: usize) -> crate::registry::Result<Vec<DeploymentRecord>> {
        self.registry.records(None, limit)
    }
}
