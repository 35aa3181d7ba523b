//! Error taxonomy surfaced by the deployment pipeline

use serde::Serialize;
use std::fmt;

/// Error kinds a pipeline run can end in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Site name already taken by a different site
    DuplicateName,
    /// Domain already owned by another site
    DuplicateDomain,
    /// No free port left in the configured range
    ExhaustedRange,
    /// Build or start of the workload failed
    WorkloadStartFailed,
    /// The proxy rejected the generated rule
    ProxyValidationFailed,
    /// The rule was valid but the proxy could not be reloaded
    ProxyReloadFailed,
    /// Site is in a state that needs operator reconciliation first
    ReconciliationRequired,
    /// No such site
    NotFound,
    /// Malformed name, domain, file path or request
    InvalidRequest,
    /// Registry read or write failed
    StorageFailed,
    /// Loading a data dump or rewriting its URLs failed
    ImportFailed,
}

impl ErrorKind {
    /// Stable string code, also used as the JSON representation
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::DuplicateName => "DUPLICATE_NAME",
            ErrorKind::DuplicateDomain => "DUPLICATE_DOMAIN",
            ErrorKind::ExhaustedRange => "EXHAUSTED_RANGE",
            ErrorKind::WorkloadStartFailed => "WORKLOAD_START_FAILED",
            ErrorKind::ProxyValidationFailed => "PROXY_VALIDATION_FAILED",
            ErrorKind::ProxyReloadFailed => "PROXY_RELOAD_FAILED",
            ErrorKind::ReconciliationRequired => "RECONCILIATION_REQUIRED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::StorageFailed => "STORAGE_FAILED",
            ErrorKind::ImportFailed => "IMPORT_FAILED",
        }
    }

    /// Process exit code used by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::InvalidRequest => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::DuplicateName | ErrorKind::DuplicateDomain => 4,
            ErrorKind::ExhaustedRange => 5,
            ErrorKind::ReconciliationRequired => 6,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Pipeline step names, recorded in the audit log and in errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Reserve,
    Allocate,
    Materialize,
    Route,
    Commit,
    RemoveRoute,
    StopWorkload,
    RemoveFiles,
    ReleasePort,
    RemoveRecord,
    Import,
    Reconcile,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Reserve => "reserve",
            Step::Allocate => "allocate",
            Step::Materialize => "materialize",
            Step::Route => "route",
            Step::Commit => "commit",
            Step::RemoveRoute => "remove_route",
            Step::StopWorkload => "stop_workload",
            Step::RemoveFiles => "remove_files",
            Step::ReleasePort => "release_port",
            Step::RemoveRecord => "remove_record",
            Step::Import => "import",
            Step::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed pipeline run: what went wrong and at which step
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind} at step {step}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub step: Step,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, step: Step, message: impl Into<String>) -> Self {
        Self {
            kind,
            step,
            message: message.into(),
        }
    }

    pub fn invalid(step: Step, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, step, message)
    }

    pub fn not_found(step: Step, site_name: &str) -> Self {
        Self::new(ErrorKind::NotFound, step, format!("site '{}' not found", site_name))
    }

    pub fn storage(step: Step, err: impl fmt::Display) -> Self {
        Self::new(ErrorKind::StorageFailed, step, err.to_string())
    }

    /// Convert to a JSON string for CLI output
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"kind":"{}","step":"{}","message":"{}"}}"#,
                self.kind.code(),
                self.step,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes_match_serde() {
        for kind in [
            ErrorKind::DuplicateName,
            ErrorKind::DuplicateDomain,
            ErrorKind::ExhaustedRange,
            ErrorKind::WorkloadStartFailed,
            ErrorKind::ProxyValidationFailed,
            ErrorKind::ProxyReloadFailed,
            ErrorKind::ReconciliationRequired,
            ErrorKind::NotFound,
            ErrorKind::InvalidRequest,
            ErrorKind::StorageFailed,
            ErrorKind::ImportFailed,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn test_step_serializes_like_display() {
        let json = serde_json::to_string(&Step::RemoveRoute).unwrap();
        assert_eq!(json, "\"remove_route\"");
        assert_eq!(Step::StopWorkload.to_string(), "stop_workload");
    }

    #[test]
    fn test_pipeline_error_json() {
        let err = PipelineError::new(
            ErrorKind::ProxyValidationFailed,
            Step::Route,
            "nginx: [emerg] unexpected \"}\"",
        );
        let json = err.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["kind"], "PROXY_VALIDATION_FAILED");
        assert_eq!(value["step"], "route");
        assert!(value["message"].as_str().unwrap().contains("unexpected"));
    }

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::not_found(Step::RemoveRecord, "blog");
        assert_eq!(err.to_string(), "NOT_FOUND at step remove_record: site 'blog' not found");
        assert_eq!(err.kind.exit_code(), 3);
    }
}
