//! Site data model and the request/response shapes of the pipeline
//!
//! A site is the unit of deployment: one domain-bound application backed
//! by either a supervised process or a container stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Maximum length of a site name (it ends up in paths, process names and
/// compose project ids)
pub const MAX_SITE_NAME_LEN: usize = 63;

/// How a site's workload is run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteKind {
    /// Long-lived process under the host's process supervisor
    Process,
    /// Multi-container stack (workload + data store)
    Container,
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteKind::Process => write!(f, "process"),
            SiteKind::Container => write!(f, "container"),
        }
    }
}

impl FromStr for SiteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(SiteKind::Process),
            "container" => Ok(SiteKind::Container),
            other => Err(format!("unknown site kind '{}'", other)),
        }
    }
}

/// Deployment state of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteState {
    /// Name and domain reserved, nothing provisioned yet
    Pending,
    /// Port assigned, workload being materialized
    Provisioning,
    /// Workload running, proxy rule being activated
    Routing,
    /// Serving traffic
    Live,
    /// Teardown in progress (or interrupted)
    Deleting,
    /// Fully removed; only ever reported, never stored
    Deleted,
    /// A step failed; compensation has run
    Error,
}

impl SiteState {
    /// States a pipeline passes through while it holds the site lock
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            SiteState::Pending | SiteState::Provisioning | SiteState::Routing
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SiteState) -> bool {
        use SiteState::*;
        match (self, next) {
            (_, Error) => *self != Deleted,
            (_, Deleting) => *self != Deleted,
            (Pending, Provisioning) => true,
            (Provisioning, Routing) => true,
            (Routing, Live) => true,
            // Redeploy and retry both re-enter provisioning
            (Live, Provisioning) | (Error, Provisioning) => true,
            (Deleting, Deleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SiteState::Pending => "pending",
            SiteState::Provisioning => "provisioning",
            SiteState::Routing => "routing",
            SiteState::Live => "live",
            SiteState::Deleting => "deleting",
            SiteState::Deleted => "deleted",
            SiteState::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for SiteState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SiteState::Pending),
            "provisioning" => Ok(SiteState::Provisioning),
            "routing" => Ok(SiteState::Routing),
            "live" => Ok(SiteState::Live),
            "deleting" => Ok(SiteState::Deleting),
            "deleted" => Ok(SiteState::Deleted),
            "error" => Ok(SiteState::Error),
            other => Err(format!("unknown site state '{}'", other)),
        }
    }
}

/// Opaque handle to a running workload (supervisor process name or
/// compose project id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadRef(pub String);

impl WorkloadRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A deployed (or deploying) site as stored in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub kind: SiteKind,
    pub domain: String,
    /// Additional hostnames routed to the same port
    pub aliases: Vec<String>,
    pub tls_enabled: bool,
    pub port: Option<u16>,
    pub state: SiteState,
    pub workload_ref: Option<WorkloadRef>,
    /// Last pipeline step that completed successfully
    pub last_step: Option<String>,
    /// Last failure, kept for operator inspection
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    /// A freshly reserved site with no port and no workload
    pub fn pending(name: &str, kind: SiteKind, domain: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            kind,
            domain: domain.to_string(),
            aliases: Vec::new(),
            tls_enabled: false,
            port: None,
            state: SiteState::Pending,
            workload_ref: None,
            last_step: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    /// Routing metadata for this site, if it has a port
    pub fn domain_config(&self) -> Option<DomainConfig> {
        self.port.map(|port| DomainConfig {
            domain: self.domain.clone(),
            aliases: self.aliases.clone(),
            target_port: port,
            tls_enabled: self.tls_enabled,
        })
    }
}

/// Everything the proxy needs to route one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: String,
    pub aliases: Vec<String>,
    pub target_port: u16,
    pub tls_enabled: bool,
}

/// Request to deploy (or redeploy) a site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Site identifier; derived from the domain when absent
    #[serde(default)]
    pub name: Option<String>,
    pub kind: SiteKind,
    /// Relative path -> file content
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    pub domain: String,
    #[serde(default)]
    pub preferred_port: Option<u16>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tls: bool,
}

impl DeployRequest {
    pub fn new(kind: SiteKind, domain: &str) -> Self {
        Self {
            name: None,
            kind,
            files: BTreeMap::new(),
            domain: domain.to_string(),
            preferred_port: None,
            aliases: Vec::new(),
            tls: false,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_preferred_port(mut self, port: u16) -> Self {
        self.preferred_port = Some(port);
        self
    }
}

/// Outcome of a successful deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployResult {
    pub site_name: String,
    pub port: u16,
    pub domain: String,
    pub state: SiteState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub site_name: String,
}

/// Outcome of a successful delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub site_name: String,
    pub state: SiteState,
}

/// Request to load a data dump into a site's data store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub site_name: String,
    pub dump_path: std::path::PathBuf,
    /// Optional (from, to) URL rewrite run by the workload's own data layer
    #[serde(default)]
    pub rewrite_urls: Option<(String, String)>,
}

/// Normalize a domain name: lowercase, trim, strip scheme, path and
/// trailing dot, then validate its labels.
pub fn normalize_domain(domain: &str) -> Result<String, String> {
    let mut domain = domain.trim().to_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = domain.strip_prefix(scheme) {
            domain = rest.to_string();
        }
    }
    if let Some(idx) = domain.find('/') {
        domain.truncate(idx);
    }
    let domain = domain.trim_end_matches('.').to_string();

    if domain.is_empty() {
        return Err("Domain cannot be empty".to_string());
    }
    if domain.len() > 253 {
        return Err("Domain is too long".to_string());
    }
    if !domain.contains('.') {
        return Err(format!("Domain '{}' must contain a dot", domain));
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("Invalid label in domain '{}'", domain));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("Label cannot start or end with a hyphen in '{}'", domain));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("Invalid characters in domain '{}'", domain));
        }
    }

    Ok(domain)
}

/// Derive a site name from a normalized domain (`blog.example.com` ->
/// `blog-example-com`)
pub fn derive_site_name(domain: &str) -> String {
    let name: String = domain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let name = name.trim_matches('-');
    name.chars().take(MAX_SITE_NAME_LEN).collect::<String>().trim_end_matches('-').to_string()
}

/// Site names become directory names, supervisor process names and
/// compose project ids, so they are restricted to `[a-z0-9_-]`.
pub fn validate_site_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Site name cannot be empty".to_string());
    }
    if name.len() > MAX_SITE_NAME_LEN {
        return Err(format!("Site name '{}' is longer than {} characters", name, MAX_SITE_NAME_LEN));
    }
    if name.starts_with('-') || name.starts_with('_') {
        return Err(format!("Site name '{}' must start with a letter or digit", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(format!("Invalid site name '{}'", name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Blog.Example.COM").unwrap(), "blog.example.com");
        assert_eq!(normalize_domain("https://shop.example.com/").unwrap(), "shop.example.com");
        assert_eq!(normalize_domain("example.com.").unwrap(), "example.com");
    }

    #[test]
    fn test_normalize_domain_errors() {
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("localhost").is_err());
        assert!(normalize_domain("-bad.example.com").is_err());
        assert!(normalize_domain("bad_label.example.com").is_err());
        assert!(normalize_domain("a..b").is_err());
    }

    #[test]
    fn test_derive_site_name() {
        assert_eq!(derive_site_name("blog.example.com"), "blog-example-com");
        assert_eq!(derive_site_name("my-shop.co.za"), "my-shop-co-za");
        assert!(validate_site_name(&derive_site_name("blog.example.com")).is_ok());
    }

    #[test]
    fn test_validate_site_name() {
        assert!(validate_site_name("blog").is_ok());
        assert!(validate_site_name("my_site-2").is_ok());
        assert!(validate_site_name("").is_err());
        assert!(validate_site_name("../etc").is_err());
        assert!(validate_site_name("Blog").is_err());
        assert!(validate_site_name("-blog").is_err());
        assert!(validate_site_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_state_round_trip_strings() {
        for state in [
            SiteState::Pending,
            SiteState::Provisioning,
            SiteState::Routing,
            SiteState::Live,
            SiteState::Deleting,
            SiteState::Deleted,
            SiteState::Error,
        ] {
            assert_eq!(state.to_string().parse::<SiteState>().unwrap(), state);
        }
        assert!("running".parse::<SiteState>().is_err());
    }

    #[test]
    fn test_state_transitions() {
        assert!(SiteState::Pending.can_transition_to(SiteState::Provisioning));
        assert!(SiteState::Provisioning.can_transition_to(SiteState::Routing));
        assert!(SiteState::Routing.can_transition_to(SiteState::Live));
        assert!(SiteState::Live.can_transition_to(SiteState::Deleting));
        assert!(SiteState::Deleting.can_transition_to(SiteState::Deleted));
        assert!(SiteState::Routing.can_transition_to(SiteState::Error));
        assert!(SiteState::Live.can_transition_to(SiteState::Provisioning));

        assert!(!SiteState::Pending.can_transition_to(SiteState::Live));
        assert!(!SiteState::Provisioning.can_transition_to(SiteState::Live));
        assert!(!SiteState::Deleted.can_transition_to(SiteState::Error));
        assert!(!SiteState::Deleting.can_transition_to(SiteState::Live));
    }

    #[test]
    fn test_domain_config() {
        let site = Site::pending("blog", SiteKind::Process, "blog.example.com")
            .with_aliases(vec!["www.blog.example.com".to_string()])
            .with_tls(true);
        assert!(site.domain_config().is_none());

        let mut site = site;
        site.port = Some(3000);
        let config = site.domain_config().unwrap();
        assert_eq!(config.domain, "blog.example.com");
        assert_eq!(config.aliases, vec!["www.blog.example.com".to_string()]);
        assert_eq!(config.target_port, 3000);
        assert!(config.tls_enabled);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("Process".parse::<SiteKind>().unwrap(), SiteKind::Process);
        assert_eq!("container".parse::<SiteKind>().unwrap(), SiteKind::Container);
        assert!("vm".parse::<SiteKind>().is_err());
    }
}
