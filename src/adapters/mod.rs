use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::target::TargetKind;

pub mod builtin;
pub mod process;
pub mod registry;

pub use registry::AdapterRegistry;

/// Tool names used as task names and as keys of the result document.
pub const NAABU: &str = "naabu";
pub const SUBFINDER: &str = "subfinder";
pub const DNSX: &str = "dnsx";
pub const HTTPX: &str = "httpx";
pub const KATANA: &str = "katana";
pub const NUCLEI: &str = "nuclei";
pub const UNCOVER: &str = "uncover";

/// Credential key that enables the passive search stage of a probe.
pub const SHODAN_KEY: &str = "shodan";

/// The capability a tool provides inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    PortScan,
    SubdomainEnum,
    DnsResolve,
    HttpProbe,
    Crawl,
    VulnMatch,
    PassiveSearch,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ToolKind::PortScan => "port scan",
            ToolKind::SubdomainEnum => "subdomain enumeration",
            ToolKind::DnsResolve => "DNS resolution",
            ToolKind::HttpProbe => "HTTP probe",
            ToolKind::Crawl => "crawl",
            ToolKind::VulnMatch => "vulnerability match",
            ToolKind::PassiveSearch => "passive search",
        };
        f.write_str(label)
    }
}

/// Immutable inputs of a single run, shared by every adapter.
#[derive(Clone)]
pub struct RunContext {
    pub target: String,
    pub kind: TargetKind,
    credentials: HashMap<String, String>,
}

impl RunContext {
    pub fn new(target: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            target: target.into(),
            kind,
            credentials: HashMap::new(),
        }
    }

    /// Attach credentials. Blank values are dropped so that an unset key in
    /// the config file behaves like a missing one.
    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.credentials = credentials
            .into_iter()
            .filter(|(_, secret)| !secret.trim().is_empty())
            .collect();
        self
    }

    pub fn credential(&self, name: &str) -> Option<&str> {
        self.credentials.get(name).map(String::as_str)
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.credentials.keys().collect();
        keys.sort();
        f.debug_struct("RunContext")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("credentials", &keys)
            .finish()
    }
}

/// Read-only payloads of the direct dependencies of a task, keyed by tool
/// name. Dependencies that produced nothing are absent.
#[derive(Debug, Clone, Default)]
pub struct Upstream {
    payloads: BTreeMap<String, Arc<Value>>,
}

impl Upstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tool: impl Into<String>, payload: Arc<Value>) {
        self.payloads.insert(tool.into(), payload);
    }

    pub fn get(&self, tool: &str) -> Option<&Value> {
        self.payloads.get(tool).map(Arc::as_ref)
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.payloads.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Collect string values of `field` from a tool's array-of-objects payload.
    pub fn strings(&self, tool: &str, field: &str) -> Vec<String> {
        let Some(Value::Array(records)) = self.get(tool) else {
            return Vec::new();
        };
        records
            .iter()
            .filter_map(|record| record.get(field))
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Deduplicate `items` keeping first occurrences in order.
pub(crate) fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{tool} exited with status {}: {stderr}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    ExitStatus {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} produced invalid JSON on line {line}: {source}")]
    Parse {
        tool: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// One reconnaissance tool as seen by the scheduler.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Tool name, also the task name and the result document key
    fn name(&self) -> &str;

    fn kind(&self) -> ToolKind;

    fn description(&self) -> &str;

    /// Whether the tool has anything to do for this kind of target.
    fn supports(&self, target: TargetKind) -> bool {
        target.is_scannable()
    }

    /// Run the tool and return its raw structured output.
    async fn run(
        &self,
        ctx: &RunContext,
        upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> AdapterResult<Value>;
}
