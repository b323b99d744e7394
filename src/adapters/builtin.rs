use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::process::ToolCommand;
use super::{
    dedup, AdapterError, AdapterResult, RunContext, ToolAdapter, ToolKind, Upstream, DNSX, HTTPX,
    KATANA, NAABU, NUCLEI, SHODAN_KEY, SUBFINDER, UNCOVER,
};
use crate::target::TargetKind;

/// Results requested from the passive search engine.
const UNCOVER_LIMIT: u32 = 50;

fn program(paths: &HashMap<String, PathBuf>, tool: &str) -> PathBuf {
    paths
        .get(tool)
        .cloned()
        .unwrap_or_else(|| PathBuf::from(tool))
}

/// Every built-in adapter, with binary paths overridable per tool name.
pub fn default_adapters(paths: &HashMap<String, PathBuf>) -> Vec<Arc<dyn ToolAdapter>> {
    vec![
        Arc::new(NaabuAdapter::new(program(paths, NAABU))),
        Arc::new(SubfinderAdapter::new(program(paths, SUBFINDER))),
        Arc::new(DnsxAdapter::new(program(paths, DNSX))),
        Arc::new(HttpxAdapter::new(program(paths, HTTPX))),
        Arc::new(KatanaAdapter::new(program(paths, KATANA))),
        Arc::new(NucleiAdapter::new(program(paths, NUCLEI))),
        Arc::new(UncoverAdapter::new(program(paths, UNCOVER))),
    ]
}

/// Port scanner.
pub struct NaabuAdapter {
    program: PathBuf,
}

impl NaabuAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ToolAdapter for NaabuAdapter {
    fn name(&self) -> &str {
        NAABU
    }

    fn kind(&self) -> ToolKind {
        ToolKind::PortScan
    }

    fn description(&self) -> &str {
        "Fast TCP port scan of the target"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        _upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> AdapterResult<Value> {
        ToolCommand::new(NAABU, &self.program)
            .args(["-host", ctx.target.as_str(), "-json", "-silent"])
            .run_jsonl(cancel)
            .await
    }
}

/// Passive subdomain enumeration, domains only.
pub struct SubfinderAdapter {
    program: PathBuf,
}

impl SubfinderAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ToolAdapter for SubfinderAdapter {
    fn name(&self) -> &str {
        SUBFINDER
    }

    fn kind(&self) -> ToolKind {
        ToolKind::SubdomainEnum
    }

    fn description(&self) -> &str {
        "Passive subdomain enumeration"
    }

    fn supports(&self, target: TargetKind) -> bool {
        target == TargetKind::Domain
    }

    async fn run(
        &self,
        ctx: &RunContext,
        _upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> AdapterResult<Value> {
        ToolCommand::new(SUBFINDER, &self.program)
            .args(["-d", ctx.target.as_str(), "-json", "-silent"])
            .run_jsonl(cancel)
            .await
    }
}

/// Resolves the target and every enumerated subdomain.
pub struct DnsxAdapter {
    program: PathBuf,
}

impl DnsxAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn inputs(ctx: &RunContext, upstream: &Upstream) -> Vec<String> {
        dedup(std::iter::once(ctx.target.clone()).chain(upstream.strings(SUBFINDER, "host")))
    }
}

#[async_trait]
impl ToolAdapter for DnsxAdapter {
    fn name(&self) -> &str {
        DNSX
    }

    fn kind(&self) -> ToolKind {
        ToolKind::DnsResolve
    }

    fn description(&self) -> &str {
        "A/AAAA/CNAME resolution of the target and its subdomains"
    }

    fn supports(&self, target: TargetKind) -> bool {
        target == TargetKind::Domain
    }

    async fn run(
        &self,
        ctx: &RunContext,
        upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> AdapterResult<Value> {
        ToolCommand::new(DNSX, &self.program)
            .args(["-json", "-silent", "-a", "-aaaa", "-cname", "-resp"])
            .stdin_lines(Self::inputs(ctx, upstream))
            .run_jsonl(cancel)
            .await
    }
}

/// HTTP service discovery over resolved hosts and open ports.
pub struct HttpxAdapter {
    program: PathBuf,
}

impl HttpxAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn inputs(ctx: &RunContext, upstream: &Upstream) -> Vec<String> {
        let mut inputs = vec![ctx.target.clone()];
        inputs.extend(upstream.strings(DNSX, "host"));
        inputs.extend(open_ports(upstream));
        dedup(inputs)
    }
}

/// `host:port` pairs from the port scanner payload. Older naabu releases
/// emit `"port": 80`, newer ones `"port": {"Port": 80, ...}`.
fn open_ports(upstream: &Upstream) -> Vec<String> {
    let Some(Value::Array(records)) = upstream.get(NAABU) else {
        return Vec::new();
    };

    records
        .iter()
        .filter_map(|record| {
            let host = record
                .get("host")
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
                .or_else(|| record.get("ip").and_then(Value::as_str))?;
            let port = match record.get("port")? {
                Value::Number(n) => n.as_u64()?,
                Value::Object(obj) => obj.get("Port").and_then(Value::as_u64)?,
                _ => return None,
            };
            Some(format!("{host}:{port}"))
        })
        .collect()
}

#[async_trait]
impl ToolAdapter for HttpxAdapter {
    fn name(&self) -> &str {
        HTTPX
    }

    fn kind(&self) -> ToolKind {
        ToolKind::HttpProbe
    }

    fn description(&self) -> &str {
        "HTTP probing with title, status and technology detection"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> AdapterResult<Value> {
        ToolCommand::new(HTTPX, &self.program)
            .args(["-json", "-silent", "-title", "-status-code", "-tech-detect"])
            .stdin_lines(Self::inputs(ctx, upstream))
            .run_jsonl(cancel)
            .await
    }
}

/// Live URLs found by the HTTP probe, falling back to the bare target.
fn live_urls(ctx: &RunContext, upstream: &Upstream) -> Vec<String> {
    let urls = dedup(upstream.strings(HTTPX, "url"));
    if urls.is_empty() {
        vec![ctx.target.clone()]
    } else {
        urls
    }
}

/// Web crawler seeded with live URLs.
pub struct KatanaAdapter {
    program: PathBuf,
}

impl KatanaAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ToolAdapter for KatanaAdapter {
    fn name(&self) -> &str {
        KATANA
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Crawl
    }

    fn description(&self) -> &str {
        "Crawl of every live HTTP endpoint"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> AdapterResult<Value> {
        ToolCommand::new(KATANA, &self.program)
            .args(["-jsonl", "-silent"])
            .stdin_lines(live_urls(ctx, upstream))
            .run_jsonl(cancel)
            .await
    }
}

/// Template based vulnerability matching against live URLs.
pub struct NucleiAdapter {
    program: PathBuf,
}

impl NucleiAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ToolAdapter for NucleiAdapter {
    fn name(&self) -> &str {
        NUCLEI
    }

    fn kind(&self) -> ToolKind {
        ToolKind::VulnMatch
    }

    fn description(&self) -> &str {
        "Template based vulnerability matching"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> AdapterResult<Value> {
        ToolCommand::new(NUCLEI, &self.program)
            .args(["-jsonl", "-silent"])
            .stdin_lines(live_urls(ctx, upstream))
            .run_jsonl(cancel)
            .await
    }
}

/// Passive search engine lookup; needs a Shodan API key.
pub struct UncoverAdapter {
    program: PathBuf,
}

impl UncoverAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ToolAdapter for UncoverAdapter {
    fn name(&self) -> &str {
        UNCOVER
    }

    fn kind(&self) -> ToolKind {
        ToolKind::PassiveSearch
    }

    fn description(&self) -> &str {
        "Passive search of exposed services (Shodan)"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        _upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> AdapterResult<Value> {
        let key = ctx
            .credential(SHODAN_KEY)
            .ok_or(AdapterError::MissingCredential(SHODAN_KEY))?;

        let query = format!("ssl:{}", ctx.target);
        let limit = UNCOVER_LIMIT.to_string();

        ToolCommand::new(UNCOVER, &self.program)
            .args(["-q", query.as_str(), "-e", "shodan", "-json", "-silent"])
            .args(["-l", limit.as_str()])
            .env("SHODAN_API_KEY", key)
            .run_jsonl(cancel)
            .await
    }
}
