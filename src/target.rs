use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

lazy_static! {
    static ref DOMAIN_RE: Regex = Regex::new(r"^(?:[a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}$").unwrap();
}

/// Category of a user supplied target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Ip,
    Domain,
    Url,
    File,
    Unknown,
}

impl TargetKind {
    /// Only IPs and domains can be fed to the scan and probe graphs.
    pub fn is_scannable(self) -> bool {
        matches!(self, TargetKind::Ip | TargetKind::Domain)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Ip => write!(f, "IP"),
            TargetKind::Domain => write!(f, "DOMAIN"),
            TargetKind::Url => write!(f, "URL"),
            TargetKind::File => write!(f, "FILE"),
            TargetKind::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify `input`. Categories overlap lexically, so checks run in a fixed
/// order and the first match wins. Touches the filesystem for the path check.
pub fn classify(input: &str) -> TargetKind {
    let input = input.trim();
    if input.is_empty() {
        return TargetKind::Unknown;
    }

    let path = Path::new(input);
    if path.is_absolute() || path.exists() {
        return TargetKind::File;
    }

    if input.parse::<IpAddr>().is_ok() {
        return TargetKind::Ip;
    }

    if DOMAIN_RE.is_match(input) {
        return TargetKind::Domain;
    }

    if let Ok(url) = Url::parse(input) {
        if !url.scheme().is_empty() && url.host_str().is_some_and(|h| !h.is_empty()) {
            return TargetKind::Url;
        }
    }

    TargetKind::Unknown
}
