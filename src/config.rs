use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::combiner::CombinerSettings;
use crate::transport::{parse_endpoint, Endpoint};

pub const DEFAULT_SOURCE_NAME: &str = "node_1";
pub const DEFAULT_SOURCE_ENDPOINT: &str = "tcp://127.0.0.1:5010";
pub const DEFAULT_DEST_ENDPOINT: &str = "tcp://127.0.0.1:5020";
pub const DEFAULT_QUEUE_LENGTH: usize = 10;
pub const DEFAULT_DROP_WARN_CUTOFF: f64 = 0.5;
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8888";
pub const DEFAULT_DRAIN_INTERVAL_MS: u64 = 1;

#[derive(Debug, Deserialize, Default)]
struct ProxyConfigFile {
    source_endpoints: Option<String>,
    destination_endpoint: Option<String>,
    queue_length: Option<usize>,
    dropped_frame_warning_cutoff: Option<f64>,
    drain_interval_ms: Option<u64>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

/// A named upstream producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub sources: Vec<SourceSpec>,
    pub destination: Endpoint,
    pub queue_length: usize,
    pub drop_warn_cutoff: f64,
    pub api_addr: String,
    pub drain_interval: Duration,
}

impl ProxyConfig {
    /// Load from `LIVE_VIEW_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVE_VIEW_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ProxyConfigFile::default(),
        };
        let mut raw = RawConfig::from_file(file_cfg);
        raw.apply_env()?;
        raw.validate()
    }

    pub fn combiner_settings(&self) -> CombinerSettings {
        CombinerSettings {
            destination: self.destination.to_string(),
            queue_length: self.queue_length,
            drop_warn_cutoff: self.drop_warn_cutoff,
        }
    }
}

/// Unvalidated settings, as merged from file and environment.
struct RawConfig {
    source_endpoints: Option<String>,
    destination: String,
    queue_length: usize,
    drop_warn_cutoff: f64,
    api_addr: String,
    drain_interval_ms: u64,
}

impl RawConfig {
    fn from_file(file: ProxyConfigFile) -> Self {
        Self {
            source_endpoints: file.source_endpoints,
            destination: file
                .destination_endpoint
                .unwrap_or_else(|| DEFAULT_DEST_ENDPOINT.to_string()),
            queue_length: file.queue_length.unwrap_or(DEFAULT_QUEUE_LENGTH),
            drop_warn_cutoff: file
                .dropped_frame_warning_cutoff
                .unwrap_or(DEFAULT_DROP_WARN_CUTOFF),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            drain_interval_ms: file.drain_interval_ms.unwrap_or(DEFAULT_DRAIN_INTERVAL_MS),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(sources) = std::env::var("LIVE_VIEW_SOURCE_ENDPOINTS") {
            if !sources.trim().is_empty() {
                self.source_endpoints = Some(sources);
            }
        }
        if let Ok(dest) = std::env::var("LIVE_VIEW_DEST_ENDPOINT") {
            if !dest.trim().is_empty() {
                self.destination = dest;
            }
        }
        if let Ok(addr) = std::env::var("LIVE_VIEW_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(length) = std::env::var("LIVE_VIEW_QUEUE_LENGTH") {
            self.queue_length = length
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIVE_VIEW_QUEUE_LENGTH must be a positive integer"))?;
        }
        if let Ok(cutoff) = std::env::var("LIVE_VIEW_DROP_WARN_CUTOFF") {
            self.drop_warn_cutoff = cutoff
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIVE_VIEW_DROP_WARN_CUTOFF must be a number in 0..=1"))?;
        }
        if let Ok(interval) = std::env::var("LIVE_VIEW_DRAIN_INTERVAL_MS") {
            self.drain_interval_ms = interval.trim().parse().map_err(|_| {
                anyhow!("LIVE_VIEW_DRAIN_INTERVAL_MS must be an integer number of milliseconds")
            })?;
        }
        Ok(())
    }

    fn validate(self) -> Result<ProxyConfig> {
        if self.queue_length == 0 {
            return Err(anyhow!("queue_length must be greater than zero"));
        }
        crate::source::validate_cutoff(self.drop_warn_cutoff)?;

        let destination = parse_endpoint(&self.destination)
            .map_err(|e| anyhow!("invalid destination endpoint {}: {}", self.destination, e))?;
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid api address {}: {}", self.api_addr, e))?;

        let sources = match self.source_endpoints.as_deref() {
            Some(list) => parse_source_list(list),
            None => vec![SourceSpec {
                name: DEFAULT_SOURCE_NAME.to_string(),
                endpoint: parse_endpoint(DEFAULT_SOURCE_ENDPOINT)?,
            }],
        };
        if sources.is_empty() {
            return Err(anyhow!("no usable source endpoints configured"));
        }

        Ok(ProxyConfig {
            sources,
            destination,
            queue_length: self.queue_length,
            drop_warn_cutoff: self.drop_warn_cutoff,
            api_addr: self.api_addr,
            drain_interval: Duration::from_millis(self.drain_interval_ms),
        })
    }
}

/// Parse `name=endpoint` pairs separated by commas.
///
/// Malformed entries, bad endpoints and duplicate names are skipped with a
/// warning rather than failing the whole list.
pub fn parse_source_list(list: &str) -> Vec<SourceSpec> {
    let mut sources: Vec<SourceSpec> = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut fields = entry.split('=');
        let (Some(name), Some(endpoint), None) = (fields.next(), fields.next(), fields.next())
        else {
            log::warn!("error parsing source endpoint entry: {}", entry);
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            log::warn!("error parsing source endpoint entry (empty name): {}", entry);
            continue;
        }
        let endpoint = match parse_endpoint(endpoint) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                log::warn!("error parsing source endpoint entry {}: {}", entry, err);
                continue;
            }
        };
        if sources.iter().any(|s| s.name == name) {
            log::warn!("duplicate source name {}, keeping the first entry", name);
            continue;
        }
        sources.push(SourceSpec {
            name: name.to_string(),
            endpoint,
        });
    }
    sources
}

fn read_config_file(path: &Path) -> Result<ProxyConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
