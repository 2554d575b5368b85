use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::consts::{
    DEFAULT_COLLECTOR_PORT, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MESSAGE_QUEUE_SIZE,
    DEFAULT_WORKER_COUNT, MESSAGE_HEADER_LENGTH,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("address {0} invalid: {1}")]
    AddressInvalid(String, String),
    #[error("tls is not supported over udp")]
    TlsOverUdp,
    #[error("tls requires both server-cert and server-key")]
    TlsIdentityMissing,
    #[error("per-side stats element lists must match stats-elements in length")]
    StatsListMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

// whether a counter accumulates deltas or reports a running total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsKind {
    Delta,
    Total,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub address: String,
    pub protocol: Transport,
    pub max_buffer_size: u16,
    // zero keeps templates forever
    #[serde(with = "humantime_serde")]
    pub template_ttl: Duration,
    pub is_encrypted: bool,
    // PEM bytes, inline
    pub server_cert: String,
    pub server_key: String,
    pub ingest_worker_count: usize,
    pub message_queue_size: usize,
    pub stats_remotes: Vec<String>,
    pub aggregation: AggregationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{}", DEFAULT_COLLECTOR_PORT),
            protocol: Transport::Tcp,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            template_ttl: Duration::ZERO,
            is_encrypted: false,
            server_cert: String::new(),
            server_key: String::new(),
            ingest_worker_count: DEFAULT_WORKER_COUNT,
            message_queue_size: DEFAULT_MESSAGE_QUEUE_SIZE,
            stats_remotes: vec![],
            aggregation: AggregationConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Config, io::Error> {
        let contents = fs::read_to_string(path)?;
        let mut c: Config = serde_yaml::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        c.normalize();
        Ok(c)
    }

    // clamps values a running collector cannot work with
    pub fn normalize(&mut self) {
        if self.ingest_worker_count == 0 {
            warn!("ingest-worker-count must be at least 1, corrected");
            self.ingest_worker_count = 1;
        }
        if self.aggregation.worker_count == 0 {
            warn!("aggregation worker-count must be at least 1, corrected");
            self.aggregation.worker_count = 1;
        }
        if self.message_queue_size == 0 {
            self.message_queue_size = DEFAULT_MESSAGE_QUEUE_SIZE;
        }
        if (self.max_buffer_size as usize) < MESSAGE_HEADER_LENGTH {
            warn!(
                "max-buffer-size {} below the message header size, using {}",
                self.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE
            );
            self.max_buffer_size = DEFAULT_MAX_BUFFER_SIZE;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        if self.is_encrypted {
            if self.protocol == Transport::Udp {
                return Err(ConfigError::TlsOverUdp);
            }
            if self.server_cert.is_empty() || self.server_key.is_empty() {
                return Err(ConfigError::TlsIdentityMissing);
            }
        }
        self.aggregation.validate()
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .to_socket_addrs()
            .map_err(|e| ConfigError::AddressInvalid(self.address.clone(), e.to_string()))?
            .next()
            .ok_or_else(|| {
                ConfigError::AddressInvalid(self.address.clone(), "no address resolved".to_owned())
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AggregationConfig {
    pub worker_count: usize,
    // values copied across sides when one side has not reported them
    pub correlate_fields: Vec<String>,
    // last writer wins
    pub non_stats_elements: Vec<String>,
    // folded counters, with per-side provenance slots below
    pub stats_elements: Vec<String>,
    pub aggregated_source_stats_elements: Vec<String>,
    pub aggregated_destination_stats_elements: Vec<String>,
    // overrides the suffix-derived delta/total classification
    pub stats_element_kinds: HashMap<String, StatsKind>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        let owned = |names: &[&str]| names.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            correlate_fields: owned(&[
                "sourcePodName",
                "sourcePodNamespace",
                "sourceNodeName",
                "destinationPodName",
                "destinationPodNamespace",
                "destinationNodeName",
                "destinationClusterIPv4",
                "destinationClusterIPv6",
                "destinationServicePort",
            ]),
            non_stats_elements: owned(&["flowEndSeconds"]),
            stats_elements: owned(&[
                "packetTotalCount",
                "packetDeltaCount",
                "reversePacketTotalCount",
                "reversePacketDeltaCount",
            ]),
            aggregated_source_stats_elements: owned(&[
                "packetTotalCountFromSourceNode",
                "packetDeltaCountFromSourceNode",
                "reversePacketTotalCountFromSourceNode",
                "reversePacketDeltaCountFromSourceNode",
            ]),
            aggregated_destination_stats_elements: owned(&[
                "packetTotalCountFromDestinationNode",
                "packetDeltaCountFromDestinationNode",
                "reversePacketTotalCountFromDestinationNode",
                "reversePacketDeltaCountFromDestinationNode",
            ]),
            stats_element_kinds: HashMap::new(),
        }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregated_source_stats_elements.len() != self.stats_elements.len()
            || self.aggregated_destination_stats_elements.len() != self.stats_elements.len()
        {
            return Err(ConfigError::StatsListMismatch);
        }
        Ok(())
    }

    pub fn stats_kind(&self, element: &str) -> StatsKind {
        if let Some(kind) = self.stats_element_kinds.get(element) {
            return *kind;
        }
        if element.contains("DeltaCount") {
            StatsKind::Delta
        } else {
            StatsKind::Total
        }
    }
}
