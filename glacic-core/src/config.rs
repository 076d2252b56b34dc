//! Configuration source abstraction (spec §6.5): supplies `UplinkGroup`
//! and `Uplink` records. Deliberately minimal per spec §1's non-goals —
//! no HCL, no schema versioning, no migrations, no backups; just enough
//! structure for `glacic-netd` to demonstrate a reload.
//!
//! Grounded on `gnosis_vpn-lib::config`'s flat, serde-derived `Config`
//! record read by the concrete loader.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::group::{FailbackMode, FailoverMode, GroupConfig, HealthCheckConfig, LoadBalanceMode};
use crate::manager::GroupDefinition;
use crate::uplink::{Uplink, UplinkType};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid source network `{0}`: {1}")]
    InvalidCidr(String, String),
    #[error("duplicate uplink name `{0}` in group `{1}`")]
    DuplicateUplinkName(String, String),
    #[error("failed to load configuration: {0}")]
    Source(String),
}

/// One uplink as declared in configuration (spec §6.5's `Uplink`
/// record: name, type, interface, gateway, local_ip, tier, weight,
/// enabled).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: UplinkType,
    pub interface: String,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub tier: u32,
    #[serde(default = "default_weight")]
    pub weight: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_weight() -> u8 {
    50
}

fn default_true() -> bool {
    true
}

impl From<UplinkConfig> for Uplink {
    fn from(cfg: UplinkConfig) -> Self {
        let mut uplink = Uplink::new(cfg.name, cfg.kind, cfg.interface, cfg.tier, cfg.weight);
        uplink.gateway = cfg.gateway;
        uplink.local_ip = cfg.local_ip;
        uplink.enabled = cfg.enabled;
        uplink
    }
}

/// Health-check parameters as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfigRecord {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
    #[serde(default = "default_threshold")]
    pub hysteresis_threshold: u32,
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_threshold() -> u32 {
    3
}

impl Default for HealthCheckConfigRecord {
    fn default() -> Self {
        Self { targets: Vec::new(), probe_timeout: default_probe_timeout(), hysteresis_threshold: default_threshold() }
    }
}

impl From<HealthCheckConfigRecord> for HealthCheckConfig {
    fn from(cfg: HealthCheckConfigRecord) -> Self {
        Self { targets: cfg.targets, probe_timeout: cfg.probe_timeout, hysteresis_threshold: cfg.hysteresis_threshold }
    }
}

/// One uplink group as declared in configuration (spec §6.5's
/// `UplinkGroup` record: name, enabled flag, modes, source selectors,
/// health-check parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkGroupConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub source_networks: Vec<String>,
    #[serde(default)]
    pub source_interfaces: Vec<String>,
    #[serde(default)]
    pub source_zones: Vec<String>,
    #[serde(default)]
    pub failover_mode: FailoverMode,
    #[serde(default)]
    pub failback_mode: FailbackMode,
    #[serde(with = "humantime_serde", default)]
    pub failover_delay: Duration,
    #[serde(with = "humantime_serde", default)]
    pub failback_delay: Duration,
    #[serde(default)]
    pub load_balance_mode: LoadBalanceMode,
    #[serde(default = "default_true")]
    pub sticky_connections: bool,
    #[serde(default)]
    pub health_check: HealthCheckConfigRecord,
    #[serde(default)]
    pub uplinks: Vec<UplinkConfig>,
}

impl Default for FailoverMode {
    fn default() -> Self {
        FailoverMode::Automatic
    }
}

impl Default for FailbackMode {
    fn default() -> Self {
        FailbackMode::Automatic
    }
}

impl Default for LoadBalanceMode {
    fn default() -> Self {
        LoadBalanceMode::None
    }
}

impl UplinkGroupConfig {
    /// Converts a declared group into the runtime [`GroupDefinition`]
    /// the manager consumes, validating CIDRs and uplink-name
    /// uniqueness (spec §7's configuration-error classification).
    pub fn into_definition(self) -> Result<GroupDefinition, Error> {
        let mut seen = HashSet::new();
        for uplink in &self.uplinks {
            if !seen.insert(uplink.name.clone()) {
                return Err(Error::DuplicateUplinkName(uplink.name.clone(), self.name.clone()));
            }
        }

        let mut source_networks = Vec::with_capacity(self.source_networks.len());
        for net in &self.source_networks {
            let cidr = crate::group::parse_source_network(net).map_err(|e| Error::InvalidCidr(net.clone(), e.to_string()))?;
            source_networks.push(cidr);
        }

        let config = GroupConfig {
            name: self.name,
            source_networks,
            source_interfaces: self.source_interfaces,
            source_zones: self.source_zones,
            failover_mode: self.failover_mode,
            failback_mode: self.failback_mode,
            failover_delay: self.failover_delay,
            failback_delay: self.failback_delay,
            load_balance_mode: self.load_balance_mode,
            sticky_connections: self.sticky_connections,
            health_check: self.health_check.into(),
        };
        let uplinks = self.uplinks.into_iter().map(Uplink::from).collect();
        Ok(GroupDefinition { config, uplinks })
    }
}

/// Supplies the declared set of uplink groups (spec §6.5).
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<Vec<UplinkGroupConfig>, Error>;
}
