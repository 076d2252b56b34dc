//! Uplink data model (spec §3).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{Kind, RoutingMark, RoutingTable};

/// A user-supplied reachability check, invoked instead of the built-in
/// probe sweep when present (spec §4.4 step 2). Held behind `Arc` so
/// [`Uplink`] stays cheaply `Clone`.
pub type HealthCheck = Arc<dyn Fn(&Uplink) -> bool + Send + Sync>;

/// Kind of egress path an uplink represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkType {
    Wan,
    WireGuard,
    Tailscale,
    OpenVpn,
    Ipsec,
    /// Any other egress-capable interface (e.g. an opaque VPN daemon
    /// referenced only by interface name, spec §1). Carries an
    /// application-defined discriminator so the address space still has
    /// a deterministic partition slot without the core knowing anything
    /// about the tunnel's protocol.
    Custom(String),
}

impl UplinkType {
    /// Which mark/table partition this uplink type draws from (spec §3).
    pub fn address_kind(&self) -> Kind {
        match self {
            UplinkType::Wan => Kind::Wan,
            UplinkType::WireGuard => Kind::WireGuard,
            UplinkType::Tailscale => Kind::Tailscale,
            UplinkType::OpenVpn => Kind::OpenVpn,
            UplinkType::Ipsec => Kind::Ipsec,
            UplinkType::Custom(_) => Kind::VpnCustom,
        }
    }
}

/// A named egress path: a WAN interface, a VPN tunnel, or any interface
/// that can carry egressing traffic (spec §3).
#[derive(Clone)]
pub struct Uplink {
    pub name: String,
    pub kind: UplinkType,
    pub interface: String,
    pub gateway: Option<std::net::Ipv4Addr>,
    pub local_ip: Option<std::net::Ipv4Addr>,
    pub mark: RoutingMark,
    pub table: RoutingTable,
    pub tier: u32,
    pub weight: u8,
    pub enabled: bool,
    pub healthy: bool,
    pub failure_count: u32,
    pub success_count: u32,
    pub latency: Duration,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub throughput: u64,
    pub dynamic_weight: u32,
    /// Overrides the built-in reachability probe when present (spec §3's
    /// "optional user-supplied health-check capability").
    pub health_check: Option<HealthCheck>,
}

impl fmt::Debug for Uplink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uplink")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("interface", &self.interface)
            .field("gateway", &self.gateway)
            .field("local_ip", &self.local_ip)
            .field("mark", &self.mark)
            .field("table", &self.table)
            .field("tier", &self.tier)
            .field("weight", &self.weight)
            .field("enabled", &self.enabled)
            .field("healthy", &self.healthy)
            .field("failure_count", &self.failure_count)
            .field("success_count", &self.success_count)
            .field("latency", &self.latency)
            .field("rx_bytes", &self.rx_bytes)
            .field("tx_bytes", &self.tx_bytes)
            .field("throughput", &self.throughput)
            .field("dynamic_weight", &self.dynamic_weight)
            .field("health_check", &self.health_check.is_some())
            .finish()
    }
}

impl Uplink {
    /// Constructs a new uplink. Enters "healthy=true" optimistically
    /// (spec §3's lifecycle note); `mark`/`table` are assigned by the
    /// caller (typically [`crate::group::UplinkGroup::add_uplink`]) so
    /// that re-adding a preconfigured uplink can preserve its existing
    /// allocation.
    pub fn new(name: impl Into<String>, kind: UplinkType, interface: impl Into<String>, tier: u32, weight: u8) -> Self {
        Self {
            name: name.into(),
            kind,
            interface: interface.into(),
            gateway: None,
            local_ip: None,
            mark: RoutingMark::NONE,
            table: RoutingTable::MAIN,
            tier,
            weight: weight.clamp(1, 100),
            enabled: true,
            healthy: true,
            failure_count: 0,
            success_count: 0,
            latency: Duration::ZERO,
            rx_bytes: 0,
            tx_bytes: 0,
            throughput: 0,
            dynamic_weight: 0,
            health_check: None,
        }
    }

    /// Attaches a user-supplied reachability check (spec §3).
    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn is_eligible(&self) -> bool {
        self.enabled && self.healthy
    }

    /// Effective weight for load-balance tie-breaking: `dynamic_weight`
    /// when adaptive and positive, otherwise the configured weight
    /// (spec §4.3.1 step 4).
    pub fn effective_weight(&self, adaptive: bool) -> u32 {
        if adaptive && self.dynamic_weight > 0 {
            self.dynamic_weight
        } else {
            self.weight as u32
        }
    }
}
