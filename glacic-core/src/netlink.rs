//! Netlink backend abstraction (spec §6.1).
//!
//! Decouples routing logic from the raw netlink wire format, the same
//! separation `gnosis_vpn-root/src/routing/netlink_ops.rs` draws between
//! its `NetlinkOps` trait and `rtnetlink`. Production code (in
//! `glacic-netd`) wraps `rtnetlink::Handle`; tests use
//! [`crate::mocks::MockNetlinkBackend`].

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("netlink operation failed: {0}")]
    Netlink(String),
    #[error("route not found: {0}/{1}")]
    RouteNotFound(Ipv4Addr, u8),
    #[error("rule not found: fw_mark={0:#x} table={1}")]
    RuleNotFound(u32, u32),
    #[error("interface `{0}` not found")]
    NoSuchInterface(String),
}

/// Route specification decoupled from the netlink wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub if_index: u32,
    pub table_id: u32,
    pub metric: Option<u32>,
}

/// Policy routing rule specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSpec {
    pub priority: u32,
    pub fw_mark: u32,
    pub fw_mask: Option<u32>,
    pub table_id: u32,
}

/// Network link (interface) information, including cumulative byte
/// counters used by the adaptive-weight throughput sample (spec §4.4
/// step 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// IPv4 address assigned to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfo {
    pub if_index: u32,
    pub addr: Ipv4Addr,
}

/// Abstraction over netlink route/rule/link/address operations.
///
/// Implementors must be cheaply cloneable (e.g. via `Arc` or because the
/// underlying handle is already reference-counted).
#[async_trait]
pub trait NetlinkBackend: Send + Sync {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Lists routes, optionally filtered by table ID (`None` = all).
    async fn route_list(&self, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error>;

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_list(&self) -> Result<Vec<RuleSpec>, Error>;

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;
    async fn link_index(&self, name: &str) -> Result<u32, Error> {
        self.link_list()
            .await?
            .into_iter()
            .find(|l| l.name == name)
            .map(|l| l.index)
            .ok_or_else(|| Error::NoSuchInterface(name.to_string()))
    }
    async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, Error>;
}
