//! Firewall-rule backend abstraction (spec §6.2).
//!
//! Operates at the logical level the spec describes -- "mark new
//! connections from this CIDR", "restore the connmark on this
//! interface", "SNAT this uplink's marked traffic" -- rather than raw
//! chain/rule CRUD, following the split
//! `gnosis_vpn-root/src/routing/nftables_ops.rs` draws between its
//! `NfTablesOps` trait and the underlying `nftnl` batch calls.
//!
//! The backend owns a pre-existing table `glacic` with chains
//! `mark_prerouting` (filter family, prerouting hook, before NAT) and
//! `nat_postrouting` (nat family, postrouting hook). It is the only
//! authority for rules whose comment begins with `uplink_`,
//! `connmark_restore_`, or `snat_` (spec §5).

use std::net::Ipv4Addr;

use thiserror::Error;

pub const TABLE_NAME: &str = "glacic";
pub const MARK_PREROUTING_CHAIN: &str = "mark_prerouting";
pub const NAT_POSTROUTING_CHAIN: &str = "nat_postrouting";

#[derive(Debug, Error)]
pub enum Error {
    #[error("firewall backend rejected operation: {0}")]
    Rejected(String),
    #[error("invalid interface name `{0}`")]
    InvalidInterfaceName(String),
}

/// conntrack state a mark rule should match on new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtState {
    New,
    EstablishedOrRelated,
}

/// One `mark`'s share of a weighted mapping rule (spec §4.3.3 step 2).
/// The backend reconstructs each mark's `[offset, offset+weight)`
/// interval within `[0, total_weight)` from the ordered list it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedMark {
    pub mark: u32,
    pub weight: u32,
}

/// Returns the comment prefix a group's switching/setup rules share, so
/// `delete_rules_by_comment` can find and remove exactly the rules this
/// group owns (spec §4.3.2, §4.3.4).
pub fn uplink_rule_comment(group: &str, cidr: &str) -> String {
    format!("uplink_{group}_{}", escape_cidr(cidr))
}

pub fn uplink_rule_prefix(group: &str) -> String {
    format!("uplink_{group}_")
}

pub fn connmark_restore_comment(group: &str, iface: &str) -> String {
    format!("connmark_restore_{group}_{iface}")
}

pub fn connmark_restore_prefix(group: &str) -> String {
    format!("connmark_restore_{group}_")
}

pub fn snat_comment(group: &str, uplink: &str) -> String {
    format!("snat_{group}_{uplink}")
}

pub fn snat_prefix(group: &str) -> String {
    format!("snat_{group}_")
}

/// Escapes a CIDR string (`/` is not a valid nftables comment or netlink
/// attribute character) into something safe to embed in a rule comment.
pub fn escape_cidr(cidr: &str) -> String {
    cidr.replace(['.', '/', ':'], "_")
}

/// Abstraction over firewall rule programming for mark-based routing.
///
/// A single mark rule (spec §4.3.2/§4.3.3 step 2, single-uplink case):
/// for new connections matching `src_cidr`, set meta mark to `mark`,
/// then copy meta mark into the connection-tracking mark.
///
/// Implementations must choose one backend per manager lifetime and not
/// mix native and shell-fallback programming (spec §9).
pub trait FirewallBackend: Send + Sync {
    /// Installs a single-mark rule: new connections from `src_cidr` get
    /// `mark` set and stored into conntrack.
    fn add_mark_rule(&self, chain: &str, src_cidr: &str, ct_state: CtState, mark: u32, comment: &str) -> Result<(), Error>;

    /// Installs a weighted mapping rule: a uniformly random integer in
    /// `[0, sum(weights))` per new connection selects a mark via the
    /// reserved intervals in `weights`, which is then stored into
    /// conntrack (spec §4.3.3 step 2).
    fn add_numgen_mark_rule(&self, chain: &str, src_cidr: &str, weights: &[WeightedMark], comment: &str) -> Result<(), Error>;

    /// Installs a connmark-restore rule: packets arriving on `iface`
    /// belonging to an established/related connection get their
    /// conntrack mark copied back onto the packet (spec §4.3.3 step 1).
    fn add_connmark_restore(&self, chain: &str, iface: &str, comment: &str) -> Result<(), Error>;

    /// Installs an SNAT rule: traffic marked `mark` leaving via `oif`
    /// gets its source address rewritten to `snat_ip` (spec §4.3.3 step 4).
    fn add_snat(&self, chain: &str, mark: u32, oif: &str, snat_ip: Ipv4Addr, comment: &str) -> Result<(), Error>;

    /// Removes every rule in `chain` whose comment starts with `prefix`.
    fn delete_rules_by_comment(&self, chain: &str, prefix: &str) -> Result<(), Error>;

    /// Flushes (empties) a chain entirely.
    fn flush(&self, chain: &str) -> Result<(), Error>;
}
