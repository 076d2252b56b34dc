//! Routing address space (spec §3, §4.1).
//!
//! Pure, synchronous, deterministic partitioning of the 32-bit firewall
//! mark and routing-table ID spaces into categories. No I/O; every other
//! component builds on these functions to stay consistent about which
//! mark belongs to which table.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid mark string `{0}`")]
    InvalidMarkString(String),
}

/// Discriminator for a mark/table partition, derived from a mark's high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    None,
    System,
    Wan,
    VpnWireGuard,
    VpnTailscale,
    VpnOpenVpn,
    VpnIpsec,
    VpnCustom,
    Zone,
    Qos,
    User,
    Unknown,
}

/// Kind of allocation requested from [`mark_for`]/[`table_for`]. Distinct
/// from [`Category`]: a `Kind` is an allocation request, a `Category` is
/// what a concrete mark/table turns out to belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Wan,
    WireGuard,
    Tailscale,
    OpenVpn,
    Ipsec,
    VpnCustom,
    Zone,
    QosRealtime,
    QosInteractive,
    QosBulk,
    QosBackground,
    User,
}

/// A 32-bit firewall mark. `0` is reserved ("none").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingMark(pub u32);

/// A 32-bit kernel routing-table ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingTable(pub u32);

impl fmt::Display for RoutingMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RoutingMark {
    pub const NONE: RoutingMark = RoutingMark(0x0000);

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl RoutingTable {
    pub const MAIN: RoutingTable = RoutingTable(254);
    pub const LOCAL: RoutingTable = RoutingTable(255);
    pub const DEFAULT: RoutingTable = RoutingTable(253);

    /// Tables 0 and 255 must never be overwritten (spec §3).
    pub const fn is_protected(&self) -> bool {
        self.0 == 0 || self.0 == 255
    }
}

// ============================================================================
// Partition constants
// ============================================================================

const SYSTEM_BASE: u32 = 0x0001;
const SYSTEM_SIZE: u32 = 0x00FF;

const WAN_MARK_BASE: u32 = 0x0100;
const WAN_MARK_SIZE: u32 = 0x0100;
const WAN_TABLE_BASE: u32 = 10;
const WAN_TABLE_SIZE: u32 = 20; // 10..=29

const VPN_MARK_BASE: u32 = 0x0200;
const VPN_BLOCK_SIZE: u32 = 32;

const WIREGUARD_MARK_BASE: u32 = VPN_MARK_BASE;
const WIREGUARD_TABLE_BASE: u32 = 30;
const WIREGUARD_TABLE_SIZE: u32 = 20; // 30..=49

const TAILSCALE_MARK_BASE: u32 = VPN_MARK_BASE + VPN_BLOCK_SIZE;
const TAILSCALE_TABLE_BASE: u32 = 50;
const TAILSCALE_TABLE_SIZE: u32 = 10; // 50..=59

const OPENVPN_MARK_BASE: u32 = VPN_MARK_BASE + 2 * VPN_BLOCK_SIZE;
const OPENVPN_TABLE_BASE: u32 = 60;
const OPENVPN_TABLE_SIZE: u32 = 10; // 60..=69

const IPSEC_MARK_BASE: u32 = VPN_MARK_BASE + 3 * VPN_BLOCK_SIZE;
const IPSEC_TABLE_BASE: u32 = 70;
const IPSEC_TABLE_SIZE: u32 = 10; // 70..=79

const VPN_CUSTOM_MARK_BASE: u32 = VPN_MARK_BASE + 4 * VPN_BLOCK_SIZE;
const VPN_CUSTOM_TABLE_BASE: u32 = 80;
const VPN_CUSTOM_TABLE_SIZE: u32 = 20; // 80..=99

const ZONE_MARK_BASE: u32 = 0x0300;
const ZONE_MARK_SIZE: u32 = 0x0100;

const QOS_MARK_BASE: u32 = 0x0400;
const QOS_BLOCK_SIZE: u32 = 64;
const QOS_REALTIME_BASE: u32 = QOS_MARK_BASE;
const QOS_INTERACTIVE_BASE: u32 = QOS_MARK_BASE + QOS_BLOCK_SIZE;
const QOS_BULK_BASE: u32 = QOS_MARK_BASE + 2 * QOS_BLOCK_SIZE;
const QOS_BACKGROUND_BASE: u32 = QOS_MARK_BASE + 3 * QOS_BLOCK_SIZE;

const SPECIALS_TABLE_BASE: u32 = 100;
const SPECIALS_TABLE_SIZE: u32 = 4; // 100..=103

const USER_TABLE_BASE: u32 = 200;
const USER_TABLE_SIZE: u32 = 53; // 200..=252

const USER_MARK_BASE: u32 = 0x1000;

/// System mark names in allocation order, used by `mark_for(Kind::..)`
/// callers that want the bypass/force/etc. system marks; not part of the
/// per-uplink allocation path but kept here since it shares the partition.
pub const SYSTEM_MARK_BYPASS_VPN: RoutingMark = RoutingMark(SYSTEM_BASE);
pub const SYSTEM_MARK_FORCE_VPN: RoutingMark = RoutingMark(SYSTEM_BASE + 1);
pub const SYSTEM_MARK_LOAD_BALANCE: RoutingMark = RoutingMark(SYSTEM_BASE + 2);
pub const SYSTEM_MARK_FAILOVER: RoutingMark = RoutingMark(SYSTEM_BASE + 3);
pub const SYSTEM_MARK_BLACKHOLE: RoutingMark = RoutingMark(SYSTEM_BASE + 4);
pub const SYSTEM_MARK_TRANSPARENT: RoutingMark = RoutingMark(SYSTEM_BASE + 5);
pub const SYSTEM_MARK_NO_TRACK: RoutingMark = RoutingMark(SYSTEM_BASE + 6);

fn partition(kind: Kind) -> (u32, u32) {
    match kind {
        Kind::Wan => (WAN_MARK_BASE, WAN_MARK_SIZE),
        Kind::WireGuard => (WIREGUARD_MARK_BASE, VPN_BLOCK_SIZE),
        Kind::Tailscale => (TAILSCALE_MARK_BASE, VPN_BLOCK_SIZE),
        Kind::OpenVpn => (OPENVPN_MARK_BASE, VPN_BLOCK_SIZE),
        Kind::Ipsec => (IPSEC_MARK_BASE, VPN_BLOCK_SIZE),
        Kind::VpnCustom => (VPN_CUSTOM_MARK_BASE, VPN_BLOCK_SIZE),
        Kind::Zone => (ZONE_MARK_BASE, ZONE_MARK_SIZE),
        Kind::QosRealtime => (QOS_REALTIME_BASE, QOS_BLOCK_SIZE),
        Kind::QosInteractive => (QOS_INTERACTIVE_BASE, QOS_BLOCK_SIZE),
        Kind::QosBulk => (QOS_BULK_BASE, QOS_BLOCK_SIZE),
        Kind::QosBackground => (QOS_BACKGROUND_BASE, QOS_BLOCK_SIZE),
        Kind::User => (USER_MARK_BASE, u32::MAX - USER_MARK_BASE),
    }
}

fn table_partition(kind: Kind) -> (u32, u32) {
    match kind {
        Kind::Wan => (WAN_TABLE_BASE, WAN_TABLE_SIZE),
        Kind::WireGuard => (WIREGUARD_TABLE_BASE, WIREGUARD_TABLE_SIZE),
        Kind::Tailscale => (TAILSCALE_TABLE_BASE, TAILSCALE_TABLE_SIZE),
        Kind::OpenVpn => (OPENVPN_TABLE_BASE, OPENVPN_TABLE_SIZE),
        Kind::Ipsec => (IPSEC_TABLE_BASE, IPSEC_TABLE_SIZE),
        Kind::VpnCustom => (VPN_CUSTOM_TABLE_BASE, VPN_CUSTOM_TABLE_SIZE),
        // Zone/QoS/system categories have no dedicated routing table of
        // their own in spec §3; they only ever look up `main`.
        Kind::Zone | Kind::QosRealtime | Kind::QosInteractive | Kind::QosBulk | Kind::QosBackground => {
            (RoutingTable::MAIN.0, 1)
        }
        Kind::User => (USER_TABLE_BASE, USER_TABLE_SIZE),
    }
}

/// Returns the mark for `index` within `kind`'s partition, or
/// [`RoutingMark::NONE`] if `index` exceeds the partition size.
pub fn mark_for(kind: Kind, index: u32) -> RoutingMark {
    let (base, size) = partition(kind);
    if index >= size {
        RoutingMark::NONE
    } else {
        RoutingMark(base + index)
    }
}

/// Returns the table for `index` within `kind`'s partition, or
/// [`RoutingTable::MAIN`] if `index` is out of range.
pub fn table_for(kind: Kind, index: u32) -> RoutingTable {
    let (base, size) = table_partition(kind);
    if index >= size {
        RoutingTable::MAIN
    } else {
        RoutingTable(base + index)
    }
}

/// Upper-byte category discriminator of a mark.
pub fn category_of(mark: RoutingMark) -> Category {
    if mark.is_none() {
        return Category::None;
    }
    let v = mark.0;
    if (SYSTEM_BASE..=SYSTEM_SIZE).contains(&v) {
        return Category::System;
    }
    if (WAN_MARK_BASE..WAN_MARK_BASE + WAN_MARK_SIZE).contains(&v) {
        return Category::Wan;
    }
    if (VPN_MARK_BASE..VPN_MARK_BASE + 0x0100).contains(&v) {
        return match v {
            x if (WIREGUARD_MARK_BASE..WIREGUARD_MARK_BASE + VPN_BLOCK_SIZE).contains(&x) => Category::VpnWireGuard,
            x if (TAILSCALE_MARK_BASE..TAILSCALE_MARK_BASE + VPN_BLOCK_SIZE).contains(&x) => Category::VpnTailscale,
            x if (OPENVPN_MARK_BASE..OPENVPN_MARK_BASE + VPN_BLOCK_SIZE).contains(&x) => Category::VpnOpenVpn,
            x if (IPSEC_MARK_BASE..IPSEC_MARK_BASE + VPN_BLOCK_SIZE).contains(&x) => Category::VpnIpsec,
            _ => Category::VpnCustom,
        };
    }
    if (ZONE_MARK_BASE..ZONE_MARK_BASE + ZONE_MARK_SIZE).contains(&v) {
        return Category::Zone;
    }
    if (QOS_MARK_BASE..QOS_MARK_BASE + 0x0100).contains(&v) {
        return Category::Qos;
    }
    if v >= USER_MARK_BASE {
        return Category::User;
    }
    Category::Unknown
}

/// Low-byte index of a mark within its category's partition.
pub fn index_of(mark: RoutingMark) -> u32 {
    let v = mark.0;
    match category_of(mark) {
        Category::None | Category::Unknown => 0,
        Category::System => v - SYSTEM_BASE,
        Category::Wan => v - WAN_MARK_BASE,
        Category::VpnWireGuard => v - WIREGUARD_MARK_BASE,
        Category::VpnTailscale => v - TAILSCALE_MARK_BASE,
        Category::VpnOpenVpn => v - OPENVPN_MARK_BASE,
        Category::VpnIpsec => v - IPSEC_MARK_BASE,
        Category::VpnCustom => v - VPN_CUSTOM_MARK_BASE,
        Category::Zone => v - ZONE_MARK_BASE,
        Category::Qos => v - QOS_MARK_BASE,
        Category::User => v - USER_MARK_BASE,
    }
}

/// Derives the routing table that a mark maps to, covering the WAN range,
/// VPN sub-ranges and specials, falling through to `main` (spec §4.1).
pub fn table_for_mark(mark: RoutingMark) -> RoutingTable {
    let idx = index_of(mark);
    match category_of(mark) {
        Category::Wan => table_for(Kind::Wan, idx),
        Category::VpnWireGuard => table_for(Kind::WireGuard, idx),
        Category::VpnTailscale => table_for(Kind::Tailscale, idx),
        Category::VpnOpenVpn => table_for(Kind::OpenVpn, idx),
        Category::VpnIpsec => table_for(Kind::Ipsec, idx),
        Category::VpnCustom => table_for(Kind::VpnCustom, idx),
        Category::User => table_for(Kind::User, idx),
        Category::None | Category::System | Category::Zone | Category::Qos | Category::Unknown => {
            RoutingTable::MAIN
        }
    }
}

/// Parses a mark from decimal or `0x`-prefixed hex.
pub fn parse_mark(s: &str) -> Result<RoutingMark, Error> {
    let trimmed = s.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        u32::from_str(trimmed)
    };
    parsed
        .map(RoutingMark)
        .map_err(|_| Error::InvalidMarkString(s.to_string()))
}

/// Formats a mark as `0x`-prefixed hex, the canonical round-trip form for
/// [`parse_mark`].
pub fn format_mark(mark: RoutingMark) -> String {
    format!("{:#x}", mark.0)
}

/// Formats a mark as plain decimal, an alternate round-trip form accepted
/// by [`parse_mark`].
pub fn format_mark_decimal(mark: RoutingMark) -> String {
    mark.0.to_string()
}

/// Per-process allocator handing out the next mark/table pair for a
/// [`Kind`], backing the uniqueness invariant of spec §3
/// ("`mark_to_table` is injective within a running process").
///
/// Shared (via `Arc`) across every [`crate::group::UplinkGroup`] in a
/// [`crate::manager::UplinkManager`] so that two groups never collide on
/// the same mark even though each group mutates independently under its
/// own lock (spec §5).
pub struct MarkAllocator {
    wan: std::sync::atomic::AtomicU32,
    wireguard: std::sync::atomic::AtomicU32,
    tailscale: std::sync::atomic::AtomicU32,
    openvpn: std::sync::atomic::AtomicU32,
    ipsec: std::sync::atomic::AtomicU32,
    vpn_custom: std::sync::atomic::AtomicU32,
}

impl Default for MarkAllocator {
    fn default() -> Self {
        Self {
            wan: std::sync::atomic::AtomicU32::new(0),
            wireguard: std::sync::atomic::AtomicU32::new(0),
            tailscale: std::sync::atomic::AtomicU32::new(0),
            openvpn: std::sync::atomic::AtomicU32::new(0),
            ipsec: std::sync::atomic::AtomicU32::new(0),
            vpn_custom: std::sync::atomic::AtomicU32::new(0),
        }
    }
}

impl MarkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: Kind) -> &std::sync::atomic::AtomicU32 {
        match kind {
            Kind::Wan => &self.wan,
            Kind::WireGuard => &self.wireguard,
            Kind::Tailscale => &self.tailscale,
            Kind::OpenVpn => &self.openvpn,
            Kind::Ipsec => &self.ipsec,
            Kind::VpnCustom => &self.vpn_custom,
            Kind::Zone | Kind::QosRealtime | Kind::QosInteractive | Kind::QosBulk | Kind::QosBackground | Kind::User => {
                unreachable!("uplink allocation only ever uses the WAN/VPN partitions")
            }
        }
    }

    /// Returns the next (mark, table) pair for `kind`, advancing that
    /// kind's counter. Never recycles an index within the process's
    /// lifetime.
    pub fn allocate(&self, kind: Kind) -> (RoutingMark, RoutingTable) {
        use std::sync::atomic::Ordering;
        let idx = self.counter(kind).fetch_add(1, Ordering::SeqCst);
        (mark_for(kind, idx), table_for(kind, idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wan_allocation_matches_scenario_1() {
        assert_eq!(mark_for(Kind::Wan, 0), RoutingMark(0x0100));
        assert_eq!(mark_for(Kind::Wan, 1), RoutingMark(0x0101));
        assert_eq!(mark_for(Kind::WireGuard, 0), RoutingMark(0x0200));

        assert_eq!(table_for(Kind::Wan, 0), RoutingTable(10));
        assert_eq!(table_for(Kind::Wan, 1), RoutingTable(11));
        assert_eq!(table_for(Kind::WireGuard, 0), RoutingTable(30));
    }

    #[test]
    fn out_of_range_index_falls_back() {
        assert_eq!(mark_for(Kind::WireGuard, 32), RoutingMark::NONE);
        assert_eq!(table_for(Kind::WireGuard, 999), RoutingTable::MAIN);
    }

    #[test]
    fn category_and_index_are_consistent_across_partitions() {
        for (kind, category) in [
            (Kind::Wan, Category::Wan),
            (Kind::WireGuard, Category::VpnWireGuard),
            (Kind::Tailscale, Category::VpnTailscale),
            (Kind::OpenVpn, Category::VpnOpenVpn),
            (Kind::Ipsec, Category::VpnIpsec),
            (Kind::VpnCustom, Category::VpnCustom),
        ] {
            for idx in 0..4 {
                let mark = mark_for(kind, idx);
                assert_eq!(category_of(mark), category);
                assert_eq!(index_of(mark), idx);
            }
        }
    }

    #[test]
    fn table_for_mark_covers_wan_and_vpn_and_falls_through() {
        assert_eq!(table_for_mark(mark_for(Kind::Wan, 2)), RoutingTable(12));
        assert_eq!(table_for_mark(mark_for(Kind::WireGuard, 1)), RoutingTable(31));
        assert_eq!(table_for_mark(mark_for(Kind::Tailscale, 0)), RoutingTable(50));
        assert_eq!(table_for_mark(SYSTEM_MARK_BYPASS_VPN), RoutingTable::MAIN);
        assert_eq!(table_for_mark(RoutingMark::NONE), RoutingTable::MAIN);
    }

    #[test]
    fn parse_mark_accepts_decimal_and_hex() {
        assert_eq!(parse_mark("256").unwrap(), RoutingMark(256));
        assert_eq!(parse_mark("0x100").unwrap(), RoutingMark(0x100));
        assert_eq!(parse_mark("0X100").unwrap(), RoutingMark(0x100));
        assert!(parse_mark("not-a-mark").is_err());
    }

    #[test]
    fn parse_format_round_trip_hex_and_decimal() {
        for v in [0u32, 1, 0x100, 0xABCDEF, u32::MAX] {
            let mark = RoutingMark(v);
            assert_eq!(parse_mark(&format_mark(mark)).unwrap(), mark);
            assert_eq!(parse_mark(&format_mark_decimal(mark)).unwrap(), mark);
        }
    }

    #[test]
    fn allocation_is_non_aliasing_within_a_partition() {
        let mut seen = std::collections::HashSet::new();
        for idx in 0..20 {
            let mark = mark_for(Kind::Wan, idx);
            assert!(seen.insert(mark), "mark {mark} aliased at index {idx}");
            let table = table_for(Kind::Wan, idx);
            assert!(table.0 >= WAN_TABLE_BASE && table.0 < WAN_TABLE_BASE + WAN_TABLE_SIZE);
        }
    }

    #[test]
    fn mark_allocator_reproduces_scenario_1() {
        let alloc = MarkAllocator::new();
        let (m0, t0) = alloc.allocate(Kind::Wan);
        let (m1, t1) = alloc.allocate(Kind::Wan);
        let (m2, t2) = alloc.allocate(Kind::WireGuard);

        assert_eq!(m0, RoutingMark(0x0100));
        assert_eq!(m1, RoutingMark(0x0101));
        assert_eq!(m2, RoutingMark(0x0200));
        assert_eq!(t0, RoutingTable(10));
        assert_eq!(t1, RoutingTable(11));
        assert_eq!(t2, RoutingTable(30));
    }

    #[test]
    fn protected_tables_are_flagged() {
        assert!(RoutingTable(0).is_protected());
        assert!(RoutingTable::LOCAL.is_protected());
        assert!(!RoutingTable::MAIN.is_protected());
    }
}
