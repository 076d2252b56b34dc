//! Uplink manager (spec §4.3's "Holds one or more `UplinkGroup`s").
//!
//! Grounded on `gnosis_vpn-root/src/routing/linux.rs`'s top-level
//! `Routing` struct, which owns the collection of per-tunnel routers
//! behind a lock and drives whole-of-state reload.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::address::MarkAllocator;
use crate::firewall::FirewallBackend;
use crate::group::{self, GroupConfig, UplinkGroup};
use crate::netlink::NetlinkBackend;
use crate::policy_routing::PolicyRoutingManager;
use crate::uplink::Uplink;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Group(#[from] group::Error),
}

/// A group's declarative definition as read from configuration (spec
/// §6.5): the group's static config plus its member uplinks.
pub struct GroupDefinition {
    pub config: GroupConfig,
    pub uplinks: Vec<Uplink>,
}

/// Owns the full set of uplink groups and the shared mark allocator and
/// policy-routing manager they all program through (spec §5: "The
/// `UplinkManager` holds a separate reader-writer lock over its `groups`
/// map").
pub struct UplinkManager {
    allocator: Arc<MarkAllocator>,
    firewall: Arc<dyn FirewallBackend>,
    netlink: Arc<dyn NetlinkBackend>,
    policy_routing: Arc<tokio::sync::Mutex<PolicyRoutingManager>>,
    groups: RwLock<HashMap<String, Arc<UplinkGroup>>>,
}

impl UplinkManager {
    pub fn new(firewall: Arc<dyn FirewallBackend>, netlink: Arc<dyn NetlinkBackend>) -> Self {
        let policy_routing = Arc::new(tokio::sync::Mutex::new(PolicyRoutingManager::new(netlink.clone())));
        Self {
            allocator: Arc::new(MarkAllocator::new()),
            firewall,
            netlink,
            policy_routing,
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn netlink(&self) -> &Arc<dyn NetlinkBackend> {
        &self.netlink
    }

    pub fn group(&self, name: &str) -> Option<Arc<UplinkGroup>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.read().unwrap().keys().cloned().collect()
    }

    fn new_group(&self, config: GroupConfig) -> Arc<UplinkGroup> {
        Arc::new(UplinkGroup::new(config, self.allocator.clone(), self.firewall.clone(), self.policy_routing.clone()))
    }

    /// Creates and installs a single group without touching any others
    /// (used by `glacic-netd` to add a group outside of a full reload).
    pub async fn add_group(&self, config: GroupConfig) -> Arc<UplinkGroup> {
        let group = self.new_group(config);
        self.groups.write().unwrap().insert(group.name().to_string(), group.clone());
        group
    }

    /// Total replacement reload (spec §3's lifecycle note: "a reload is
    /// a total replacement... There is no partial diff"). Tears down
    /// every existing group best-effort, then sets up every group in
    /// `definitions` in order, stopping at the first setup error.
    pub async fn reload(&self, definitions: Vec<GroupDefinition>) -> Result<(), Error> {
        let old = std::mem::take(&mut *self.groups.write().unwrap());
        for (name, group) in old {
            if let Err(e) = group.teardown().await {
                tracing::warn!(group = %name, error = %e, "teardown failed during reload, continuing");
            }
        }

        let mut installed = HashMap::new();
        for def in definitions {
            let group = self.new_group(def.config);
            for uplink in def.uplinks {
                group.add_uplink(uplink);
            }
            group.setup().await?;
            installed.insert(group.name().to_string(), group);
        }
        *self.groups.write().unwrap() = installed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupConfig, LoadBalanceMode};
    use crate::mocks::{MockFirewallBackend, MockNetlinkBackend};
    use crate::uplink::UplinkType;

    fn manager() -> UplinkManager {
        let firewall: Arc<dyn FirewallBackend> = Arc::new(MockFirewallBackend::new());
        let netlink: Arc<dyn NetlinkBackend> = Arc::new(MockNetlinkBackend::new());
        UplinkManager::new(firewall, netlink)
    }

    #[tokio::test]
    async fn reload_replaces_all_groups() {
        let mgr = manager();
        let mut cfg_a = GroupConfig::new("a");
        cfg_a.load_balance_mode = LoadBalanceMode::None;
        mgr.reload(vec![GroupDefinition { config: cfg_a, uplinks: vec![Uplink::new("wan1", UplinkType::Wan, "wan0", 0, 50)] }])
            .await
            .unwrap();
        assert!(mgr.group("a").is_some());

        let cfg_b = GroupConfig::new("b");
        mgr.reload(vec![GroupDefinition { config: cfg_b, uplinks: vec![] }]).await.unwrap();
        assert!(mgr.group("a").is_none());
        assert!(mgr.group("b").is_some());
    }

    #[tokio::test]
    async fn shared_allocator_avoids_cross_group_mark_collisions() {
        let mgr = manager();
        let group_a = mgr.add_group(GroupConfig::new("a")).await;
        let group_b = mgr.add_group(GroupConfig::new("b")).await;
        let u1 = group_a.add_uplink(Uplink::new("wan1", UplinkType::Wan, "wan0", 0, 50));
        let u2 = group_b.add_uplink(Uplink::new("wan2", UplinkType::Wan, "wan1", 0, 50));
        assert_ne!(u1.mark, u2.mark);
    }
}
