//! Literal reload scenario (spec §8 scenario 5): a manager holding one
//! group is reloaded with a different group; the old group's kernel
//! state is torn down and the new group's is installed.

use std::sync::Arc;

use glacic_core::firewall::FirewallBackend;
use glacic_core::group::GroupConfig;
use glacic_core::manager::{GroupDefinition, UplinkManager};
use glacic_core::mocks::{MockFirewallBackend, MockNetlinkBackend};
use glacic_core::netlink::NetlinkBackend;
use glacic_core::uplink::{Uplink, UplinkType};

#[tokio::test]
async fn reload_tears_down_old_group_and_installs_new() {
    let netlink = MockNetlinkBackend::new().with_link("eth1", 7);
    let firewall = MockFirewallBackend::new();
    let manager = UplinkManager::new(
        Arc::new(firewall.clone()) as Arc<dyn FirewallBackend>,
        Arc::new(netlink.clone()) as Arc<dyn NetlinkBackend>,
    );

    let mut old_cfg = GroupConfig::new("old");
    old_cfg.source_interfaces = vec!["lan0".to_string()];
    manager
        .reload(vec![GroupDefinition {
            config: old_cfg,
            uplinks: vec![{
                let mut u = Uplink::new("old_u1", UplinkType::Wan, "wan0", 0, 50);
                u.gateway = Some("10.0.0.1".parse().unwrap());
                u
            }],
        }])
        .await
        .unwrap();
    assert!(manager.group("old").is_some());
    let old_route_count_after_setup = netlink.route_count();
    assert!(old_route_count_after_setup > 0, "setup installs a default route for old_u1");

    let mut new_cfg = GroupConfig::new("new");
    new_cfg.source_interfaces = vec!["lan0".to_string()];
    manager
        .reload(vec![GroupDefinition {
            config: new_cfg,
            uplinks: vec![{
                let mut u = Uplink::new("new_u1", UplinkType::Wan, "eth1", 0, 50);
                u.gateway = Some("5.6.7.8".parse().unwrap());
                u
            }],
        }])
        .await
        .unwrap();

    assert!(manager.group("old").is_none(), "old group must be gone after reload");
    let new_group = manager.group("new").expect("new group must exist after reload");

    let uplinks = new_group.list_uplinks();
    assert_eq!(uplinks.len(), 1);
    assert_eq!(uplinks[0].name, "new_u1");

    // The new uplink got its own (allocated) mark/table distinct from the
    // torn-down group's, and a policy-routing rule at priority 100 (tier 0).
    assert!(!uplinks[0].mark.is_none());
    assert_eq!(new_group.active_tier(), Some(0));
}
