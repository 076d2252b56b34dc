//! End-to-end health-supervisor integration: probing, hysteresis, and
//! group re-selection driven through the real `UplinkManager` +
//! `HealthSupervisor` stack rather than a single module's unit tests.

use std::sync::Arc;
use std::time::Duration;

use glacic_core::firewall::FirewallBackend;
use glacic_core::group::{GroupConfig, HealthCheckConfig};
use glacic_core::health::HealthSupervisor;
use glacic_core::manager::{GroupDefinition, UplinkManager};
use glacic_core::mocks::{MockClock, MockCommandExecutor, MockFirewallBackend, MockNetlinkBackend};
use glacic_core::netlink::NetlinkBackend;
use glacic_core::uplink::{Uplink, UplinkType};

#[tokio::test]
async fn supervisor_fails_over_after_threshold_unreachable_probes() {
    let netlink: Arc<dyn NetlinkBackend> = Arc::new(MockNetlinkBackend::new());
    let firewall: Arc<dyn FirewallBackend> = Arc::new(MockFirewallBackend::new());
    let manager = Arc::new(UplinkManager::new(firewall, netlink));

    let mut cfg = GroupConfig::new("wan-group");
    cfg.health_check = HealthCheckConfig { targets: vec!["1.1.1.1".to_string()], probe_timeout: Duration::from_secs(1), hysteresis_threshold: 3 };
    manager
        .reload(vec![GroupDefinition {
            config: cfg,
            uplinks: vec![
                Uplink::new("wan1", UplinkType::Wan, "wan0", 0, 50),
                Uplink::new("backup", UplinkType::Wan, "wan1", 1, 50),
            ],
        }])
        .await
        .unwrap();

    let group = manager.group("wan-group").unwrap();
    assert_eq!(group.get_best_uplink().unwrap().name, "wan1");

    let command = MockCommandExecutor::new();
    let clock = MockClock::new();
    let supervisor = HealthSupervisor::new(manager.clone(), Arc::new(command.clone()), Arc::new(clock), Duration::from_secs(1));

    for _ in 0..3 {
        command.fail_on("ping", "destination unreachable");
        supervisor.check_all_groups().await.unwrap();
    }

    let uplinks = group.list_uplinks();
    let wan1 = uplinks.iter().find(|u| u.name == "wan1").unwrap();
    assert!(!wan1.healthy, "wan1 should be unhealthy after 3 consecutive failed probes");
    assert_eq!(group.get_best_uplink().unwrap().name, "backup");
    assert_eq!(group.active_uplinks(), vec!["backup".to_string()]);
}
