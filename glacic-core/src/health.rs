//! Health supervisor (spec §4.4): periodic reachability probing,
//! hysteresis, adaptive-throughput sampling, and group re-selection.
//!
//! Grounded on `gnosis_vpn-root/src/main.rs`'s `tokio::select!`-driven
//! signal/ticker loop and on `gnosis_vpn-lib::core::runner`'s
//! spawn-a-task-report-over-a-channel shape, adapted to a synchronous
//! per-tick method (`check_all_groups`) callable both from a real
//! `tokio::time::interval` loop and directly from tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::clock::Clock;
use crate::command::{CommandExecutor, Logs};
use crate::group::{self, FailbackMode, FailoverMode, LoadBalanceMode, UplinkGroup};
use crate::manager::UplinkManager;
use crate::uplink::Uplink;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Group(#[from] group::Error),
}

/// Whether a probe reached its target, and how long it took.
#[derive(Debug, Clone, Copy)]
struct ProbeResult {
    reachable: bool,
    latency: Option<Duration>,
}

/// Tracks a pending, delay-gated switch decision for one group so
/// `failover_delay`/`failback_delay` can be honored across ticks without
/// sleeping inside the tick itself (spec §4.4's final paragraph).
#[derive(Debug, Clone, Copy)]
struct PendingDecision {
    is_recovery: bool,
    since: Instant,
}

/// Periodic driver of every group's health state (spec §4.4). Safe to
/// call [`Self::check_all_groups`] directly from tests or from a real
/// `tokio::time::interval` loop in `glacic-netd`.
pub struct HealthSupervisor {
    manager: Arc<UplinkManager>,
    command: Arc<dyn CommandExecutor>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    paused: AtomicBool,
    pending: Mutex<HashMap<String, PendingDecision>>,
}

impl HealthSupervisor {
    pub fn new(manager: Arc<UplinkManager>, command: Arc<dyn CommandExecutor>, clock: Arc<dyn Clock>, tick_interval: Duration) -> Self {
        Self {
            manager,
            command,
            clock,
            tick_interval,
            paused: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Quiesces the supervisor ahead of a manager reload (spec §5: "A
    /// reload quiesces the supervisor... then restarts it").
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Runs one tick across every group in the manager. No-op while
    /// [`Self::pause`]d.
    pub async fn check_all_groups(&self) -> Result<(), Error> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        for name in self.manager.group_names() {
            if let Some(group) = self.manager.group(&name) {
                self.check_group(&group).await?;
            }
        }
        Ok(())
    }

    async fn check_group(&self, group: &Arc<UplinkGroup>) -> Result<(), Error> {
        let uplinks = group.list_uplinks();
        let adaptive = group.config.load_balance_mode == LoadBalanceMode::Adaptive;

        for uplink in &uplinks {
            if !uplink.enabled {
                continue;
            }
            let probe = self.probe_one(group, &uplink).await;
            let threshold = group.config.health_check.hysteresis_threshold;
            group.apply_health_probe(&uplink.name, probe.reachable, probe.latency, threshold)?;

            if adaptive {
                self.sample_one(group, &uplink).await;
            }
        }

        self.reevaluate(group).await
    }

    /// Uses the uplink's custom health check if configured; otherwise
    /// attempts each configured target in order from `uplink.interface`,
    /// returning on the first success with the elapsed wall time as
    /// latency (spec §4.4 steps 1-2).
    async fn probe_one(&self, group: &UplinkGroup, uplink: &Uplink) -> ProbeResult {
        if let Some(check) = &uplink.health_check {
            return ProbeResult { reachable: check(uplink), latency: None };
        }
        let timeout = group.config.health_check.probe_timeout;
        let timeout_secs = timeout.as_secs().max(1).to_string();
        for target in &group.config.health_check.targets {
            let start = self.clock.now();
            let args = ["-I", uplink.interface.as_str(), "-c", "1", "-W", timeout_secs.as_str(), target.as_str()];
            if self.command.run("ping", &args, Logs::Suppress).await.is_ok() {
                return ProbeResult { reachable: true, latency: Some(self.clock.since(start)) };
            }
        }
        ProbeResult { reachable: false, latency: None }
    }

    async fn sample_one(&self, group: &UplinkGroup, uplink: &Uplink) {
        if let Ok(links) = self.manager.netlink().link_list().await {
            if let Some(link) = links.iter().find(|l| l.name == uplink.interface) {
                group.sample_throughput(&uplink.name, link.rx_bytes, link.tx_bytes, self.tick_interval);
            }
        }
    }

    /// Re-evaluates group selection after per-uplink updates complete
    /// (spec §4.4's final two paragraphs).
    async fn reevaluate(&self, group: &Arc<UplinkGroup>) -> Result<(), Error> {
        let uplinks = group.list_uplinks();
        let best = group.get_best_uplink();
        let active_tier = group.active_tier();
        let active_names = group.active_uplinks();
        let best_tier = best.as_ref().map(|u| u.tier);

        let is_recovery = matches!((best_tier, active_tier), (Some(bt), Some(at)) if bt < at);
        let is_loss = matches!((best_tier, active_tier), (Some(bt), Some(at)) if bt > at)
            || (active_tier.is_some() && best_tier.is_none());
        let tier_changed = is_recovery || is_loss || (active_tier.is_none() && best_tier.is_some());

        let any_active_unhealthy = uplinks.iter().any(|u| active_names.contains(&u.name) && !u.is_eligible());
        let no_active_healthy_in_tier =
            best_tier == active_tier && !uplinks.iter().any(|u| active_names.contains(&u.name) && u.is_eligible());
        let needs_switch = any_active_unhealthy || no_active_healthy_in_tier;

        let mut allowed = true;
        if is_recovery && matches!(group.config.failback_mode, FailbackMode::Never | FailbackMode::Manual) {
            allowed = false;
        }
        if (is_loss || needs_switch) && group.config.failover_mode == FailoverMode::Manual {
            allowed = false;
        }

        let trigger = (tier_changed || needs_switch) && allowed;
        let delay = if is_recovery { group.config.failback_delay } else { group.config.failover_delay };

        if self.gate(&group.config.name, trigger, is_recovery, delay) {
            if let Err(e) = group.switch_to_best().await {
                tracing::warn!(group = %group.config.name, error = %e, "selection failure, keeping previous selection");
            }
        }

        if group.config.load_balance_mode == LoadBalanceMode::Adaptive && group.update_weights() {
            group.reprogram_active_marking_rules().await?;
        }
        Ok(())
    }

    /// Returns true once `delay` has elapsed since `trigger` first became
    /// true for `group`; clears the pending record once it fires or once
    /// the condition stops holding.
    fn gate(&self, group: &str, trigger: bool, is_recovery: bool, delay: Duration) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if !trigger {
            pending.remove(group);
            return false;
        }
        match pending.get(group) {
            Some(p) if p.is_recovery == is_recovery => {
                if self.clock.since(p.since) >= delay {
                    pending.remove(group);
                    true
                } else {
                    false
                }
            }
            _ => {
                pending.insert(group.to_string(), PendingDecision { is_recovery, since: self.clock.now() });
                delay.is_zero()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::FirewallBackend;
    use crate::group::{GroupConfig, HealthCheckConfig};
    use crate::mocks::{MockClock, MockCommandExecutor, MockFirewallBackend, MockNetlinkBackend};
    use crate::uplink::UplinkType;

    fn wan(name: &str, tier: u32, weight: u8, iface: &str) -> Uplink {
        Uplink::new(name, UplinkType::Wan, iface, tier, weight)
    }

    fn supervisor() -> (Arc<UplinkManager>, HealthSupervisor, MockCommandExecutor, MockClock) {
        let netlink = Arc::new(MockNetlinkBackend::new());
        let firewall: Arc<dyn FirewallBackend> = Arc::new(MockFirewallBackend::new());
        let manager = Arc::new(UplinkManager::new(firewall, netlink));
        let command = MockCommandExecutor::new();
        let clock = MockClock::new();
        let supervisor = HealthSupervisor::new(manager.clone(), Arc::new(command.clone()), Arc::new(clock.clone()), Duration::from_secs(1));
        (manager, supervisor, command, clock)
    }

    #[tokio::test]
    async fn hysteresis_requires_threshold_consecutive_failures() {
        let (manager, supervisor, command, _clock) = supervisor();
        let mut cfg = GroupConfig::new("g");
        cfg.health_check = HealthCheckConfig { targets: vec!["203.0.113.1".into()], probe_timeout: Duration::from_secs(1), hysteresis_threshold: 3 };
        let group = manager.add_group(cfg).await;
        group.add_uplink(wan("wan1", 0, 50, "wan0"));

        for i in 0..3 {
            command.fail_on("ping", "unreachable");
            supervisor.check_all_groups().await.unwrap();
            let healthy = group.list_uplinks()[0].healthy;
            if i < 2 {
                assert!(healthy, "should stay healthy before threshold");
            } else {
                assert!(!healthy, "should flip unhealthy at threshold");
            }
        }
    }
}
