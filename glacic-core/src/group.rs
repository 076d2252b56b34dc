//! Uplink group engine (spec §4.3): selection, switching, kernel
//! programming and adaptive weights for one set of uplinks sharing a
//! failover/load-balance policy.
//!
//! Grounded on `gnosis_vpn-root/src/routing/linux.rs`'s `Router` struct:
//! a handle holding borrowed backend references plus accumulated
//! installed state, exposing paired `setup`/`teardown` lifecycle
//! operations. Here that is generalized from one VPN tunnel to N
//! tiered/weighted uplinks.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{MarkAllocator, RoutingMark};
use crate::firewall::{self, CtState, FirewallBackend, WeightedMark, MARK_PREROUTING_CHAIN, NAT_POSTROUTING_CHAIN};
use crate::policy_routing::{self, PolicyRoutingManager, Route, Rule, TableConfig};
use crate::uplink::Uplink;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Firewall(#[from] firewall::Error),
    #[error(transparent)]
    PolicyRouting(#[from] policy_routing::Error),
    #[error("no healthy uplink available in group `{0}`")]
    NoHealthyUplink(String),
    #[error("uplink `{0}` not found in group")]
    NoSuchUplink(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverMode {
    Automatic,
    Programmatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailbackMode {
    Automatic,
    Never,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceMode {
    None,
    Latency,
    Weighted,
    Adaptive,
    RoundRobin,
    Random,
}

/// Health-check parameters for one group (spec §3, §4.4).
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub targets: Vec<String>,
    pub probe_timeout: Duration,
    pub hysteresis_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            probe_timeout: Duration::from_secs(2),
            hysteresis_threshold: 3,
        }
    }
}

/// Static configuration of one uplink group (spec §3).
pub struct GroupConfig {
    pub name: String,
    pub source_networks: Vec<Ipv4Cidr>,
    pub source_interfaces: Vec<String>,
    pub source_zones: Vec<String>,
    pub failover_mode: FailoverMode,
    pub failback_mode: FailbackMode,
    pub failover_delay: Duration,
    pub failback_delay: Duration,
    pub load_balance_mode: LoadBalanceMode,
    pub sticky_connections: bool,
    pub health_check: HealthCheckConfig,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_networks: Vec::new(),
            source_interfaces: Vec::new(),
            source_zones: Vec::new(),
            failover_mode: FailoverMode::Automatic,
            failback_mode: FailbackMode::Automatic,
            failover_delay: Duration::ZERO,
            failback_delay: Duration::ZERO,
            load_balance_mode: LoadBalanceMode::None,
            sticky_connections: true,
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// A user-supplied programmatic selection hook (spec §4.3.1 step 1).
pub type SwitchDecider = Box<dyn Fn(&[Uplink]) -> Option<Uplink> + Send + Sync>;
pub type SwitchCallback = Box<dyn Fn(Option<&Uplink>, &Uplink) + Send + Sync>;
pub type TierChangeCallback = Box<dyn Fn(Option<u32>, u32) + Send + Sync>;
pub type HealthChangeCallback = Box<dyn Fn(&Uplink, bool) + Send + Sync>;

#[derive(Debug, Default)]
struct GroupState {
    uplinks: Vec<Uplink>,
    current_mark: RoutingMark,
    active_tier: Option<u32>,
    active_uplinks: Vec<String>,
}

/// One set of uplinks sharing a failover/load-balance policy (spec §3).
///
/// Owns a reader-writer lock over its mutable state; mutating APIs
/// acquire the writer briefly, accessors acquire the reader and return
/// owned copies to avoid iterator aliasing (spec §5).
pub struct UplinkGroup {
    pub config: GroupConfig,
    allocator: Arc<MarkAllocator>,
    firewall: Arc<dyn FirewallBackend>,
    policy_routing: Arc<tokio::sync::Mutex<PolicyRoutingManager>>,
    state: RwLock<GroupState>,
    switch_decider: Option<SwitchDecider>,
    on_switch: Option<SwitchCallback>,
    on_tier_change: Option<TierChangeCallback>,
    on_health_change: Option<HealthChangeCallback>,
}

impl UplinkGroup {
    pub fn new(
        config: GroupConfig,
        allocator: Arc<MarkAllocator>,
        firewall: Arc<dyn FirewallBackend>,
        policy_routing: Arc<tokio::sync::Mutex<PolicyRoutingManager>>,
    ) -> Self {
        Self {
            config,
            allocator,
            firewall,
            policy_routing,
            state: RwLock::new(GroupState::default()),
            switch_decider: None,
            on_switch: None,
            on_tier_change: None,
            on_health_change: None,
        }
    }

    pub fn with_switch_decider(mut self, decider: SwitchDecider) -> Self {
        self.switch_decider = Some(decider);
        self
    }

    pub fn with_on_switch(mut self, cb: SwitchCallback) -> Self {
        self.on_switch = Some(cb);
        self
    }

    pub fn with_on_tier_change(mut self, cb: TierChangeCallback) -> Self {
        self.on_tier_change = Some(cb);
        self
    }

    pub fn with_on_health_change(mut self, cb: HealthChangeCallback) -> Self {
        self.on_health_change = Some(cb);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    // ------------------------------------------------------------------
    // Accessors (read lock, return copies)
    // ------------------------------------------------------------------

    pub fn list_uplinks(&self) -> Vec<Uplink> {
        self.state.read().unwrap().uplinks.clone()
    }

    pub fn current_mark(&self) -> RoutingMark {
        self.state.read().unwrap().current_mark
    }

    pub fn active_tier(&self) -> Option<u32> {
        self.state.read().unwrap().active_tier
    }

    pub fn active_uplinks(&self) -> Vec<String> {
        self.state.read().unwrap().active_uplinks.clone()
    }

    fn find(&self, name: &str) -> Option<Uplink> {
        self.state.read().unwrap().uplinks.iter().find(|u| u.name == name).cloned()
    }

    // ------------------------------------------------------------------
    // Mutating APIs (write lock)
    // ------------------------------------------------------------------

    /// Adds (or idempotently re-adds) an uplink. Re-adding a
    /// preconfigured uplink (same `name`) preserves its previously
    /// assigned mark/table (spec §3's invariant).
    pub fn add_uplink(&self, mut uplink: Uplink) -> Uplink {
        let mut state = self.state.write().unwrap();
        if let Some(idx) = state.uplinks.iter().position(|u| u.name == uplink.name) {
            let existing = &state.uplinks[idx];
            uplink.mark = existing.mark;
            uplink.table = existing.table;
            state.uplinks[idx] = uplink.clone();
        } else {
            let (mark, table) = self.allocator.allocate(uplink.kind.address_kind());
            uplink.mark = mark;
            uplink.table = table;
            state.uplinks.push(uplink.clone());
        }
        uplink
    }

    /// Directly sets an uplink's health, bypassing the supervisor's
    /// hysteresis -- used by tests and by any caller (e.g. the health
    /// supervisor itself) that has already resolved the hysteresis
    /// decision.
    pub fn set_uplink_health(&self, name: &str, healthy: bool) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        let uplink = state
            .uplinks
            .iter_mut()
            .find(|u| u.name == name)
            .ok_or_else(|| Error::NoSuchUplink(name.to_string()))?;
        let changed = uplink.healthy != healthy;
        uplink.healthy = healthy;
        if changed {
            let snapshot = uplink.clone();
            drop(state);
            if let Some(cb) = &self.on_health_change {
                cb(&snapshot, healthy);
            }
        }
        Ok(())
    }

    /// Applies one tick's reachability result to `name` via the
    /// hysteresis rule (spec §4.4 step 3): `threshold` consecutive
    /// successes raise it healthy, `threshold` consecutive failures drop
    /// it. Returns the new health value on a transition, firing
    /// `on_health_change`; `None` if nothing changed.
    pub fn apply_health_probe(&self, name: &str, reachable: bool, latency: Option<Duration>, threshold: u32) -> Result<Option<bool>, Error> {
        let transition = {
            let mut state = self.state.write().unwrap();
            let uplink = state
                .uplinks
                .iter_mut()
                .find(|u| u.name == name)
                .ok_or_else(|| Error::NoSuchUplink(name.to_string()))?;
            if reachable {
                uplink.failure_count = 0;
                uplink.success_count += 1;
                if let Some(l) = latency {
                    uplink.latency = l;
                }
                if uplink.success_count >= threshold && !uplink.healthy {
                    uplink.healthy = true;
                    Some((uplink.clone(), true))
                } else {
                    None
                }
            } else {
                uplink.success_count = 0;
                uplink.failure_count += 1;
                if uplink.failure_count >= threshold && uplink.healthy {
                    uplink.healthy = false;
                    Some((uplink.clone(), false))
                } else {
                    None
                }
            }
        };

        match transition {
            Some((snapshot, healthy)) => {
                if let Some(cb) = &self.on_health_change {
                    cb(&snapshot, healthy);
                }
                Ok(Some(healthy))
            }
            None => Ok(None),
        }
    }

    /// Updates the cumulative byte counters and derived `throughput` for
    /// one uplink (spec §4.4 step 4). `elapsed` is the sampling interval.
    /// Counter regressions (interface reset/overflow) are skipped.
    pub fn sample_throughput(&self, name: &str, rx_bytes: u64, tx_bytes: u64, elapsed: Duration) {
        self.with_uplink_mut(name, |u| {
            if rx_bytes < u.rx_bytes || tx_bytes < u.tx_bytes || elapsed.is_zero() {
                u.rx_bytes = rx_bytes;
                u.tx_bytes = tx_bytes;
                return;
            }
            let delta = (rx_bytes - u.rx_bytes) + (tx_bytes - u.tx_bytes);
            u.throughput = (delta as f64 / elapsed.as_secs_f64()) as u64;
            u.rx_bytes = rx_bytes;
            u.tx_bytes = tx_bytes;
        });
    }

    /// Mutable access for the health supervisor to update per-tick
    /// counters (latency/throughput/byte counters) without going through
    /// the public setters one field at a time.
    pub fn with_uplink_mut<R>(&self, name: &str, f: impl FnOnce(&mut Uplink) -> R) -> Option<R> {
        let mut state = self.state.write().unwrap();
        state.uplinks.iter_mut().find(|u| u.name == name).map(f)
    }

    // ------------------------------------------------------------------
    // Selection (spec §4.3.1)
    // ------------------------------------------------------------------

    pub fn get_best_uplink(&self) -> Option<Uplink> {
        let uplinks = self.list_uplinks();
        self.best_of(&uplinks, None)
    }

    /// Best uplink restricted to `tier`, if given; otherwise the global
    /// best across all tiers (spec §4.3.1).
    fn best_of(&self, uplinks: &[Uplink], tier: Option<u32>) -> Option<Uplink> {
        if self.config.failover_mode == FailoverMode::Programmatic {
            if let Some(decider) = &self.switch_decider {
                if let Some(u) = decider(uplinks) {
                    return Some(u);
                }
            }
        }

        let best_tier = match tier {
            Some(t) => t,
            None => uplinks.iter().filter(|u| u.is_eligible()).map(|u| u.tier).min()?,
        };
        let candidates: Vec<&Uplink> = uplinks.iter().filter(|u| u.is_eligible() && u.tier == best_tier).collect();
        if candidates.is_empty() {
            return None;
        }

        match self.config.load_balance_mode {
            LoadBalanceMode::None => Some(candidates[0].clone()),
            LoadBalanceMode::Latency => candidates.into_iter().min_by_key(|u| u.latency).cloned(),
            LoadBalanceMode::Weighted | LoadBalanceMode::Adaptive => {
                let adaptive = matches!(self.config.load_balance_mode, LoadBalanceMode::Adaptive);
                Self::max_by_weight(&candidates, adaptive).cloned()
            }
            // Actual distribution happens via the kernel numgen rule; the
            // caller-visible "active" representative defaults to the
            // first eligible candidate (spec §4.3.1 step 4).
            LoadBalanceMode::RoundRobin | LoadBalanceMode::Random => Some(candidates[0].clone()),
        }
    }

    /// Picks the maximum-weight candidate, preferring the earliest
    /// (insertion-order) candidate on ties.
    fn max_by_weight<'a>(candidates: &[&'a Uplink], adaptive: bool) -> Option<&'a Uplink> {
        candidates.iter().copied().fold(None, |best, u| match best {
            None => Some(u),
            Some(b) if u.effective_weight(adaptive) > b.effective_weight(adaptive) => Some(u),
            Some(b) => Some(b),
        })
    }

    // ------------------------------------------------------------------
    // Switching (spec §4.3.2)
    // ------------------------------------------------------------------

    /// Switches the group's active selection to `new` and reprograms the
    /// marking rules for every source network.
    pub async fn switch_to(&self, new: &Uplink) -> Result<(), Error> {
        let old = {
            let mut state = self.state.write().unwrap();
            let old = if state.current_mark.is_none() {
                None
            } else {
                state.uplinks.iter().find(|u| u.mark == state.current_mark).cloned()
            };
            state.current_mark = new.mark;
            state.active_tier = Some(new.tier);
            state.active_uplinks = vec![new.name.clone()];
            old
        };

        self.reprogram_marking_rules(new.tier).await?;

        if let Some(cb) = &self.on_switch {
            cb(old.as_ref(), new);
        }
        let tier_changed = old.as_ref().map(|o| o.tier) != Some(new.tier);
        if tier_changed {
            if let Some(cb) = &self.on_tier_change {
                cb(old.as_ref().map(|o| o.tier), new.tier);
            }
        }
        Ok(())
    }

    /// Runs [`Self::get_best_uplink`] and switches to it. Returns
    /// [`Error::NoHealthyUplink`] if none exists (spec §7's selection
    /// failure, which the supervisor logs and continues past).
    pub async fn switch_to_best(&self) -> Result<(), Error> {
        let best = self.get_best_uplink().ok_or_else(|| Error::NoHealthyUplink(self.config.name.clone()))?;
        self.switch_to(&best).await
    }

    /// Switches to the best eligible uplink within a specific tier.
    pub async fn switch_to_tier(&self, tier: u32) -> Result<(), Error> {
        let uplinks = self.list_uplinks();
        let best = self
            .best_of(&uplinks, Some(tier))
            .ok_or_else(|| Error::NoHealthyUplink(self.config.name.clone()))?;

        if matches!(self.config.load_balance_mode, LoadBalanceMode::Weighted | LoadBalanceMode::Adaptive) {
            let eligible_names: Vec<String> = uplinks
                .iter()
                .filter(|u| u.is_eligible() && u.tier == tier)
                .map(|u| u.name.clone())
                .collect();
            if eligible_names.len() > 1 {
                {
                    let mut state = self.state.write().unwrap();
                    state.current_mark = best.mark;
                    state.active_tier = Some(tier);
                    state.active_uplinks = eligible_names;
                }
                return self.reprogram_marking_rules(tier).await.map_err(Error::from);
            }
        }
        self.switch_to(&best).await
    }

    /// Recomputes the marking rule(s) for `tier`: a single mark rule if
    /// only one uplink is eligible there (or load-balancing is off), a
    /// weighted numgen rule otherwise (spec §4.3.3 step 2).
    async fn reprogram_marking_rules(&self, tier: u32) -> Result<(), Error> {
        let uplinks = self.list_uplinks();
        let eligible: Vec<&Uplink> = uplinks.iter().filter(|u| u.is_eligible() && u.tier == tier).collect();
        let adaptive = matches!(self.config.load_balance_mode, LoadBalanceMode::Adaptive);
        let use_single = eligible.len() <= 1 || self.config.load_balance_mode == LoadBalanceMode::None;

        for net in &self.config.source_networks {
            let cidr_str = net.to_string();
            let comment = firewall::uplink_rule_comment(&self.config.name, &cidr_str);
            self.firewall.delete_rules_by_comment(MARK_PREROUTING_CHAIN, &comment)?;

            if eligible.is_empty() {
                tracing::warn!(group = %self.config.name, cidr = %cidr_str, "no eligible uplink, leaving source network unmarked");
                continue;
            }

            if use_single {
                let mark = Self::max_by_weight(&eligible, adaptive).unwrap_or(eligible[0]).mark.0;
                self.firewall.add_mark_rule(MARK_PREROUTING_CHAIN, &cidr_str, CtState::New, mark, &comment)?;
            } else {
                let weights: Vec<WeightedMark> = eligible
                    .iter()
                    .filter_map(|u| {
                        let w = u.effective_weight(adaptive);
                        if w == 0 {
                            return None;
                        }
                        Some(WeightedMark { mark: u.mark.0, weight: w })
                    })
                    .collect();
                self.firewall.add_numgen_mark_rule(MARK_PREROUTING_CHAIN, &cidr_str, &weights, &comment)?;
            }
        }
        Ok(())
    }

    /// Reprograms the weighted marking rules at the current active tier;
    /// called by the supervisor after [`Self::update_weights`] reports a
    /// change (spec §4.3.5).
    pub async fn reprogram_active_marking_rules(&self) -> Result<(), Error> {
        let tier = self.active_tier().or_else(|| {
            let uplinks = self.list_uplinks();
            uplinks.iter().filter(|u| u.is_eligible()).map(|u| u.tier).min()
        });
        match tier {
            Some(t) => self.reprogram_marking_rules(t).await,
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Setup / Teardown (spec §4.3.3 / §4.3.4)
    // ------------------------------------------------------------------

    pub async fn setup(&self) -> Result<(), Error> {
        let uplinks = self.list_uplinks();

        if let Some(best) = self.best_of(&uplinks, None) {
            let mut state = self.state.write().unwrap();
            state.current_mark = best.mark;
            state.active_tier = Some(best.tier);
            state.active_uplinks = vec![best.name.clone()];
        }

        for iface in &self.config.source_interfaces {
            let comment = firewall::connmark_restore_comment(&self.config.name, iface);
            self.firewall.add_connmark_restore(MARK_PREROUTING_CHAIN, iface, &comment)?;
        }

        if let Some(tier) = self.active_tier() {
            self.reprogram_marking_rules(tier).await?;
        }

        let mut pr = self.policy_routing.lock().await;
        for uplink in &uplinks {
            let priority = 100 + uplink.tier * 10;
            pr.add_rule(Rule::by_mark(priority, uplink.mark.0, uplink.table.0)).await?;

            if let Some(gateway) = uplink.gateway {
                let route = Route::default_via(gateway, uplink.interface.clone());
                pr.create_table(uplink.table.0, TableConfig { routes: vec![route] }).await?;
            }

            if let Some(local_ip) = uplink.local_ip {
                let comment = firewall::snat_comment(&self.config.name, &uplink.name);
                self.firewall
                    .add_snat(NAT_POSTROUTING_CHAIN, uplink.mark.0, &uplink.interface, local_ip, &comment)?;
            }
        }
        Ok(())
    }

    /// Reverses [`Self::setup`] best-effort: every failure is logged and
    /// does not abort the remaining steps (spec §4.3.4).
    pub async fn teardown(&self) -> Result<(), Error> {
        let uplinks = self.list_uplinks();
        let mut pr = self.policy_routing.lock().await;

        for uplink in &uplinks {
            if uplink.gateway.is_some() {
                if let Err(e) = pr.flush_table(uplink.table.0).await {
                    tracing::warn!(group = %self.config.name, uplink = %uplink.name, error = %e, "failed to remove default route");
                }
            }
            if uplink.local_ip.is_some() {
                let comment = firewall::snat_comment(&self.config.name, &uplink.name);
                if let Err(e) = self.firewall.delete_rules_by_comment(NAT_POSTROUTING_CHAIN, &comment) {
                    tracing::warn!(group = %self.config.name, uplink = %uplink.name, error = %e, "failed to remove SNAT rule");
                }
            }
            let priority = 100 + uplink.tier * 10;
            if let Err(e) = pr.delete_rule(&Rule::by_mark(priority, uplink.mark.0, uplink.table.0)).await {
                tracing::warn!(group = %self.config.name, uplink = %uplink.name, error = %e, "failed to remove policy-routing rule");
            }
        }
        drop(pr);

        if let Err(e) = self.firewall.delete_rules_by_comment(MARK_PREROUTING_CHAIN, &firewall::uplink_rule_prefix(&self.config.name)) {
            tracing::warn!(group = %self.config.name, error = %e, "failed to remove marking rules");
        }
        if let Err(e) = self
            .firewall
            .delete_rules_by_comment(MARK_PREROUTING_CHAIN, &firewall::connmark_restore_prefix(&self.config.name))
        {
            tracing::warn!(group = %self.config.name, error = %e, "failed to remove connmark-restore rules");
        }

        let mut state = self.state.write().unwrap();
        *state = GroupState::default();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Adaptive weights (spec §4.3.5)
    // ------------------------------------------------------------------

    /// Recomputes `dynamic_weight` for each enabled, healthy uplink.
    /// Returns true if any weight changed (dampened -- small changes are
    /// ignored, spec §4.3.5).
    pub fn update_weights(&self) -> bool {
        let mut state = self.state.write().unwrap();
        let mut changed = false;
        for uplink in state.uplinks.iter_mut().filter(|u| u.is_eligible()) {
            let latency_ms = (uplink.latency.as_millis() as u64).max(1);
            let kbps = uplink.throughput as f64 / 1024.0;
            let score = (latency_ms as f64 + kbps / 100.0).max(1.0);
            let new_weight = ((10000.0 / score).floor() as u32).max(1);
            let old = uplink.dynamic_weight;
            let threshold = (old / 10).max(5);
            if old == 0 || new_weight.abs_diff(old) > threshold {
                uplink.dynamic_weight = new_weight;
                changed = true;
            }
        }
        changed
    }
}

/// Parses a source-network CIDR the way spec §3 expects
/// (`source_networks: CIDRs`), accepting a bare host address as `/32`.
pub fn parse_source_network(s: &str) -> Result<Ipv4Cidr, cidr::errors::NetworkParseError> {
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    cidr::parsers::parse_cidr_ignore_hostbits(s, Ipv4Addr::from_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockFirewallBackend, MockNetlinkBackend};
    use crate::uplink::UplinkType;
    use std::sync::Arc as StdArc;

    fn make_group(cfg: GroupConfig) -> (UplinkGroup, MockFirewallBackend) {
        let allocator = StdArc::new(MarkAllocator::new());
        let firewall = StdArc::new(MockFirewallBackend::new());
        let netlink = StdArc::new(MockNetlinkBackend::new());
        let pr = StdArc::new(tokio::sync::Mutex::new(PolicyRoutingManager::new(netlink)));
        let group = UplinkGroup::new(cfg, allocator, firewall.clone(), pr);
        (group, firewall)
    }

    fn wan(name: &str, tier: u32, weight: u8) -> Uplink {
        Uplink::new(name, UplinkType::Wan, format!("{name}0"), tier, weight)
    }

    #[test]
    fn add_uplink_is_idempotent_on_mark_and_table() {
        let (group, _fw) = make_group(GroupConfig::new("wan-group"));
        let first = group.add_uplink(wan("wan1", 0, 50));
        let second = group.add_uplink(wan("wan1", 1, 90));
        assert_eq!(first.mark, second.mark);
        assert_eq!(first.table, second.table);
        assert_eq!(second.tier, 1, "non-identity fields still update");
    }

    #[test]
    fn scenario_1_allocation_sequence() {
        let (group, _fw) = make_group(GroupConfig::new("g"));
        let u0 = group.add_uplink(wan("wan1", 0, 50));
        let u1 = group.add_uplink(wan("wan2", 1, 50));
        let u2 = group.add_uplink(Uplink::new("wg1", UplinkType::WireGuard, "wg0", 2, 50));

        assert_eq!(u0.mark.0, 0x0100);
        assert_eq!(u1.mark.0, 0x0101);
        assert_eq!(u2.mark.0, 0x0200);
        assert_eq!(u0.table.0, 10);
        assert_eq!(u1.table.0, 11);
        assert_eq!(u2.table.0, 30);
    }

    #[test]
    fn scenario_2_failover_on_health_loss() {
        let (group, _fw) = make_group(GroupConfig::new("g"));
        group.add_uplink(wan("wan1", 0, 50));
        group.add_uplink(wan("wan2", 0, 50));
        group.add_uplink(wan("backup", 1, 50));

        assert_eq!(group.get_best_uplink().unwrap().name, "wan1");
        group.set_uplink_health("wan1", false).unwrap();
        assert_eq!(group.get_best_uplink().unwrap().name, "wan2");
        group.set_uplink_health("wan2", false).unwrap();
        assert_eq!(group.get_best_uplink().unwrap().name, "backup");
        group.set_uplink_health("wan1", true).unwrap();
        assert_eq!(group.get_best_uplink().unwrap().name, "wan1");
    }

    #[test]
    fn scenario_3_weighted_selection_picks_highest_weight() {
        let mut cfg = GroupConfig::new("g");
        cfg.load_balance_mode = LoadBalanceMode::Weighted;
        let (group, _fw) = make_group(cfg);
        group.add_uplink(wan("a", 0, 60));
        group.add_uplink(wan("b", 0, 40));
        assert_eq!(group.get_best_uplink().unwrap().name, "a");
    }

    #[tokio::test]
    async fn setup_then_teardown_leaves_no_group_rules() {
        let mut cfg = GroupConfig::new("g");
        cfg.source_networks = vec![parse_source_network("10.0.0.0/24").unwrap()];
        cfg.source_interfaces = vec!["lan0".to_string()];
        let (group, fw) = make_group(cfg);
        let mut u = wan("wan1", 0, 50);
        u.gateway = Some("203.0.113.1".parse().unwrap());
        u.local_ip = Some("203.0.113.5".parse().unwrap());
        group.add_uplink(u);

        group.setup().await.unwrap();
        assert!(!fw.rules_with_prefix("uplink_g_").is_empty());
        assert!(!fw.rules_with_prefix("connmark_restore_g_").is_empty());
        assert!(!fw.rules_with_prefix("snat_g_").is_empty());

        group.teardown().await.unwrap();
        assert!(fw.rules_with_prefix("uplink_").is_empty());
        assert!(fw.rules_with_prefix("connmark_restore_").is_empty());
        assert!(fw.rules_with_prefix("snat_").is_empty());
    }

    #[tokio::test]
    async fn weighted_setup_installs_numgen_rule_with_both_marks() {
        let mut cfg = GroupConfig::new("g");
        cfg.load_balance_mode = LoadBalanceMode::Weighted;
        cfg.source_networks = vec![parse_source_network("10.0.0.0/24").unwrap()];
        let (group, fw) = make_group(cfg);
        let a = group.add_uplink(wan("a", 0, 60));
        let b = group.add_uplink(wan("b", 0, 40));

        group.setup().await.unwrap();
        let weights = fw.last_numgen_weights("uplink_g_").expect("numgen rule installed");
        assert_eq!(weights.len(), 2);
        assert!(weights.iter().any(|w| w.mark == a.mark.0 && w.weight == 60));
        assert!(weights.iter().any(|w| w.mark == b.mark.0 && w.weight == 40));
    }

    #[test]
    fn update_weights_dampens_small_changes() {
        let (group, _fw) = make_group(GroupConfig::new("g"));
        let u = group.add_uplink(wan("a", 0, 50));
        group.with_uplink_mut(&u.name, |u| {
            u.dynamic_weight = 100;
            u.latency = Duration::from_millis(100);
            u.throughput = 0;
        });
        // score = 100 -> new_weight = 100, |100-100|=0 not > max(10,5) -> no change
        assert!(!group.update_weights());
        assert_eq!(group.list_uplinks()[0].dynamic_weight, 100);
    }

    #[test]
    fn update_weights_scenario_6() {
        let (group, _fw) = make_group(GroupConfig::new("g"));
        let u = group.add_uplink(wan("a", 0, 50));
        group.with_uplink_mut(&u.name, |u| {
            u.throughput = 204_800;
            u.latency = Duration::ZERO;
        });
        assert!(group.update_weights());
        assert_eq!(group.list_uplinks()[0].dynamic_weight, 3333);
    }
}
