//! Policy-routing manager (spec §4.2): owns the set of active kernel
//! policy-routing rules and custom routing tables.
//!
//! Grounded on `gnosis_vpn-root/src/routing/netlink_ops.rs`'s
//! `RouteSpec`/`RuleSpec` domain types and the one-method-per-kernel-op
//! trait shape; this module is the logic that drives that trait, kept
//! separate from it the way `linux.rs`'s `Router` is kept separate from
//! `netlink_ops.rs`'s `NetlinkOps`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::address::RoutingTable;
use crate::netlink::{self, NetlinkBackend, RouteSpec, RuleSpec};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Netlink(#[from] netlink::Error),
    #[error("table {0} is protected and cannot be overwritten")]
    ProtectedTable(u32),
}

/// Destination of a route: either a specific CIDR or the default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Default,
    Cidr(Ipv4Addr, u8),
}

/// One route to be installed into a table (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Destination,
    pub gateway: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub metric: Option<u32>,
    pub mtu: Option<u32>,
    pub preferred_source: Option<Ipv4Addr>,
}

impl Route {
    pub fn default_via(gateway: Ipv4Addr, interface: impl Into<String>) -> Self {
        Self {
            destination: Destination::Default,
            gateway: Some(gateway),
            interface: Some(interface.into()),
            metric: None,
            mtu: None,
            preferred_source: None,
        }
    }
}

/// Declared routes for one table (spec §4.2's `tables` collection entry).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableConfig {
    pub routes: Vec<Route>,
}

/// Action a policy-routing rule takes once matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Lookup(u32),
    Goto(u32),
    Blackhole,
    Unreachable,
    Prohibit,
}

/// Match criteria + action for one active policy-routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub priority: u32,
    pub source: Option<(Ipv4Addr, u8)>,
    pub destination: Option<(Ipv4Addr, u8)>,
    pub input_interface: Option<String>,
    pub output_interface: Option<String>,
    pub fw_mark: Option<u32>,
    pub fw_mask: Option<u32>,
    pub action: RuleAction,
}

impl Rule {
    pub fn by_mark(priority: u32, fw_mark: u32, table: u32) -> Self {
        Self {
            priority,
            source: None,
            destination: None,
            input_interface: None,
            output_interface: None,
            fw_mark: Some(fw_mark),
            fw_mask: None,
            action: RuleAction::Lookup(table),
        }
    }

    fn table_id(&self) -> Option<u32> {
        match self.action {
            RuleAction::Lookup(t) | RuleAction::Goto(t) => Some(t),
            RuleAction::Blackhole | RuleAction::Unreachable | RuleAction::Prohibit => None,
        }
    }
}

/// Monotonic counters for user-defined mark/table allocation, starting at
/// the user-base constants of spec §3 and never recycled (spec §4.2).
struct Counters {
    next_mark: AtomicU32,
    next_table: AtomicU32,
}

/// Owns the active policy-routing rules and custom routing tables, and
/// drives them through a [`NetlinkBackend`].
pub struct PolicyRoutingManager {
    netlink: Arc<dyn NetlinkBackend>,
    tables: HashMap<u32, TableConfig>,
    rules: Vec<Rule>,
    counters: Counters,
}

const USER_MARK_BASE: u32 = 0x1000;
const USER_TABLE_BASE: u32 = 200;

impl PolicyRoutingManager {
    pub fn new(netlink: Arc<dyn NetlinkBackend>) -> Self {
        Self {
            netlink,
            tables: HashMap::new(),
            rules: Vec::new(),
            counters: Counters {
                next_mark: AtomicU32::new(USER_MARK_BASE),
                next_table: AtomicU32::new(USER_TABLE_BASE),
            },
        }
    }

    /// Monotonic, never-recycled user-mark allocation (spec §4.2).
    pub fn allocate_mark(&self) -> u32 {
        self.counters.next_mark.fetch_add(1, Ordering::SeqCst)
    }

    /// Monotonic, never-recycled user-table allocation (spec §4.2).
    pub fn allocate_table(&self) -> u32 {
        self.counters.next_table.fetch_add(1, Ordering::SeqCst)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn table(&self, id: u32) -> Option<&TableConfig> {
        self.tables.get(&id)
    }

    /// Installs all routes for a table. Each route is added at most once;
    /// duplicates are logged, not fatal (spec §4.2).
    pub async fn create_table(&mut self, id: u32, cfg: TableConfig) -> Result<(), Error> {
        if RoutingTable(id).is_protected() {
            return Err(Error::ProtectedTable(id));
        }
        for route in &cfg.routes {
            if let Err(e) = self.install_route(id, route).await {
                tracing::warn!(table = id, error = %e, "route install failed, continuing");
            }
        }
        self.tables.insert(id, cfg);
        Ok(())
    }

    async fn install_route(&self, table_id: u32, route: &Route) -> Result<(), Error> {
        let if_index = match &route.interface {
            Some(name) => self.netlink.link_index(name).await?,
            None => 0,
        };
        let (destination, prefix_len) = match route.destination {
            Destination::Default => (Ipv4Addr::UNSPECIFIED, 0),
            Destination::Cidr(ip, len) => (ip, len),
        };
        let spec = RouteSpec {
            destination,
            prefix_len,
            gateway: route.gateway,
            if_index,
            table_id,
            metric: route.metric,
        };
        match self.netlink.route_add(&spec).await {
            Ok(()) => Ok(()),
            Err(e) if is_duplicate(&e) => {
                tracing::debug!(table = table_id, "route already present, treating as success");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Records `rule` and installs it via the netlink backend. Default
    /// `from` is "all" (`source = None`) when unspecified (spec §4.2).
    pub async fn add_rule(&mut self, rule: Rule) -> Result<(), Error> {
        let table_id = rule.table_id().unwrap_or(0);
        let spec = RuleSpec {
            priority: rule.priority,
            fw_mark: rule.fw_mark.unwrap_or(0),
            fw_mask: rule.fw_mask,
            table_id,
        };
        self.netlink.rule_add(&spec).await?;
        self.rules.push(rule);
        Ok(())
    }

    /// Removes a rule identified by (priority, source, fwmark, table).
    pub async fn delete_rule(&mut self, rule: &Rule) -> Result<(), Error> {
        let table_id = rule.table_id().unwrap_or(0);
        let spec = RuleSpec {
            priority: rule.priority,
            fw_mark: rule.fw_mark.unwrap_or(0),
            fw_mask: rule.fw_mask,
            table_id,
        };
        self.netlink.rule_del(&spec).await?;
        self.rules.retain(|r| {
            !(r.priority == rule.priority
                && r.source == rule.source
                && r.fw_mark == rule.fw_mark
                && r.table_id() == rule.table_id())
        });
        Ok(())
    }

    /// Removes every route in `id`.
    pub async fn flush_table(&mut self, id: u32) -> Result<(), Error> {
        let routes = self.netlink.route_list(Some(id)).await?;
        for r in routes {
            if let Err(e) = self.netlink.route_del(&r).await {
                tracing::warn!(table = id, error = %e, "failed to flush route, continuing");
            }
        }
        self.tables.remove(&id);
        Ok(())
    }

    /// Lists live rules and deletes those matching `mark`, by priority.
    pub async fn flush_rules_by_mark(&mut self, mark: u32) -> Result<(), Error> {
        let live = self.netlink.rule_list().await?;
        for r in live.into_iter().filter(|r| r.fw_mark == mark) {
            if let Err(e) = self.netlink.rule_del(&r).await {
                tracing::warn!(mark, error = %e, "failed to delete stale rule, continuing");
            }
        }
        self.rules.retain(|r| r.fw_mark != Some(mark));
        Ok(())
    }

    /// Atomic-in-intent replacement: deletes every previously recorded
    /// rule, resets the table map, then applies the new tables and rules
    /// in order. On failure mid-apply, returns the first error; the
    /// caller is responsible for a subsequent full reload to recover
    /// (spec §4.2's documented recovery contract -- partial state here is
    /// tolerated because the health supervisor and next reload overwrite
    /// it).
    pub async fn reload(&mut self, tables: HashMap<u32, TableConfig>, rules: Vec<Rule>) -> Result<(), Error> {
        let old_rules = std::mem::take(&mut self.rules);
        for rule in &old_rules {
            if let Err(e) = self.delete_rule(rule).await {
                tracing::warn!(priority = rule.priority, error = %e, "failed to delete stale rule during reload");
            }
        }
        self.rules.clear();
        self.tables.clear();

        for (id, cfg) in tables {
            self.create_table(id, cfg).await?;
        }
        for rule in rules {
            self.add_rule(rule).await?;
        }
        Ok(())
    }
}

/// "File exists"-shaped errors are idempotent collisions (spec §7):
/// logged, treated as success rather than bubbled up.
fn is_duplicate(e: &netlink::Error) -> bool {
    crate::error::is_idempotent_collision(&e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockNetlinkBackend;

    fn manager() -> (PolicyRoutingManager, MockNetlinkBackend) {
        let mock = MockNetlinkBackend::new();
        let mgr = PolicyRoutingManager::new(Arc::new(mock.clone()));
        (mgr, mock)
    }

    #[tokio::test]
    async fn allocate_mark_and_table_are_monotonic_and_start_at_user_base() {
        let (mgr, _mock) = manager();
        assert_eq!(mgr.allocate_mark(), USER_MARK_BASE);
        assert_eq!(mgr.allocate_mark(), USER_MARK_BASE + 1);
        assert_eq!(mgr.allocate_table(), USER_TABLE_BASE);
        assert_eq!(mgr.allocate_table(), USER_TABLE_BASE + 1);
    }

    #[tokio::test]
    async fn create_table_rejects_protected_ids() {
        let (mut mgr, _mock) = manager();
        let err = mgr.create_table(255, TableConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::ProtectedTable(255)));
    }

    #[tokio::test]
    async fn add_then_delete_rule_round_trips() {
        let (mut mgr, mock) = manager();
        let rule = Rule::by_mark(100, 0x100, 10);
        mgr.add_rule(rule.clone()).await.unwrap();
        assert_eq!(mock.rule_count(), 1);
        mgr.delete_rule(&rule).await.unwrap();
        assert_eq!(mock.rule_count(), 0);
        assert!(mgr.rules().is_empty());
    }

    #[tokio::test]
    async fn reload_tears_down_old_rules_before_applying_new(){
        let (mut mgr, mock) = manager();
        mgr.add_rule(Rule::by_mark(100, 0x10, 100)).await.unwrap();
        assert_eq!(mock.rule_count(), 1);

        let mut tables = HashMap::new();
        tables.insert(30, TableConfig::default());
        let new_rules = vec![Rule::by_mark(130, 0x200, 30)];
        mgr.reload(tables, new_rules).await.unwrap();

        assert_eq!(mock.rule_count(), 1);
        assert_eq!(mgr.rules()[0].priority, 130);
        assert!(mgr.table(30).is_some());
    }

    #[tokio::test]
    async fn flush_rules_by_mark_removes_matching_only() {
        let (mut mgr, mock) = manager();
        mgr.add_rule(Rule::by_mark(100, 0x10, 10)).await.unwrap();
        mgr.add_rule(Rule::by_mark(110, 0x20, 20)).await.unwrap();
        mgr.flush_rules_by_mark(0x10).await.unwrap();
        assert_eq!(mock.rule_count(), 1);
        assert_eq!(mgr.rules()[0].fw_mark, Some(0x20));
    }
}
