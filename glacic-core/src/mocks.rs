//! Test doubles for every backend trait (spec §6's collaborators).
//!
//! Grounded on `gnosis_vpn-root/src/routing/mocks.rs`: a `State` behind
//! `Arc<Mutex<..>>` so the mock can be cloned and shared between the
//! component under test and the test's assertions, plus a `fail_on` map
//! keyed by operation name for targeted error injection.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::clock::Clock;
use crate::command::{self, CommandExecutor, Logs};
use crate::firewall::{self, CtState, FirewallBackend, WeightedMark};
use crate::netlink::{self, AddrInfo, LinkInfo, NetlinkBackend, RouteSpec, RuleSpec};

// ============================================================================
// MockNetlinkBackend
// ============================================================================

#[derive(Debug, Default)]
struct NetlinkState {
    routes: Vec<RouteSpec>,
    rules: Vec<RuleSpec>,
    links: Vec<LinkInfo>,
    addrs: Vec<AddrInfo>,
    fail_on: HashMap<String, String>,
}

/// In-memory [`NetlinkBackend`] double. Cloning shares the underlying
/// state (`Arc<Mutex<..>>`), so a test can hold one handle to drive
/// assertions while another is handed to the component under test.
#[derive(Debug, Clone, Default)]
pub struct MockNetlinkBackend {
    state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a link so `link_index`/`link_list` can resolve it.
    pub fn with_link(self, name: impl Into<String>, index: u32) -> Self {
        self.state.lock().unwrap().links.push(LinkInfo { index, name: name.into(), rx_bytes: 0, tx_bytes: 0 });
        self
    }

    /// Registers a link with byte counters, for adaptive-throughput tests.
    pub fn with_link_stats(self, name: impl Into<String>, index: u32, rx_bytes: u64, tx_bytes: u64) -> Self {
        self.state.lock().unwrap().links.push(LinkInfo { index, name: name.into(), rx_bytes, tx_bytes });
        self
    }

    /// Updates the byte counters of an already-registered link.
    pub fn set_link_stats(&self, name: &str, rx_bytes: u64, tx_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(link) = state.links.iter_mut().find(|l| l.name == name) {
            link.rx_bytes = rx_bytes;
            link.tx_bytes = tx_bytes;
        }
    }

    /// Makes the named operation fail on its next call with `message`.
    pub fn fail_on(&self, op: &str, message: &str) {
        self.state.lock().unwrap().fail_on.insert(op.to_string(), message.to_string());
    }

    fn check_fail(&self, op: &str) -> Result<(), netlink::Error> {
        let mut state = self.state.lock().unwrap();
        match state.fail_on.remove(op) {
            Some(msg) => Err(netlink::Error::Netlink(msg)),
            None => Ok(()),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.state.lock().unwrap().rules.len()
    }

    pub fn route_count(&self) -> usize {
        self.state.lock().unwrap().routes.len()
    }
}

#[async_trait]
impl NetlinkBackend for MockNetlinkBackend {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), netlink::Error> {
        self.check_fail("route_add")?;
        let mut state = self.state.lock().unwrap();
        if state.routes.contains(route) {
            return Err(netlink::Error::Netlink("File exists".to_string()));
        }
        state.routes.push(route.clone());
        Ok(())
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), netlink::Error> {
        self.check_fail("route_replace")?;
        let mut state = self.state.lock().unwrap();
        state.routes.retain(|r| !(r.destination == route.destination && r.table_id == route.table_id));
        state.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), netlink::Error> {
        self.check_fail("route_del")?;
        let mut state = self.state.lock().unwrap();
        let before = state.routes.len();
        state.routes.retain(|r| r != route);
        if state.routes.len() == before {
            return Err(netlink::Error::RouteNotFound(route.destination, route.prefix_len));
        }
        Ok(())
    }

    async fn route_list(&self, table_id: Option<u32>) -> Result<Vec<RouteSpec>, netlink::Error> {
        self.check_fail("route_list")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .routes
            .iter()
            .filter(|r| table_id.map(|t| t == r.table_id).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), netlink::Error> {
        self.check_fail("rule_add")?;
        self.state.lock().unwrap().rules.push(*rule);
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), netlink::Error> {
        self.check_fail("rule_del")?;
        let mut state = self.state.lock().unwrap();
        let before = state.rules.len();
        state.rules.retain(|r| r != rule);
        if state.rules.len() == before {
            return Err(netlink::Error::RuleNotFound(rule.fw_mark, rule.table_id));
        }
        Ok(())
    }

    async fn rule_list(&self) -> Result<Vec<RuleSpec>, netlink::Error> {
        self.check_fail("rule_list")?;
        Ok(self.state.lock().unwrap().rules.clone())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, netlink::Error> {
        self.check_fail("link_list")?;
        Ok(self.state.lock().unwrap().links.clone())
    }

    async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, netlink::Error> {
        self.check_fail("addr_list_v4")?;
        Ok(self.state.lock().unwrap().addrs.clone())
    }
}

// ============================================================================
// MockFirewallBackend
// ============================================================================

#[derive(Debug, Clone)]
enum RuleRecord {
    Mark { cidr: String, mark: u32 },
    Numgen { cidr: String, weights: Vec<WeightedMark> },
    ConnmarkRestore { iface: String },
    Snat { mark: u32, oif: String, snat_ip: Ipv4Addr },
}

#[derive(Debug, Clone)]
struct FirewallEntry {
    chain: String,
    comment: String,
    record: RuleRecord,
}

#[derive(Debug, Default)]
struct FirewallState {
    entries: Vec<FirewallEntry>,
}

/// In-memory [`FirewallBackend`] double recording every installed rule by
/// comment, so tests can assert on what a group actually programmed.
#[derive(Debug, Clone, Default)]
pub struct MockFirewallBackend {
    state: Arc<Mutex<FirewallState>>,
}

impl MockFirewallBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.comment.starts_with(prefix))
            .map(|e| e.comment.clone())
            .collect()
    }

    /// Returns the weights of the most recently installed numgen rule
    /// whose comment starts with `prefix`, if any.
    pub fn last_numgen_weights(&self, prefix: &str) -> Option<Vec<WeightedMark>> {
        self.state.lock().unwrap().entries.iter().rev().find_map(|e| {
            if !e.comment.starts_with(prefix) {
                return None;
            }
            match &e.record {
                RuleRecord::Numgen { weights, .. } => Some(weights.clone()),
                _ => None,
            }
        })
    }
}

impl FirewallBackend for MockFirewallBackend {
    fn add_mark_rule(&self, chain: &str, src_cidr: &str, _ct_state: CtState, mark: u32, comment: &str) -> Result<(), firewall::Error> {
        self.state.lock().unwrap().entries.push(FirewallEntry {
            chain: chain.to_string(),
            comment: comment.to_string(),
            record: RuleRecord::Mark { cidr: src_cidr.to_string(), mark },
        });
        Ok(())
    }

    fn add_numgen_mark_rule(&self, chain: &str, src_cidr: &str, weights: &[WeightedMark], comment: &str) -> Result<(), firewall::Error> {
        self.state.lock().unwrap().entries.push(FirewallEntry {
            chain: chain.to_string(),
            comment: comment.to_string(),
            record: RuleRecord::Numgen { cidr: src_cidr.to_string(), weights: weights.to_vec() },
        });
        Ok(())
    }

    fn add_connmark_restore(&self, chain: &str, iface: &str, comment: &str) -> Result<(), firewall::Error> {
        self.state.lock().unwrap().entries.push(FirewallEntry {
            chain: chain.to_string(),
            comment: comment.to_string(),
            record: RuleRecord::ConnmarkRestore { iface: iface.to_string() },
        });
        Ok(())
    }

    fn add_snat(&self, chain: &str, mark: u32, oif: &str, snat_ip: Ipv4Addr, comment: &str) -> Result<(), firewall::Error> {
        self.state.lock().unwrap().entries.push(FirewallEntry {
            chain: chain.to_string(),
            comment: comment.to_string(),
            record: RuleRecord::Snat { mark, oif: oif.to_string(), snat_ip },
        });
        Ok(())
    }

    fn delete_rules_by_comment(&self, chain: &str, prefix: &str) -> Result<(), firewall::Error> {
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|e| !(e.chain == chain && e.comment.starts_with(prefix)));
        Ok(())
    }

    fn flush(&self, chain: &str) -> Result<(), firewall::Error> {
        self.state.lock().unwrap().entries.retain(|e| e.chain != chain);
        Ok(())
    }
}

// ============================================================================
// MockClock
// ============================================================================

/// Deterministic [`Clock`]: starts at construction time and only moves
/// forward when [`Self::advance`] is called, so `failover_delay`-style
/// gating can be exercised without sleeping.
#[derive(Debug, Clone)]
pub struct MockClock {
    base: Instant,
    offset_ms: Arc<AtomicU32>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self { base: Instant::now(), offset_ms: Arc::new(AtomicU32::new(0)) }
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.as_millis() as u32, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst) as u64)
    }
}

// ============================================================================
// MockCommandExecutor
// ============================================================================

#[derive(Debug, Default)]
struct CommandState {
    calls: Vec<(String, Vec<String>)>,
    stdout: HashMap<String, String>,
    fail_on: HashMap<String, String>,
}

/// Records every invocation and returns canned stdout, so health probes
/// (`ping`, etc.) can be exercised deterministically.
#[derive(Debug, Clone, Default)]
pub struct MockCommandExecutor {
    state: Arc<Mutex<CommandState>>,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stdout(&self, program: &str, stdout: &str) {
        self.state.lock().unwrap().stdout.insert(program.to_string(), stdout.to_string());
    }

    pub fn fail_on(&self, program: &str, message: &str) {
        self.state.lock().unwrap().fail_on.insert(program.to_string(), message.to_string());
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl CommandExecutor for MockCommandExecutor {
    async fn run(&self, program: &str, args: &[&str], _logs: Logs) -> Result<(), command::Error> {
        self.run_stdout(program, args, _logs).await?;
        Ok(())
    }

    async fn run_stdout(&self, program: &str, args: &[&str], _logs: Logs) -> Result<String, command::Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((program.to_string(), args.iter().map(|s| s.to_string()).collect()));
        if let Some(msg) = state.fail_on.remove(program) {
            tracing::error!(program, %msg, "mock command failed");
            return Err(command::Error::CommandFailed);
        }
        Ok(state.stdout.get(program).cloned().unwrap_or_default())
    }
}
