//! Production [`NetlinkBackend`] wrapping an `rtnetlink::Handle`.
//!
//! Grounded on `gnosis_vpn-root/src/routing/netlink_ops.rs`'s
//! `RealNetlinkOps`: `RouteMessageBuilder` to construct wire messages,
//! `try_collect` over `execute()` streams, and attribute
//! pattern-matching back into domain types.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::TryStreamExt;
use glacic_core::netlink::{AddrInfo, Error, LinkInfo, NetlinkBackend, RouteSpec, RuleSpec};
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{LinkAttribute, Stats64};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute};

#[derive(Clone)]
pub struct RealNetlinkBackend {
    handle: rtnetlink::Handle,
}

impl RealNetlinkBackend {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    fn build_route_message(route: &RouteSpec) -> rtnetlink::packet_route::route::RouteMessage {
        let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(route.destination, route.prefix_len)
            .output_interface(route.if_index)
            .table_id(route.table_id);
        if let Some(gw) = route.gateway {
            builder = builder.gateway(gw);
        }
        builder.build()
    }

    fn route_message_to_spec(msg: &rtnetlink::packet_route::route::RouteMessage) -> Option<RouteSpec> {
        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        })?;
        let destination = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(*ip),
                _ => None,
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(*ip),
            _ => None,
        });
        let table_id = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or(0);

        Some(RouteSpec {
            destination,
            prefix_len: msg.header.destination_prefix_length,
            gateway,
            if_index,
            table_id,
            metric: msg.attributes.iter().find_map(|a| match a {
                RouteAttribute::Priority(p) => Some(*p),
                _ => None,
            }),
        })
    }
}

#[async_trait]
impl NetlinkBackend for RealNetlinkBackend {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle.route().add(msg).execute().await.map_err(|e| Error::Netlink(e.to_string()))
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle
            .route()
            .add(msg)
            .replace()
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle.route().del(msg).execute().await.map_err(|e| Error::Netlink(e.to_string()))
    }

    async fn route_list(&self, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default();
        if let Some(id) = table_id {
            builder = builder.table_id(id);
        }
        let routes: Vec<_> = self
            .handle
            .route()
            .get(builder.build())
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?;
        Ok(routes.iter().filter_map(Self::route_message_to_spec).collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut req = self.handle.rule().add().v4().fw_mark(rule.fw_mark).priority(rule.priority).table_id(rule.table_id);
        if let Some(mask) = rule.fw_mask {
            req = req.fw_mask(mask);
        }
        req.action(RuleAction::ToTable).execute().await.map_err(|e| Error::Netlink(e.to_string()))
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let rules: Vec<_> = self
            .handle
            .rule()
            .get(rtnetlink::IpVersion::V4)
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?;

        for msg in rules {
            let has_mark = msg.attributes.iter().any(|a| matches!(a, RuleAttribute::FwMark(m) if *m == rule.fw_mark));
            let has_table = msg.attributes.iter().any(|a| matches!(a, RuleAttribute::Table(t) if *t == rule.table_id));
            if has_mark && has_table {
                self.handle.rule().del(msg).execute().await.map_err(|e| Error::Netlink(e.to_string()))?;
                return Ok(());
            }
        }
        Err(Error::RuleNotFound(rule.fw_mark, rule.table_id))
    }

    async fn rule_list(&self) -> Result<Vec<RuleSpec>, Error> {
        let rules: Vec<_> = self
            .handle
            .rule()
            .get(rtnetlink::IpVersion::V4)
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?;

        Ok(rules
            .iter()
            .filter_map(|msg| {
                let fw_mark = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::FwMark(m) => Some(*m),
                    _ => None,
                })?;
                let table_id = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::Table(t) => Some(*t),
                    _ => None,
                })?;
                let priority = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        RuleAttribute::Priority(p) => Some(*p),
                        _ => None,
                    })
                    .unwrap_or(0);
                let fw_mask = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::FwMask(m) => Some(*m),
                    _ => None,
                });
                Some(RuleSpec { priority, fw_mark, fw_mask, table_id })
            })
            .collect())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links: Vec<_> =
            self.handle.link().get().execute().try_collect().await.map_err(|e| Error::Netlink(e.to_string()))?;

        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                let (rx_bytes, tx_bytes) = link
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        LinkAttribute::Stats64(Stats64 { rx_bytes, tx_bytes, .. }) => Some((*rx_bytes, *tx_bytes)),
                        _ => None,
                    })
                    .unwrap_or((0, 0));
                Some(LinkInfo { index: link.header.index, name, rx_bytes, tx_bytes })
            })
            .collect())
    }

    async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, Error> {
        let addrs: Vec<_> =
            self.handle.address().get().execute().try_collect().await.map_err(|e| Error::Netlink(e.to_string()))?;

        Ok(addrs
            .iter()
            .filter_map(|addr| {
                let ip = addr.attributes.iter().find_map(|a| match a {
                    AddressAttribute::Address(std::net::IpAddr::V4(ip)) => Some(*ip),
                    _ => None,
                })?;
                Some(AddrInfo { if_index: addr.header.index, addr: ip })
            })
            .collect())
    }
}

/// Records every call instead of touching the kernel (spec §9's "dry-run
/// logger" variant), for `glacic-netd --dry-run`. List operations return
/// empty results since there is no real kernel state to reflect.
#[derive(Debug, Default)]
pub struct DryRunNetlinkBackend {
    log: Mutex<Vec<String>>,
}

impl DryRunNetlinkBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        tracing::info!(%line, "dry-run netlink op");
        self.log.lock().unwrap().push(line);
    }
}

#[async_trait]
impl NetlinkBackend for DryRunNetlinkBackend {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        self.record(format!("route_add {route:?}"));
        Ok(())
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error> {
        self.record(format!("route_replace {route:?}"));
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        self.record(format!("route_del {route:?}"));
        Ok(())
    }

    async fn route_list(&self, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        self.record(format!("route_list table_id={table_id:?}"));
        Ok(Vec::new())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        self.record(format!("rule_add {rule:?}"));
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        self.record(format!("rule_del {rule:?}"));
        Ok(())
    }

    async fn rule_list(&self) -> Result<Vec<RuleSpec>, Error> {
        self.record("rule_list".to_string());
        Ok(Vec::new())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        self.record("link_list".to_string());
        Ok(Vec::new())
    }

    async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, Error> {
        self.record("addr_list_v4".to_string());
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_backend_records_every_call_without_executing() {
        let backend = DryRunNetlinkBackend::new();
        backend
            .route_add(&RouteSpec { destination: Ipv4Addr::UNSPECIFIED, prefix_len: 0, gateway: None, if_index: 1, table_id: 100, metric: None })
            .await
            .unwrap();
        backend.link_list().await.unwrap();
        assert_eq!(backend.log().len(), 2);
    }
}
