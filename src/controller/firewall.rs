//! Cloud firewall reconciliation for NodeBalancers and Linodes
//!
//! A target object either names an existing firewall by ID, carries an ACL
//! from which a firewall is synthesized, or carries neither, in which case
//! attached firewalls are detached and garbage-collected.

use std::collections::BTreeSet;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::annotations;
use crate::error::{ignore_not_found, Error, Result};
use crate::linode::{
    Firewall, FirewallCreateOptions, FirewallDeviceCreateOptions, FirewallDeviceType,
    FirewallDevicesCreateOptions, FirewallPolicy, FirewallRule, FirewallRuleSet, LinodeApi,
    NetworkAddresses, NetworkProtocol,
};

pub const MAX_IPS_PER_RULE: usize = 255;
pub const MAX_RULES: usize = 25;
const MAX_LABEL: usize = 32;
pub const OWNER_TAG: &str = "linode-ccm";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AclAddresses {
    #[serde(default)]
    pub ipv4: Option<Vec<String>>,
    #[serde(default)]
    pub ipv6: Option<Vec<String>>,
}

/// Port-set of a Node-level ACL
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AclPorts {
    #[serde(default)]
    pub protocol: Option<String>,
    /// Linode port syntax, e.g. `22` or `30000-32767`
    pub ports: String,
}

/// Body of the `firewall-acl` annotation
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallAcl {
    #[serde(default)]
    pub allow_list: Option<AclAddresses>,
    #[serde(default)]
    pub deny_list: Option<AclAddresses>,
    #[serde(default)]
    pub ports: Option<Vec<AclPorts>>,
}

/// One protocol plus port range that every synthesized rule is repeated for
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortGroup {
    pub protocol: NetworkProtocol,
    pub ports: Option<String>,
}

/// Normalized ACL: which list it is and the addresses as CIDRs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedAcl {
    pub allow: bool,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

impl ParsedAcl {
    /// Inbound policy the synthesized firewall must carry
    pub fn inbound_policy(&self) -> FirewallPolicy {
        if self.allow {
            FirewallPolicy::Drop
        } else {
            FirewallPolicy::Accept
        }
    }

    fn rule_action(&self) -> FirewallPolicy {
        if self.allow {
            FirewallPolicy::Accept
        } else {
            FirewallPolicy::Drop
        }
    }
}

fn normalize_ip(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let net: IpNet = if raw.contains('/') {
        raw.parse()
            .map_err(|_| Error::InvalidFirewallConfig(format!("invalid address {raw:?}")))?
    } else {
        let ip: std::net::IpAddr = raw
            .parse()
            .map_err(|_| Error::InvalidFirewallConfig(format!("invalid address {raw:?}")))?;
        IpNet::from(ip)
    };
    Ok(net.to_string())
}

fn normalize_all(list: &Option<Vec<String>>) -> Result<Vec<String>> {
    list.iter()
        .flatten()
        .map(|ip| normalize_ip(ip))
        .collect()
}

pub fn parse_acl(raw: &str) -> Result<(ParsedAcl, Option<Vec<AclPorts>>)> {
    let acl: FirewallAcl = serde_json::from_str(raw)
        .map_err(|e| Error::InvalidFirewallConfig(format!("invalid ACL: {e}")))?;
    let (allow, list) = match (&acl.allow_list, &acl.deny_list) {
        (Some(list), None) => (true, list),
        (None, Some(list)) => (false, list),
        (Some(_), Some(_)) => {
            return Err(Error::InvalidFirewallConfig(
                "allowList and denyList are mutually exclusive".to_string(),
            ))
        }
        (None, None) => {
            return Err(Error::InvalidFirewallConfig(
                "one of allowList or denyList is required".to_string(),
            ))
        }
    };
    Ok((
        ParsedAcl {
            allow,
            ipv4: normalize_all(&list.ipv4)?,
            ipv6: normalize_all(&list.ipv6)?,
        },
        acl.ports,
    ))
}

/// Port groups for a Node ACL. Without ports every TCP port is covered.
pub fn node_port_groups(ports: Option<&[AclPorts]>) -> Result<Vec<PortGroup>> {
    let Some(ports) = ports.filter(|p| !p.is_empty()) else {
        return Ok(vec![PortGroup {
            protocol: NetworkProtocol::Tcp,
            ports: None,
        }]);
    };
    let mut groups = BTreeSet::new();
    for entry in ports {
        let protocol = match entry.protocol.as_deref().map(str::to_ascii_uppercase).as_deref() {
            None | Some("TCP") => NetworkProtocol::Tcp,
            Some("UDP") => NetworkProtocol::Udp,
            Some(other) => {
                return Err(Error::InvalidFirewallConfig(format!(
                    "unsupported protocol {other}"
                )))
            }
        };
        groups.insert(PortGroup {
            protocol,
            ports: Some(entry.ports.clone()),
        });
    }
    Ok(groups.into_iter().collect())
}

/// A NodeBalancer is covered by one TCP rule over all Service ports
pub fn service_port_group(ports: &[i32]) -> PortGroup {
    let sorted: BTreeSet<i32> = ports.iter().copied().collect();
    PortGroup {
        protocol: NetworkProtocol::Tcp,
        ports: Some(
            sorted
                .iter()
                .map(i32::to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
    }
}

fn truncate(label: &str, max: usize) -> String {
    label.chars().take(max).collect()
}

/// Build the rule set for `acl`, splitting address lists into rules of at most 255 IPs
pub fn synthesize_rules(
    acl: &ParsedAcl,
    groups: &[PortGroup],
    label: &str,
    owner: &str,
) -> Result<FirewallRuleSet> {
    let mut inbound = Vec::new();
    let action = acl.rule_action();
    let rule_label = truncate(label, MAX_LABEL);

    for group in groups {
        let v4 = acl.ipv4.chunks(MAX_IPS_PER_RULE).map(|c| NetworkAddresses {
            ipv4: Some(c.to_vec()),
            ipv6: None,
        });
        let v6 = acl.ipv6.chunks(MAX_IPS_PER_RULE).map(|c| NetworkAddresses {
            ipv4: None,
            ipv6: Some(c.to_vec()),
        });
        for addresses in v4.chain(v6) {
            let n = inbound.len() + 1;
            inbound.push(FirewallRule {
                action,
                label: rule_label.clone(),
                description: format!("Rule {n}, Created by linode-ccm: {label}, for {owner}"),
                protocol: group.protocol,
                ports: group.ports.clone(),
                addresses,
            });
        }
    }

    if inbound.len() > MAX_RULES {
        return Err(Error::TooManyIps(inbound.len(), MAX_RULES));
    }
    Ok(FirewallRuleSet {
        inbound,
        inbound_policy: acl.inbound_policy(),
        outbound: Vec::new(),
        outbound_policy: FirewallPolicy::Accept,
    })
}

fn existing_ips(rules: &FirewallRuleSet) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut v4 = BTreeSet::new();
    let mut v6 = BTreeSet::new();
    for rule in &rules.inbound {
        v4.extend(rule.addresses.ipv4.iter().flatten().cloned());
        v6.extend(rule.addresses.ipv6.iter().flatten().cloned());
    }
    (v4, v6)
}

/// True when the firewall's rules no longer reflect `acl` over `groups`
pub fn rule_changed(old: &FirewallRuleSet, acl: &ParsedAcl, groups: &[PortGroup]) -> bool {
    if old.inbound_policy != acl.inbound_policy() {
        return true;
    }
    let (old_v4, old_v6) = existing_ips(old);
    let new_v4: BTreeSet<String> = acl.ipv4.iter().cloned().collect();
    let new_v6: BTreeSet<String> = acl.ipv6.iter().cloned().collect();
    if old_v4 != new_v4 || old_v6 != new_v6 {
        return true;
    }
    let old_groups: BTreeSet<PortGroup> = old
        .inbound
        .iter()
        .map(|r| PortGroup {
            protocol: r.protocol,
            ports: r.ports.clone(),
        })
        .collect();
    let new_groups: BTreeSet<PortGroup> = groups.iter().cloned().collect();
    // an empty ACL leaves no rules to carry ports
    if !old.inbound.is_empty() && old_groups != new_groups {
        return true;
    }
    false
}

/// Object whose firewall is being reconciled
#[derive(Clone, Debug)]
pub struct FirewallTarget {
    pub type_: FirewallDeviceType,
    pub id: i64,
    /// Label given to a synthesized firewall and its rules
    pub label: String,
    /// Human-readable owner used in rule descriptions
    pub owner: String,
    pub firewall_id: Option<String>,
    pub acl: Option<String>,
    pub port_groups: Vec<PortGroup>,
}

impl FirewallTarget {
    /// Target for a NodeBalancer serving `service_ports`
    pub fn nodebalancer(
        nb_id: i64,
        nb_label: &str,
        service: &str,
        meta: &kube::api::ObjectMeta,
        service_ports: &[i32],
    ) -> Self {
        Self {
            type_: FirewallDeviceType::NodeBalancer,
            id: nb_id,
            label: nb_label.to_string(),
            owner: service.to_string(),
            firewall_id: annotations::get(meta, annotations::FIREWALL_ID).map(str::to_string),
            acl: annotations::get(meta, annotations::FIREWALL_ACL).map(str::to_string),
            port_groups: vec![service_port_group(service_ports)],
        }
    }

    /// Target for the Linode backing a Node. Port groups are derived from the ACL.
    pub fn linode(linode_id: i64, node_name: &str, meta: &kube::api::ObjectMeta) -> Self {
        Self {
            type_: FirewallDeviceType::Linode,
            id: linode_id,
            label: node_name.to_string(),
            owner: node_name.to_string(),
            firewall_id: annotations::get(meta, annotations::NODE_FIREWALL_ID)
                .map(str::to_string),
            acl: annotations::get(meta, annotations::NODE_FIREWALL_ACL).map(str::to_string),
            port_groups: Vec::new(),
        }
    }

    fn describe(&self) -> String {
        let kind = match self.type_ {
            FirewallDeviceType::NodeBalancer => "NodeBalancer",
            FirewallDeviceType::Linode => "Linode",
        };
        format!("{kind} {}", self.id)
    }
}

pub struct FirewallReconciler {
    linode: Arc<dyn LinodeApi>,
    cluster_name: String,
}

impl FirewallReconciler {
    pub fn new(linode: Arc<dyn LinodeApi>, cluster_name: &str) -> Self {
        Self {
            linode,
            cluster_name: cluster_name.to_string(),
        }
    }

    fn tags(&self) -> Vec<String> {
        vec![self.cluster_name.clone(), OWNER_TAG.to_string()]
    }

    async fn attached(&self, target: &FirewallTarget) -> Result<Vec<Firewall>> {
        Ok(match target.type_ {
            FirewallDeviceType::NodeBalancer => {
                self.linode.list_nodebalancer_firewalls(target.id).await?
            }
            FirewallDeviceType::Linode => self.linode.list_instance_firewalls(target.id).await?,
        })
    }

    #[instrument(skip(self, target), fields(target = %target.describe()))]
    pub async fn reconcile(&self, target: &FirewallTarget) -> Result<()> {
        let attached = self.attached(target).await?;

        if let Some(raw) = target.firewall_id.as_deref() {
            let wanted: i64 = raw.trim().parse().map_err(|_| Error::InvalidAnnotation {
                annotation: annotations::FIREWALL_ID.to_string(),
                reason: format!("{raw:?} is not a firewall ID"),
            })?;
            return self.adopt(target, wanted, attached).await;
        }

        if let Some(raw) = target.acl.as_deref() {
            let (acl, ports) = parse_acl(raw)?;
            let groups = match target.type_ {
                FirewallDeviceType::NodeBalancer => target.port_groups.clone(),
                FirewallDeviceType::Linode => node_port_groups(ports.as_deref())?,
            };
            return self.apply_acl(target, &acl, &groups, attached).await;
        }

        for firewall in attached {
            let unmanaged = !firewall.tags.iter().any(|t| t == OWNER_TAG);
            if target.type_ == FirewallDeviceType::Linode && unmanaged {
                debug!(firewall = firewall.id, "leaving unmanaged firewall attached");
                continue;
            }
            self.detach_and_gc(firewall.id, target).await?;
        }
        Ok(())
    }

    async fn adopt(
        &self,
        target: &FirewallTarget,
        wanted: i64,
        attached: Vec<Firewall>,
    ) -> Result<()> {
        if attached.len() > 1 {
            return Err(Error::TooManyFirewalls(target.describe()));
        }
        if attached.first().map(|fw| fw.id) == Some(wanted) {
            debug!(firewall = wanted, "firewall already attached");
            return Ok(());
        }

        info!(firewall = wanted, "attaching firewall");
        self.linode
            .create_firewall_device(
                wanted,
                &FirewallDeviceCreateOptions {
                    id: target.id,
                    type_: target.type_,
                },
            )
            .await?;
        if let Some(previous) = attached.first() {
            self.detach_and_gc(previous.id, target).await?;
        }
        Ok(())
    }

    async fn apply_acl(
        &self,
        target: &FirewallTarget,
        acl: &ParsedAcl,
        groups: &[PortGroup],
        attached: Vec<Firewall>,
    ) -> Result<()> {
        match attached.as_slice() {
            [] => {
                let rules = synthesize_rules(acl, groups, &target.label, &target.owner)?;
                let devices = match target.type_ {
                    FirewallDeviceType::NodeBalancer => FirewallDevicesCreateOptions {
                        nodebalancers: vec![target.id],
                        ..Default::default()
                    },
                    FirewallDeviceType::Linode => FirewallDevicesCreateOptions {
                        linodes: vec![target.id],
                        ..Default::default()
                    },
                };
                let firewall = self
                    .linode
                    .create_firewall(&FirewallCreateOptions {
                        label: truncate(&target.label, MAX_LABEL),
                        rules,
                        tags: self.tags(),
                        devices,
                    })
                    .await?;
                info!(firewall = firewall.id, "created firewall from ACL");
                Ok(())
            }
            [existing] => {
                if !rule_changed(&existing.rules, acl, groups) {
                    debug!(firewall = existing.id, "firewall rules up to date");
                    return Ok(());
                }
                let rules = synthesize_rules(acl, groups, &target.label, &target.owner)?;
                self.linode.update_firewall_rules(existing.id, &rules).await?;
                info!(firewall = existing.id, "updated firewall rules");
                Ok(())
            }
            _ => Err(Error::TooManyFirewalls(target.describe())),
        }
    }

    /// Detach `firewall_id` from the target, then delete it if nothing else uses it
    pub async fn detach_and_gc(&self, firewall_id: i64, target: &FirewallTarget) -> Result<()> {
        let devices = match self.linode.list_firewall_devices(firewall_id).await {
            Ok(devices) => devices,
            Err(e) => return ignore_not_found(Err(e.into())),
        };
        for device in devices
            .iter()
            .filter(|d| d.entity.type_ == target.type_ && d.entity.id == target.id)
        {
            info!(firewall = firewall_id, device = device.id, "detaching firewall");
            ignore_not_found(
                self.linode
                    .delete_firewall_device(firewall_id, device.id)
                    .await
                    .map_err(Error::from),
            )?;
        }
        self.gc(firewall_id).await
    }

    /// Delete the firewall once no devices remain attached
    pub async fn gc(&self, firewall_id: i64) -> Result<()> {
        let remaining = match self.linode.list_firewall_devices(firewall_id).await {
            Ok(devices) => devices,
            Err(e) => return ignore_not_found(Err(e.into())),
        };
        if !remaining.is_empty() {
            debug!(firewall = firewall_id, devices = remaining.len(), "firewall still in use");
            return Ok(());
        }
        info!(firewall = firewall_id, "deleting unused firewall");
        ignore_not_found(self.linode.delete_firewall(firewall_id).await.map_err(Error::from))
    }

    /// Detach and collect firewalls this controller created for the target
    pub async fn release_owned(&self, target: &FirewallTarget) -> Result<()> {
        let attached = match self.attached(target).await {
            Ok(attached) => attached,
            Err(e) => return ignore_not_found(Err(e)),
        };
        for firewall in attached
            .iter()
            .filter(|fw| fw.tags.iter().any(|t| t == OWNER_TAG))
        {
            self.detach_and_gc(firewall.id, target).await?;
        }
        Ok(())
    }
}
