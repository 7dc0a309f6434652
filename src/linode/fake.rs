//! In-memory [`LinodeApi`] used by the controller tests
//!
//! Every mutating call is appended to `calls` as a short string so tests can
//! assert exact write sequences (and the absence of writes).

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::*;
use super::{ApiResult, LinodeApi, LinodeError};

#[derive(Default)]
pub struct State {
    next_id: i64,
    next_nb: u32,
    next_ip: u32,
    pub instances: BTreeMap<i64, Instance>,
    pub instance_ips: HashMap<i64, InstanceIpAddressResponse>,
    pub instance_configs: HashMap<i64, Vec<InstanceConfig>>,
    pub interfaces: HashMap<i64, Vec<LinodeInterface>>,
    pub nodebalancers: BTreeMap<i64, NodeBalancer>,
    pub nb_configs: BTreeMap<i64, NodeBalancerConfig>,
    pub nb_nodes: HashMap<i64, Vec<NodeBalancerNode>>,
    pub firewalls: BTreeMap<i64, Firewall>,
    pub firewall_devices: BTreeMap<i64, Vec<FirewallDevice>>,
    pub vpcs: Vec<Vpc>,
    pub vpc_ips: HashMap<i64, Vec<VpcIp>>,
    pub failures: HashMap<String, u16>,
    pub calls: Vec<String>,
    pub reads: usize,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id + 1000
    }

    fn attach(&mut self, firewall_id: i64, type_: FirewallDeviceType, entity_id: i64) -> FirewallDevice {
        let device = FirewallDevice {
            id: self.id(),
            entity: FirewallDeviceEntity {
                id: entity_id,
                type_,
                label: None,
            },
        };
        self.firewall_devices
            .entry(firewall_id)
            .or_default()
            .push(device.clone());
        device
    }

    fn firewalls_for(&self, type_: FirewallDeviceType, entity_id: i64) -> Vec<Firewall> {
        self.firewalls
            .values()
            .filter(|fw| {
                self.firewall_devices
                    .get(&fw.id)
                    .map(|devices| {
                        devices
                            .iter()
                            .any(|d| d.entity.type_ == type_ && d.entity.id == entity_id)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn store_config(&mut self, nb_id: i64, config_id: i64, opts: &NodeBalancerConfigOptions) -> NodeBalancerConfig {
        let config = NodeBalancerConfig {
            id: config_id,
            port: opts.port,
            protocol: opts.protocol,
            proxy_protocol: opts.proxy_protocol,
            algorithm: opts.algorithm,
            stickiness: opts.stickiness,
            check: opts.check,
            check_interval: opts.check_interval,
            check_timeout: opts.check_timeout,
            check_attempts: opts.check_attempts,
            check_path: opts.check_path.clone().unwrap_or_default(),
            check_body: opts.check_body.clone().unwrap_or_default(),
            check_passive: opts.check_passive,
            udp_check_port: opts.udp_check_port,
            ssl_fingerprint: opts
                .ssl_cert
                .as_deref()
                .and_then(crate::controller::loadbalancer::cert_fingerprint)
                .unwrap_or_default(),
            nodebalancer_id: nb_id,
        };
        self.nb_configs.insert(config_id, config.clone());
        let nodes = opts
            .nodes
            .iter()
            .map(|n| NodeBalancerNode {
                id: 0,
                address: n.address.clone(),
                label: n.label.clone(),
                weight: n.weight,
                mode: match n.mode {
                    NodeModeOption::Accept => NodeMode::Accept,
                    NodeModeOption::Drain => NodeMode::Drain,
                },
                status: "UP".to_string(),
                config_id,
                nodebalancer_id: nb_id,
            })
            .collect();
        self.nb_nodes.insert(config_id, nodes);
        config
    }
}

#[derive(Default)]
pub struct FakeLinode {
    pub state: Mutex<State>,
}

impl FakeLinode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear())
    }

    /// Make the next call of `op` fail with `status`
    pub fn fail_next(&self, op: &str, status: u16) {
        self.with(|s| s.failures.insert(op.to_string(), status));
    }

    pub fn add_instance(&self, id: i64, label: &str, public_ip: &str, private_ip: Option<&str>) {
        self.with(|s| {
            let mut ipv4 = vec![public_ip.to_string()];
            ipv4.extend(private_ip.map(str::to_string));
            s.instances.insert(
                id,
                Instance {
                    id,
                    label: label.to_string(),
                    region: "us-ord".to_string(),
                    status: "running".to_string(),
                    ipv4,
                    host_uuid: format!("host-{id}"),
                    ..Default::default()
                },
            );
            let ip = |address: &str, public: bool| InstanceIp {
                address: address.to_string(),
                prefix: if public { 24 } else { 17 },
                type_: "ipv4".to_string(),
                public,
                linode_id: id,
                region: "us-ord".to_string(),
            };
            s.instance_ips.insert(
                id,
                InstanceIpAddressResponse {
                    ipv4: InstanceIpv4Response {
                        public: vec![ip(public_ip, true)],
                        private: private_ip.map(|p| vec![ip(p, false)]).unwrap_or_default(),
                        ..Default::default()
                    },
                },
            );
        })
    }

    pub fn add_nodebalancer(&self, id: i64, label: &str, ipv4: &str) {
        self.with(|s| {
            s.nodebalancers.insert(
                id,
                NodeBalancer {
                    id,
                    label: Some(label.to_string()),
                    region: "us-ord".to_string(),
                    hostname: Some(format!(
                        "nb-{}.us-ord.nodebalancer.linode.com",
                        ipv4.replace('.', "-")
                    )),
                    ipv4: Some(ipv4.to_string()),
                    ipv6: Some(format!("2600:3c00::{id}")),
                    client_conn_throttle: 20,
                    ..Default::default()
                },
            );
        })
    }

    pub fn add_firewall(&self, id: i64, label: &str) {
        self.with(|s| {
            s.firewalls.insert(
                id,
                Firewall {
                    id,
                    label: label.to_string(),
                    status: "enabled".to_string(),
                    ..Default::default()
                },
            );
        })
    }

    pub fn attach_firewall(&self, firewall_id: i64, type_: FirewallDeviceType, entity_id: i64) {
        self.with(|s| {
            s.attach(firewall_id, type_, entity_id);
        })
    }

    pub fn configs_of(&self, nb_id: i64) -> Vec<NodeBalancerConfig> {
        self.with(|s| {
            s.nb_configs
                .values()
                .filter(|c| c.nodebalancer_id == nb_id)
                .cloned()
                .collect()
        })
    }

    pub fn backends_of(&self, config_id: i64) -> Vec<String> {
        self.with(|s| {
            let mut addrs: Vec<String> = s
                .nb_nodes
                .get(&config_id)
                .map(|nodes| nodes.iter().map(|n| n.address.clone()).collect())
                .unwrap_or_default();
            addrs.sort();
            addrs
        })
    }

    fn op(&self, name: &str) -> ApiResult<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.failures.remove(name) {
            return Err(LinodeError::api(status, format!("injected failure in {name}")));
        }
        Ok(state)
    }

    fn read(&self, name: &str) -> ApiResult<std::sync::MutexGuard<'_, State>> {
        let mut state = self.op(name)?;
        state.reads += 1;
        Ok(state)
    }
}

#[async_trait]
impl LinodeApi for FakeLinode {
    async fn get_instance(&self, id: i64) -> ApiResult<Instance> {
        let s = self.read("GetInstance")?;
        s.instances
            .get(&id)
            .cloned()
            .ok_or_else(|| LinodeError::not_found(format!("instance {id}")))
    }

    async fn list_instances(&self, filter: Option<&Filter>) -> ApiResult<Vec<Instance>> {
        let s = self.read("ListInstances")?;
        let label = filter.and_then(|f| f.get("label"));
        Ok(s.instances
            .values()
            .filter(|i| label.map(|l| i.label == l).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create_instance(&self, opts: &InstanceCreateOptions) -> ApiResult<Instance> {
        let mut s = self.op("CreateInstance")?;
        s.calls.push(format!("CreateInstance label={}", opts.label));
        let id = s.id();
        let instance = Instance {
            id,
            label: opts.label.clone(),
            region: opts.region.clone(),
            type_: Some(opts.type_.clone()),
            status: "offline".to_string(),
            tags: opts.tags.clone(),
            ..Default::default()
        };
        s.instances.insert(id, instance.clone());
        s.instance_ips.insert(id, InstanceIpAddressResponse::default());
        Ok(instance)
    }

    async fn get_instance_ip_addresses(&self, id: i64) -> ApiResult<InstanceIpAddressResponse> {
        let s = self.read("GetInstanceIPAddresses")?;
        s.instance_ips
            .get(&id)
            .cloned()
            .ok_or_else(|| LinodeError::not_found(format!("instance {id}")))
    }

    async fn add_instance_ip_address(&self, id: i64, public: bool) -> ApiResult<InstanceIp> {
        let mut s = self.op("AddInstanceIPAddress")?;
        s.calls.push(format!("AddInstanceIPAddress id={id}"));
        s.next_ip += 1;
        let ip = InstanceIp {
            address: format!("198.51.100.{}", s.next_ip),
            prefix: 32,
            type_: "ipv4".to_string(),
            public,
            linode_id: id,
            region: "us-ord".to_string(),
        };
        let entry = s.instance_ips.entry(id).or_default();
        entry.ipv4.public.push(ip.clone());
        Ok(ip)
    }

    async fn delete_instance_ip_address(&self, id: i64, address: &str) -> ApiResult<()> {
        let mut s = self.op("DeleteInstanceIPAddress")?;
        s.calls
            .push(format!("DeleteInstanceIPAddress id={id} ip={address}"));
        let entry = s
            .instance_ips
            .get_mut(&id)
            .ok_or_else(|| LinodeError::not_found(format!("instance {id}")))?;
        let before = entry.ipv4.public.len() + entry.ipv4.shared.len();
        entry.ipv4.public.retain(|ip| ip.address != address);
        entry.ipv4.shared.retain(|ip| ip.address != address);
        if before == entry.ipv4.public.len() + entry.ipv4.shared.len() {
            return Err(LinodeError::not_found(format!("address {address}")));
        }
        Ok(())
    }

    async fn share_ip_addresses(&self, opts: &IpAddressesShareOptions) -> ApiResult<()> {
        let mut s = self.op("ShareIPAddresses")?;
        s.calls.push(format!(
            "ShareIPAddresses linode={} ips={}",
            opts.linode_id,
            opts.ips.join(",")
        ));
        let shared = opts
            .ips
            .iter()
            .map(|address| InstanceIp {
                address: address.clone(),
                prefix: 32,
                type_: "ipv4".to_string(),
                public: true,
                linode_id: opts.linode_id,
                region: "us-ord".to_string(),
            })
            .collect();
        s.instance_ips.entry(opts.linode_id).or_default().ipv4.shared = shared;
        Ok(())
    }

    async fn reserve_ip_address(&self, region: &str) -> ApiResult<InstanceIp> {
        let mut s = self.op("ReserveIPAddress")?;
        s.calls.push(format!("ReserveIPAddress region={region}"));
        s.next_ip += 1;
        Ok(InstanceIp {
            address: format!("203.0.113.{}", s.next_ip),
            prefix: 32,
            type_: "ipv4".to_string(),
            public: true,
            linode_id: 0,
            region: region.to_string(),
        })
    }

    async fn list_instance_configs(&self, id: i64) -> ApiResult<Vec<InstanceConfig>> {
        let s = self.read("ListInstanceConfigs")?;
        Ok(s.instance_configs.get(&id).cloned().unwrap_or_default())
    }

    async fn update_instance_config_interface(
        &self,
        id: i64,
        config_id: i64,
        interface_id: i64,
        opts: &InstanceConfigInterfaceUpdateOptions,
    ) -> ApiResult<InstanceConfigInterface> {
        let mut s = self.op("UpdateInstanceConfigInterface")?;
        s.calls.push(format!(
            "UpdateInstanceConfigInterface id={id} ranges={}",
            opts.ip_ranges.join(",")
        ));
        let iface = s
            .instance_configs
            .get_mut(&id)
            .and_then(|configs| configs.iter_mut().find(|c| c.id == config_id))
            .and_then(|c| c.interfaces.iter_mut().find(|i| i.id == interface_id))
            .ok_or_else(|| LinodeError::not_found(format!("interface {interface_id}")))?;
        iface.ip_ranges = opts.ip_ranges.clone();
        Ok(iface.clone())
    }

    async fn list_interfaces(&self, id: i64) -> ApiResult<Vec<LinodeInterface>> {
        let s = self.read("ListInterfaces")?;
        Ok(s.interfaces.get(&id).cloned().unwrap_or_default())
    }

    async fn update_interface(
        &self,
        id: i64,
        interface_id: i64,
        opts: &LinodeInterfaceUpdateOptions,
    ) -> ApiResult<LinodeInterface> {
        let mut s = self.op("UpdateInterface")?;
        let ranges: Vec<&str> = opts.vpc.ipv4.ranges.iter().map(|r| r.range.as_str()).collect();
        s.calls
            .push(format!("UpdateInterface id={id} ranges={}", ranges.join(",")));
        let iface = s
            .interfaces
            .get_mut(&id)
            .and_then(|list| list.iter_mut().find(|i| i.id == interface_id))
            .ok_or_else(|| LinodeError::not_found(format!("interface {interface_id}")))?;
        if let Some(vpc) = iface.vpc.as_mut() {
            vpc.ipv4.ranges = opts.vpc.ipv4.ranges.clone();
        }
        Ok(iface.clone())
    }

    async fn create_nodebalancer(&self, opts: &NodeBalancerCreateOptions) -> ApiResult<NodeBalancer> {
        let mut s = self.op("CreateNodeBalancer")?;
        if s
            .nodebalancers
            .values()
            .any(|nb| nb.label.as_deref() == Some(opts.label.as_str()))
        {
            return Err(LinodeError::api(400, "label: Label must be unique"));
        }
        s.calls.push(format!("CreateNodeBalancer label={}", opts.label));
        let id = s.id();
        s.next_nb += 1;
        let ipv4 = opts
            .ipv4
            .clone()
            .unwrap_or_else(|| format!("192.0.2.{}", s.next_nb));
        let nb = NodeBalancer {
            id,
            label: Some(opts.label.clone()),
            region: opts.region.clone(),
            hostname: Some(format!(
                "nb-{}.{}.nodebalancer.linode.com",
                ipv4.replace('.', "-"),
                opts.region
            )),
            ipv4: Some(ipv4),
            ipv6: Some(format!("2600:3c00::{}", s.next_nb)),
            client_conn_throttle: opts.client_conn_throttle,
            tags: opts.tags.clone(),
            type_: opts.type_,
        };
        s.nodebalancers.insert(id, nb.clone());
        for config in &opts.configs {
            let config_id = s.id();
            s.store_config(id, config_id, config);
        }
        Ok(nb)
    }

    async fn get_nodebalancer(&self, id: i64) -> ApiResult<NodeBalancer> {
        let s = self.read("GetNodeBalancer")?;
        s.nodebalancers
            .get(&id)
            .cloned()
            .ok_or_else(|| LinodeError::not_found(format!("nodebalancer {id}")))
    }

    async fn update_nodebalancer(
        &self,
        id: i64,
        opts: &NodeBalancerUpdateOptions,
    ) -> ApiResult<NodeBalancer> {
        let mut s = self.op("UpdateNodeBalancer")?;
        s.calls.push(format!("UpdateNodeBalancer id={id}"));
        let nb = s
            .nodebalancers
            .get_mut(&id)
            .ok_or_else(|| LinodeError::not_found(format!("nodebalancer {id}")))?;
        if let Some(label) = &opts.label {
            nb.label = Some(label.clone());
        }
        if let Some(throttle) = opts.client_conn_throttle {
            nb.client_conn_throttle = throttle;
        }
        if let Some(tags) = &opts.tags {
            nb.tags = tags.clone();
        }
        Ok(nb.clone())
    }

    async fn delete_nodebalancer(&self, id: i64) -> ApiResult<()> {
        let mut s = self.op("DeleteNodeBalancer")?;
        s.calls.push(format!("DeleteNodeBalancer id={id}"));
        if s.nodebalancers.remove(&id).is_none() {
            return Err(LinodeError::not_found(format!("nodebalancer {id}")));
        }
        let configs: Vec<i64> = s
            .nb_configs
            .values()
            .filter(|c| c.nodebalancer_id == id)
            .map(|c| c.id)
            .collect();
        for config_id in configs {
            s.nb_configs.remove(&config_id);
            s.nb_nodes.remove(&config_id);
        }
        for devices in s.firewall_devices.values_mut() {
            devices.retain(|d| {
                !(d.entity.type_ == FirewallDeviceType::NodeBalancer && d.entity.id == id)
            });
        }
        Ok(())
    }

    async fn list_nodebalancers(&self, filter: Option<&Filter>) -> ApiResult<Vec<NodeBalancer>> {
        let s = self.read("ListNodeBalancers")?;
        let label = filter.and_then(|f| f.get("label"));
        let ipv4 = filter.and_then(|f| f.get("ipv4"));
        Ok(s.nodebalancers
            .values()
            .filter(|nb| label.map(|l| nb.label.as_deref() == Some(l)).unwrap_or(true))
            .filter(|nb| ipv4.map(|ip| nb.ipv4.as_deref() == Some(ip)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create_nodebalancer_config(
        &self,
        nb_id: i64,
        opts: &NodeBalancerConfigOptions,
    ) -> ApiResult<NodeBalancerConfig> {
        let mut s = self.op("CreateNodeBalancerConfig")?;
        s.calls
            .push(format!("CreateNodeBalancerConfig nb={nb_id} port={}", opts.port));
        let config_id = s.id();
        Ok(s.store_config(nb_id, config_id, opts))
    }

    async fn delete_nodebalancer_config(&self, nb_id: i64, config_id: i64) -> ApiResult<()> {
        let mut s = self.op("DeleteNodeBalancerConfig")?;
        s.calls.push(format!(
            "DeleteNodeBalancerConfig nb={nb_id} config={config_id}"
        ));
        s.nb_configs.remove(&config_id);
        s.nb_nodes.remove(&config_id);
        Ok(())
    }

    async fn list_nodebalancer_configs(&self, nb_id: i64) -> ApiResult<Vec<NodeBalancerConfig>> {
        let s = self.read("ListNodeBalancerConfigs")?;
        Ok(s.nb_configs
            .values()
            .filter(|c| c.nodebalancer_id == nb_id)
            .cloned()
            .collect())
    }

    async fn rebuild_nodebalancer_config(
        &self,
        nb_id: i64,
        config_id: i64,
        opts: &NodeBalancerConfigOptions,
    ) -> ApiResult<NodeBalancerConfig> {
        let mut s = self.op("RebuildNodeBalancerConfig")?;
        s.calls.push(format!(
            "RebuildNodeBalancerConfig nb={nb_id} config={config_id} port={}",
            opts.port
        ));
        if !s.nb_configs.contains_key(&config_id) {
            return Err(LinodeError::not_found(format!("config {config_id}")));
        }
        Ok(s.store_config(nb_id, config_id, opts))
    }

    async fn list_nodebalancer_nodes(
        &self,
        _nb_id: i64,
        config_id: i64,
    ) -> ApiResult<Vec<NodeBalancerNode>> {
        let s = self.read("ListNodeBalancerNodes")?;
        Ok(s.nb_nodes.get(&config_id).cloned().unwrap_or_default())
    }

    async fn list_nodebalancer_firewalls(&self, nb_id: i64) -> ApiResult<Vec<Firewall>> {
        let s = self.read("ListNodeBalancerFirewalls")?;
        Ok(s.firewalls_for(FirewallDeviceType::NodeBalancer, nb_id))
    }

    async fn list_instance_firewalls(&self, id: i64) -> ApiResult<Vec<Firewall>> {
        let s = self.read("ListInstanceFirewalls")?;
        Ok(s.firewalls_for(FirewallDeviceType::Linode, id))
    }

    async fn create_firewall(&self, opts: &FirewallCreateOptions) -> ApiResult<Firewall> {
        let mut s = self.op("CreateFirewall")?;
        s.calls.push(format!("CreateFirewall label={}", opts.label));
        let id = s.id();
        let fw = Firewall {
            id,
            label: opts.label.clone(),
            status: "enabled".to_string(),
            tags: opts.tags.clone(),
            rules: opts.rules.clone(),
        };
        s.firewalls.insert(id, fw.clone());
        for nb in &opts.devices.nodebalancers {
            s.attach(id, FirewallDeviceType::NodeBalancer, *nb);
        }
        for linode in &opts.devices.linodes {
            s.attach(id, FirewallDeviceType::Linode, *linode);
        }
        Ok(fw)
    }

    async fn get_firewall(&self, id: i64) -> ApiResult<Firewall> {
        let s = self.read("GetFirewall")?;
        s.firewalls
            .get(&id)
            .cloned()
            .ok_or_else(|| LinodeError::not_found(format!("firewall {id}")))
    }

    async fn delete_firewall(&self, id: i64) -> ApiResult<()> {
        let mut s = self.op("DeleteFirewall")?;
        s.calls.push(format!("DeleteFirewall id={id}"));
        s.firewall_devices.remove(&id);
        s.firewalls
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| LinodeError::not_found(format!("firewall {id}")))
    }

    async fn update_firewall_rules(
        &self,
        id: i64,
        rules: &FirewallRuleSet,
    ) -> ApiResult<FirewallRuleSet> {
        let mut s = self.op("UpdateFirewallRules")?;
        s.calls.push(format!("UpdateFirewallRules id={id}"));
        let fw = s
            .firewalls
            .get_mut(&id)
            .ok_or_else(|| LinodeError::not_found(format!("firewall {id}")))?;
        fw.rules = rules.clone();
        Ok(rules.clone())
    }

    async fn list_firewall_devices(&self, firewall_id: i64) -> ApiResult<Vec<FirewallDevice>> {
        let s = self.read("ListFirewallDevices")?;
        if !s.firewalls.contains_key(&firewall_id) {
            return Err(LinodeError::not_found(format!("firewall {firewall_id}")));
        }
        Ok(s.firewall_devices
            .get(&firewall_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_firewall_device(
        &self,
        firewall_id: i64,
        opts: &FirewallDeviceCreateOptions,
    ) -> ApiResult<FirewallDevice> {
        let mut s = self.op("CreateFirewallDevice")?;
        let kind = match opts.type_ {
            FirewallDeviceType::NodeBalancer => "nb",
            FirewallDeviceType::Linode => "linode",
        };
        s.calls.push(format!(
            "CreateFirewallDevice fw={firewall_id} {kind}={}",
            opts.id
        ));
        if !s.firewalls.contains_key(&firewall_id) {
            return Err(LinodeError::not_found(format!("firewall {firewall_id}")));
        }
        Ok(s.attach(firewall_id, opts.type_, opts.id))
    }

    async fn delete_firewall_device(&self, firewall_id: i64, device_id: i64) -> ApiResult<()> {
        let mut s = self.op("DeleteFirewallDevice")?;
        s.calls.push(format!("DeleteFirewallDevice fw={firewall_id}"));
        let devices = s
            .firewall_devices
            .get_mut(&firewall_id)
            .ok_or_else(|| LinodeError::not_found(format!("firewall {firewall_id}")))?;
        devices.retain(|d| d.id != device_id);
        Ok(())
    }

    async fn list_vpcs(&self) -> ApiResult<Vec<Vpc>> {
        let s = self.read("ListVPCs")?;
        Ok(s.vpcs.clone())
    }

    async fn get_vpc(&self, id: i64) -> ApiResult<Vpc> {
        let s = self.read("GetVPC")?;
        s.vpcs
            .iter()
            .find(|v| v.id == id)
            .cloned()
            .ok_or_else(|| LinodeError::not_found(format!("vpc {id}")))
    }

    async fn list_vpc_subnets(&self, vpc_id: i64) -> ApiResult<Vec<VpcSubnet>> {
        let vpc = self.get_vpc(vpc_id).await?;
        Ok(vpc.subnets)
    }

    async fn get_vpc_subnet(&self, vpc_id: i64, subnet_id: i64) -> ApiResult<VpcSubnet> {
        let vpc = self.get_vpc(vpc_id).await?;
        vpc.subnets
            .into_iter()
            .find(|s| s.id == subnet_id)
            .ok_or_else(|| LinodeError::not_found(format!("subnet {subnet_id}")))
    }

    async fn list_vpc_ip_addresses(&self, vpc_id: i64) -> ApiResult<Vec<VpcIp>> {
        let s = self.read("ListVPCIPAddresses")?;
        if !s.vpcs.iter().any(|v| v.id == vpc_id) {
            return Err(LinodeError::not_found(format!("vpc {vpc_id}")));
        }
        Ok(s.vpc_ips.get(&vpc_id).cloned().unwrap_or_default())
    }

    async fn get_profile(&self) -> ApiResult<Profile> {
        let _s = self.read("GetProfile")?;
        Ok(Profile {
            username: "ccm".to_string(),
            email: "ccm@example.com".to_string(),
        })
    }
}
