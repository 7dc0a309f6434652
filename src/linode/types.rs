//! Wire types for the subset of the Linode API v4 used by the controllers

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Paging and filtering
// ============================================================================

/// One page of a list endpoint
#[derive(Clone, Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T> {
    #[serde(default)]
    pub data: Vec<T>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page")]
    pub pages: u32,
    #[serde(default)]
    pub results: u32,
}

fn default_page() -> u32 {
    1
}

/// API-level predicate passed in the `X-Filter` header
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter(serde_json::Map<String, serde_json::Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_label(label: &str) -> Self {
        Self::new().eq("label", label)
    }

    pub fn eq(mut self, field: &str, value: &str) -> Self {
        self.0.insert(
            field.to_string(),
            serde_json::Value::String(value.to_string()),
        );
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|v| v.as_str())
    }

    pub fn to_header(&self) -> String {
        serde_json::Value::Object(self.0.clone()).to_string()
    }
}

// ============================================================================
// Instances
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceGeneration {
    #[default]
    LegacyConfig,
    Linode,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Instance {
    pub id: i64,
    pub label: String,
    #[serde(default)]
    pub region: String,
    #[serde(rename = "type", default)]
    pub type_: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub host_uuid: String,
    #[serde(default)]
    pub interface_generation: InterfaceGeneration,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct InstanceCreateOptions {
    pub region: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booted: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InstanceIp {
    pub address: String,
    #[serde(default)]
    pub prefix: u8,
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub linode_id: i64,
    #[serde(default)]
    pub region: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InstanceIpv4Response {
    #[serde(default)]
    pub public: Vec<InstanceIp>,
    #[serde(default)]
    pub private: Vec<InstanceIp>,
    #[serde(default)]
    pub shared: Vec<InstanceIp>,
    #[serde(default)]
    pub reserved: Vec<InstanceIp>,
    #[serde(default)]
    pub vpc: Vec<VpcIp>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InstanceIpAddressResponse {
    #[serde(default)]
    pub ipv4: InstanceIpv4Response,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct InstanceIpAddOptions {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub public: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IpAddressesShareOptions {
    pub ips: Vec<String>,
    pub linode_id: i64,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct ReserveIpOptions<'a> {
    pub region: &'a str,
}

// ============================================================================
// Instance configs and interfaces
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfacePurpose {
    #[default]
    Public,
    Vlan,
    Vpc,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct VpcIpv4 {
    #[serde(default)]
    pub vpc: Option<String>,
    #[serde(default)]
    pub nat_1_1: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InstanceConfigInterface {
    pub id: i64,
    #[serde(default)]
    pub purpose: InterfacePurpose,
    #[serde(default)]
    pub vpc_id: Option<i64>,
    #[serde(default)]
    pub subnet_id: Option<i64>,
    #[serde(default)]
    pub ipv4: Option<VpcIpv4>,
    #[serde(default)]
    pub ip_ranges: Vec<String>,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InstanceConfig {
    pub id: i64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub interfaces: Vec<InstanceConfigInterface>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct InstanceConfigInterfaceUpdateOptions {
    pub ip_ranges: Vec<String>,
}

/// Interface in the newer per-Linode interface model
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LinodeInterface {
    pub id: i64,
    #[serde(default)]
    pub vpc: Option<LinodeInterfaceVpc>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LinodeInterfaceVpc {
    pub vpc_id: i64,
    #[serde(default)]
    pub subnet_id: i64,
    #[serde(default)]
    pub ipv4: LinodeInterfaceVpcIpv4,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LinodeInterfaceVpcIpv4 {
    #[serde(default)]
    pub addresses: Vec<LinodeInterfaceAddress>,
    #[serde(default)]
    pub ranges: Vec<LinodeInterfaceRange>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LinodeInterfaceAddress {
    pub address: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LinodeInterfaceRange {
    pub range: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LinodeInterfaceUpdateOptions {
    pub vpc: LinodeInterfaceVpcUpdate,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LinodeInterfaceVpcUpdate {
    pub ipv4: LinodeInterfaceRangesUpdate,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LinodeInterfaceRangesUpdate {
    pub ranges: Vec<LinodeInterfaceRange>,
}

// ============================================================================
// NodeBalancers
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeBalancerPlanType {
    #[default]
    Common,
    Premium,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeBalancer {
    pub id: i64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub client_conn_throttle: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "type", default)]
    pub type_: Option<NodeBalancerPlanType>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NodeBalancerVpcOptions {
    pub subnet_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_range: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NodeBalancerCreateOptions {
    pub label: String,
    pub region: String,
    pub client_conn_throttle: i32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<NodeBalancerConfigOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<NodeBalancerPlanType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpcs: Option<Vec<NodeBalancerVpcOptions>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NodeBalancerUpdateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_conn_throttle: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigProtocol {
    #[default]
    Tcp,
    Http,
    Https,
    Udp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    None,
    V1,
    V2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Source,
    RingHash,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStickiness {
    #[default]
    None,
    Table,
    HttpCookie,
    Session,
    SourceIp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigCheck {
    None,
    #[default]
    Connection,
    Http,
    HttpBody,
}

macro_rules! wire_display {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(serde_json::Value::String(s)) => f.write_str(&s),
                    _ => write!(f, "{:?}", self),
                }
            }
        })*
    };
}

wire_display!(
    ConfigProtocol,
    ProxyProtocol,
    ConfigAlgorithm,
    ConfigStickiness,
    ConfigCheck,
    NodeBalancerPlanType
);

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeBalancerConfig {
    pub id: i64,
    pub port: i32,
    #[serde(default)]
    pub protocol: ConfigProtocol,
    #[serde(default)]
    pub proxy_protocol: ProxyProtocol,
    #[serde(default)]
    pub algorithm: ConfigAlgorithm,
    #[serde(default)]
    pub stickiness: ConfigStickiness,
    #[serde(default)]
    pub check: ConfigCheck,
    #[serde(default)]
    pub check_interval: i32,
    #[serde(default)]
    pub check_timeout: i32,
    #[serde(default)]
    pub check_attempts: i32,
    #[serde(default)]
    pub check_path: String,
    #[serde(default)]
    pub check_body: String,
    #[serde(default)]
    pub check_passive: bool,
    #[serde(default)]
    pub udp_check_port: Option<i32>,
    #[serde(default)]
    pub ssl_fingerprint: String,
    #[serde(default)]
    pub nodebalancer_id: i64,
}

/// Body of both `POST .../configs` and `POST .../configs/{id}/rebuild`
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NodeBalancerConfigOptions {
    pub port: i32,
    pub protocol: ConfigProtocol,
    pub proxy_protocol: ProxyProtocol,
    pub algorithm: ConfigAlgorithm,
    pub stickiness: ConfigStickiness,
    pub check: ConfigCheck,
    pub check_interval: i32,
    pub check_timeout: i32,
    pub check_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_body: Option<String>,
    pub check_passive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_check_port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key: Option<String>,
    pub nodes: Vec<NodeBalancerNodeOptions>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    #[default]
    Accept,
    Reject,
    Drain,
    Backup,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeBalancerNode {
    pub id: i64,
    pub address: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub mode: NodeMode,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub config_id: i64,
    #[serde(default)]
    pub nodebalancer_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct NodeBalancerNodeOptions {
    pub address: String,
    pub label: String,
    pub weight: i32,
    pub mode: NodeModeOption,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<i64>,
}

/// `NodeMode` with a total order so node options can be sorted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeModeOption {
    #[default]
    Accept,
    Drain,
}

// ============================================================================
// Firewalls
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FirewallPolicy {
    #[default]
    Accept,
    Drop,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkProtocol {
    #[default]
    Tcp,
    Udp,
    Icmp,
    Ipencap,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkAddresses {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FirewallRule {
    pub action: FirewallPolicy,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub protocol: NetworkProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    #[serde(default)]
    pub addresses: NetworkAddresses,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FirewallRuleSet {
    #[serde(default)]
    pub inbound: Vec<FirewallRule>,
    #[serde(default)]
    pub inbound_policy: FirewallPolicy,
    #[serde(default)]
    pub outbound: Vec<FirewallRule>,
    #[serde(default)]
    pub outbound_policy: FirewallPolicy,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Firewall {
    pub id: i64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub rules: FirewallRuleSet,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FirewallDevicesCreateOptions {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub linodes: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodebalancers: Vec<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FirewallCreateOptions {
    pub label: String,
    pub rules: FirewallRuleSet,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub devices: FirewallDevicesCreateOptions,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallDeviceType {
    #[default]
    Linode,
    #[serde(rename = "nodebalancer")]
    NodeBalancer,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FirewallDeviceEntity {
    pub id: i64,
    #[serde(rename = "type")]
    pub type_: FirewallDeviceType,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FirewallDevice {
    pub id: i64,
    pub entity: FirewallDeviceEntity,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FirewallDeviceCreateOptions {
    pub id: i64,
    #[serde(rename = "type")]
    pub type_: FirewallDeviceType,
}

// ============================================================================
// VPCs
// ============================================================================

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct VpcSubnet {
    pub id: i64,
    pub label: String,
    #[serde(default)]
    pub ipv4: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Vpc {
    pub id: i64,
    pub label: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub subnets: Vec<VpcSubnet>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct VpcIp {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub address_range: Option<String>,
    #[serde(default)]
    pub vpc_id: i64,
    #[serde(default)]
    pub subnet_id: i64,
    #[serde(default)]
    pub linode_id: i64,
    #[serde(default)]
    pub config_id: Option<i64>,
    #[serde(default)]
    pub interface_id: i64,
    #[serde(default)]
    pub active: bool,
}

// ============================================================================
// Account
// ============================================================================

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Profile {
    pub username: String,
    #[serde(default)]
    pub email: String,
}
