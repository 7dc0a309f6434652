//! Command-line and environment configuration
//!
//! [`RunArgs`] is parsed by clap; [`Config::from_args`] validates it once at
//! startup and produces the immutable [`Config`] shared by every controller.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ipnet::{IpNet, Ipv4Net};

use crate::error::{Error, Result};
use crate::linode::NodeBalancerPlanType;

pub const DEFAULT_LINODE_URL: &str = "https://api.linode.com/v4";
pub const DEFAULT_BGP_PEER_PREFIX: &str = "2600:3c0f";

/// Numeric region IDs used to build BGP neighbor addresses
const REGION_IDS: &[(&str, u32)] = &[
    ("us-east", 6),
    ("us-central", 2),
    ("us-west", 3),
    ("us-southeast", 4),
    ("eu-west", 7),
    ("ap-south", 9),
    ("eu-central", 10),
    ("ap-northeast", 11),
    ("ap-west", 14),
    ("ca-central", 15),
    ("ap-southeast", 16),
    ("us-iad", 17),
    ("us-ord", 18),
    ("fr-par", 19),
    ("us-sea", 20),
    ("br-gru", 21),
    ("nl-ams", 22),
    ("se-sto", 23),
    ("es-mad", 24),
    ("in-maa", 25),
    ("jp-osa", 26),
    ("it-mil", 27),
    ("us-mia", 28),
    ("id-cgk", 29),
    ("us-lax", 30),
    ("gb-lon", 44),
    ("au-mel", 45),
    ("in-bom-2", 46),
    ("de-fra-2", 47),
    ("sg-sin-2", 48),
    ("jp-tyo-3", 49),
];

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadBalancerType {
    #[default]
    Nodebalancer,
    CiliumBgp,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlanType {
    #[default]
    Common,
    Premium,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Linode API token
    #[arg(long, env = "LINODE_API_TOKEN", hide_env_values = true)]
    pub linode_token: String,

    /// Region the cluster runs in
    #[arg(long, env = "LINODE_REGION")]
    pub region: String,

    /// Linode API base URL
    #[arg(long, env = "LINODE_URL", default_value = DEFAULT_LINODE_URL)]
    pub linode_url: String,

    /// Cluster name, used in NodeBalancer labels and tags
    #[arg(long, env = "CLUSTER_NAME", default_value = "kubernetes")]
    pub cluster_name: String,

    /// Minimum seconds between metadata refreshes of the same node
    #[arg(long, env = "LINODE_METADATA_TTL", default_value_t = 300)]
    pub metadata_ttl_secs: u64,

    #[arg(long, env = "LINODE_ROUTES_CACHE_TTL", default_value_t = 60)]
    pub routes_cache_ttl_secs: u64,

    #[arg(long, env = "LINODE_INSTANCE_CACHE_TTL", default_value_t = 900)]
    pub instance_cache_ttl_secs: u64,

    /// JSON object replacing the built-in region ID map
    #[arg(long, env = "BGP_CUSTOM_ID_MAP")]
    pub bgp_custom_id_map: Option<String>,

    #[arg(long, env = "BGP_PEER_PREFIX", default_value = DEFAULT_BGP_PEER_PREFIX)]
    pub bgp_peer_prefix: String,

    /// Publish only the NodeBalancer hostname in Service status
    #[arg(long, env = "LINODE_HOSTNAME_ONLY_INGRESS")]
    pub hostname_only_ingress: Option<String>,

    #[arg(long, value_enum, default_value_t = LoadBalancerType::Nodebalancer)]
    pub load_balancer_type: LoadBalancerType,

    /// Node label selector (`k=v,...`) for BGP speakers; empty selects all nodes
    #[arg(long)]
    pub bgp_node_selector: Option<String>,

    #[arg(long, default_value = "")]
    pub ip_holder_suffix: String,

    #[arg(long, value_delimiter = ',')]
    pub vpc_names: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    pub subnet_names: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    pub vpc_ids: Vec<i64>,

    #[arg(long, value_delimiter = ',')]
    pub subnet_ids: Vec<i64>,

    #[arg(long)]
    pub enable_route_controller: bool,

    #[arg(long)]
    pub allocate_node_cidrs: bool,

    #[arg(long)]
    pub cluster_cidr: Option<String>,

    #[arg(long)]
    pub service_cidr: Option<String>,

    #[arg(long)]
    pub secondary_service_cidr: Option<String>,

    #[arg(long, default_value_t = 24)]
    pub node_cidr_mask_size_ipv4: u8,

    #[arg(long, default_value_t = 30)]
    pub cidr_update_retries: u32,

    /// Extra tags put on every NodeBalancer
    #[arg(long, value_delimiter = ',')]
    pub nodebalancer_tags: Vec<String>,

    #[arg(long, value_enum, default_value_t = PlanType::Common)]
    pub default_nodebalancer_type: PlanType,

    #[arg(long)]
    pub enable_ipv6_for_loadbalancers: bool,

    #[arg(long)]
    pub exclude_control_plane_nodes: bool,

    #[arg(long)]
    pub nodebalancer_backend_ipv4_subnet_id: Option<i64>,

    #[arg(long)]
    pub nodebalancer_backend_ipv4_subnet_name: Option<String>,

    #[arg(long)]
    pub disable_nodebalancer_vpc_backends: bool,

    /// Delay before retrying work that hit a 429 or 5xx
    #[arg(long, default_value_t = 60)]
    pub retry_interval_secs: u64,

    /// Token health probe period; 0 disables the probe
    #[arg(long, default_value_t = 0)]
    pub token_health_check_period_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub api_timeout_secs: u64,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[arg(long, default_value = "0.0.0.0:10253")]
    pub metrics_bind_address: SocketAddr,
}

/// Validated, immutable runtime configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub linode_token: String,
    pub region: String,
    pub linode_url: String,
    pub cluster_name: String,
    pub metadata_ttl: Duration,
    pub routes_cache_ttl: Duration,
    pub instance_cache_ttl: Duration,
    pub region_ids: BTreeMap<String, u32>,
    pub bgp_peer_prefix: String,
    pub hostname_only_ingress: Option<bool>,
    pub load_balancer_type: LoadBalancerType,
    pub bgp_node_selector: Option<String>,
    pub ip_holder_suffix: String,
    pub vpc_names: Vec<String>,
    pub subnet_names: Vec<String>,
    pub vpc_ids: Vec<i64>,
    pub subnet_ids: Vec<i64>,
    pub enable_route_controller: bool,
    pub allocate_node_cidrs: bool,
    pub cluster_cidr: Option<Ipv4Net>,
    pub service_cidr: Option<IpNet>,
    pub secondary_service_cidr: Option<IpNet>,
    pub node_cidr_mask_size_ipv4: u8,
    pub cidr_update_retries: u32,
    pub nodebalancer_tags: Vec<String>,
    pub default_nodebalancer_type: NodeBalancerPlanType,
    pub enable_ipv6_for_loadbalancers: bool,
    pub exclude_control_plane_nodes: bool,
    pub nodebalancer_backend_ipv4_subnet_id: Option<i64>,
    pub nodebalancer_backend_ipv4_subnet_name: Option<String>,
    pub disable_nodebalancer_vpc_backends: bool,
    pub retry_interval: Duration,
    pub token_health_check_period: Option<Duration>,
    pub api_timeout: Duration,
    pub log_format: LogFormat,
    pub metrics_bind_address: SocketAddr,
}

impl Config {
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        if args.linode_token.trim().is_empty() {
            return Err(Error::ConfigError("LINODE_API_TOKEN must be set".to_string()));
        }
        if args.region.trim().is_empty() {
            return Err(Error::ConfigError("LINODE_REGION must be set".to_string()));
        }

        let by_name = !args.vpc_names.is_empty() || !args.subnet_names.is_empty();
        let by_id = !args.vpc_ids.is_empty() || !args.subnet_ids.is_empty();
        if by_name && by_id {
            return Err(Error::ConfigError(
                "--vpc-names/--subnet-names and --vpc-ids/--subnet-ids are mutually exclusive"
                    .to_string(),
            ));
        }
        if !args.subnet_ids.is_empty() && args.vpc_ids.is_empty() {
            return Err(Error::ConfigError(
                "--subnet-ids requires --vpc-ids".to_string(),
            ));
        }
        if args.enable_route_controller && args.vpc_names.is_empty() && args.vpc_ids.is_empty() {
            return Err(Error::ConfigError(
                "--enable-route-controller requires a VPC".to_string(),
            ));
        }
        if args.nodebalancer_backend_ipv4_subnet_id.is_some()
            && args.nodebalancer_backend_ipv4_subnet_name.is_some()
        {
            return Err(Error::ConfigError(
                "only one of --nodebalancer-backend-ipv4-subnet-id and --nodebalancer-backend-ipv4-subnet-name may be set"
                    .to_string(),
            ));
        }

        let cluster_cidr = match args.cluster_cidr.as_deref() {
            Some(raw) => Some(parse_cluster_cidr(raw)?),
            None => None,
        };
        if args.allocate_node_cidrs {
            let cidr = cluster_cidr.ok_or_else(|| {
                Error::ConfigError("--allocate-node-cidrs requires --cluster-cidr".to_string())
            })?;
            if args.node_cidr_mask_size_ipv4 < cidr.prefix_len()
                || args.node_cidr_mask_size_ipv4 > 32
            {
                return Err(Error::ConfigError(format!(
                    "--node-cidr-mask-size-ipv4 {} does not fit cluster CIDR {}",
                    args.node_cidr_mask_size_ipv4, cidr
                )));
            }
        }

        let service_cidr = args
            .service_cidr
            .as_deref()
            .map(|s| s.trim().parse::<IpNet>())
            .transpose()?;
        let secondary_service_cidr = args
            .secondary_service_cidr
            .as_deref()
            .map(|s| s.trim().parse::<IpNet>())
            .transpose()?;

        let region_ids = match args.bgp_custom_id_map.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_region_ids(raw)?,
            _ => REGION_IDS
                .iter()
                .map(|(region, id)| (region.to_string(), *id))
                .collect(),
        };

        let hostname_only_ingress = args
            .hostname_only_ingress
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(crate::annotations::parse_bool);

        Ok(Self {
            linode_token: args.linode_token.clone(),
            region: args.region.clone(),
            linode_url: args.linode_url.clone(),
            cluster_name: args.cluster_name.clone(),
            metadata_ttl: Duration::from_secs(args.metadata_ttl_secs),
            routes_cache_ttl: Duration::from_secs(args.routes_cache_ttl_secs),
            instance_cache_ttl: Duration::from_secs(args.instance_cache_ttl_secs),
            region_ids,
            bgp_peer_prefix: args.bgp_peer_prefix.clone(),
            hostname_only_ingress,
            load_balancer_type: args.load_balancer_type,
            bgp_node_selector: args.bgp_node_selector.clone(),
            ip_holder_suffix: args.ip_holder_suffix.clone(),
            vpc_names: args.vpc_names.clone(),
            subnet_names: args.subnet_names.clone(),
            vpc_ids: args.vpc_ids.clone(),
            subnet_ids: args.subnet_ids.clone(),
            enable_route_controller: args.enable_route_controller,
            allocate_node_cidrs: args.allocate_node_cidrs,
            cluster_cidr,
            service_cidr,
            secondary_service_cidr,
            node_cidr_mask_size_ipv4: args.node_cidr_mask_size_ipv4,
            cidr_update_retries: args.cidr_update_retries,
            nodebalancer_tags: args
                .nodebalancer_tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            default_nodebalancer_type: match args.default_nodebalancer_type {
                PlanType::Common => NodeBalancerPlanType::Common,
                PlanType::Premium => NodeBalancerPlanType::Premium,
            },
            enable_ipv6_for_loadbalancers: args.enable_ipv6_for_loadbalancers,
            exclude_control_plane_nodes: args.exclude_control_plane_nodes,
            nodebalancer_backend_ipv4_subnet_id: args.nodebalancer_backend_ipv4_subnet_id,
            nodebalancer_backend_ipv4_subnet_name: args
                .nodebalancer_backend_ipv4_subnet_name
                .clone(),
            disable_nodebalancer_vpc_backends: args.disable_nodebalancer_vpc_backends,
            retry_interval: Duration::from_secs(args.retry_interval_secs),
            token_health_check_period: match args.token_health_check_period_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            api_timeout: Duration::from_secs(args.api_timeout_secs),
            log_format: args.log_format,
            metrics_bind_address: args.metrics_bind_address,
        })
    }

    /// True when any VPC is configured, by name or by ID
    pub fn vpc_enabled(&self) -> bool {
        !self.vpc_names.is_empty() || !self.vpc_ids.is_empty()
    }

    pub fn region_id(&self, region: &str) -> Option<u32> {
        self.region_ids.get(region).copied()
    }
}

/// Accept exactly one IPv4 CIDR; dual-stack or IPv6 cluster CIDRs are rejected
fn parse_cluster_cidr(raw: &str) -> Result<Ipv4Net> {
    let parts: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    match parts.as_slice() {
        [single] => match single.parse::<IpNet>()? {
            IpNet::V4(net) => Ok(net.trunc()),
            IpNet::V6(_) => Err(Error::ConfigError(format!(
                "IPv6 cluster CIDR {single} is not supported"
            ))),
        },
        [] => Err(Error::ConfigError("--cluster-cidr is empty".to_string())),
        _ => Err(Error::ConfigError(format!(
            "dual-stack cluster CIDRs are not supported: {raw}"
        ))),
    }
}

fn parse_region_ids(raw: &str) -> Result<BTreeMap<String, u32>> {
    serde_json::from_str(raw)
        .map_err(|e| Error::ConfigError(format!("BGP_CUSTOM_ID_MAP is not valid JSON: {e}")))
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    test_config_with(&[])
}

#[cfg(test)]
pub(crate) fn test_config_with(extra: &[&str]) -> Config {
    let mut argv = vec![
        "linode-ccm",
        "--linode-token",
        "test-token",
        "--region",
        "us-ord",
        "--cluster-name",
        "linodelb",
        "--linode-url",
        DEFAULT_LINODE_URL,
        "--bgp-peer-prefix",
        DEFAULT_BGP_PEER_PREFIX,
    ];
    argv.extend_from_slice(extra);
    Config::from_args(&RunArgs::parse_from(argv)).unwrap()
}
