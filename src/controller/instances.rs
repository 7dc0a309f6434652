//! Locate the Linode backing a Node

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{is_not_found, Error, Result};
use crate::linode::{Instance, LinodeApi};

pub const PROVIDER_ID_PREFIX: &str = "linode://";

/// Parse `linode://<id>`; the ID must be a positive integer without leading zeros
pub fn parse_provider_id(provider_id: &str) -> Result<i64> {
    let invalid = || Error::InvalidProviderId(provider_id.to_string());
    let digits = provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .ok_or_else(invalid)?;
    let valid = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0');
    if !valid {
        return Err(invalid());
    }
    digits.parse::<i64>().map_err(|_| invalid())
}

pub fn provider_id(id: i64) -> String {
    format!("{PROVIDER_ID_PREFIX}{id}")
}

/// Addresses of `node` of the given type (`InternalIP`, `ExternalIP`)
pub fn node_addresses(node: &Node, type_: &str) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addrs| {
            addrs
                .iter()
                .filter(|a| a.type_ == type_)
                .map(|a| a.address.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Linode private IPv4 addresses live in 192.168.128.0/17
pub fn is_private_ipv4(address: &str) -> bool {
    address
        .parse::<Ipv4Addr>()
        .map(|ip| {
            let o = ip.octets();
            o[0] == 192 && o[1] == 168 && o[2] >= 128
        })
        .unwrap_or(false)
}

struct CachedList {
    fetched: Instant,
    instances: Vec<Instance>,
}

/// Resolves Nodes to Linodes, caching the full instance listing for `ttl`
pub struct InstanceResolver {
    linode: Arc<dyn LinodeApi>,
    ttl: Duration,
    cache: Mutex<Option<CachedList>>,
}

impl InstanceResolver {
    pub fn new(linode: Arc<dyn LinodeApi>, ttl: Duration) -> Self {
        Self {
            linode,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Current instance listing, refreshed when stale or when `force` is set
    pub async fn list(&self, force: bool) -> Result<Vec<Instance>> {
        let mut cache = self.cache.lock().await;
        let fresh = cache
            .as_ref()
            .map(|c| c.fetched.elapsed() < self.ttl)
            .unwrap_or(false);
        if force || !fresh {
            debug!("refreshing instance cache");
            let instances = self.linode.list_instances(None).await?;
            *cache = Some(CachedList {
                fetched: Instant::now(),
                instances,
            });
        }
        Ok(cache
            .as_ref()
            .map(|c| c.instances.clone())
            .unwrap_or_default())
    }

    /// providerID first, then label, then any ExternalIP
    pub async fn lookup(&self, node: &Node) -> Result<Instance> {
        let name = node.name_any();
        if let Some(pid) = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .filter(|p| !p.is_empty())
        {
            let id = parse_provider_id(pid)?;
            return match self.linode.get_instance(id).await {
                Ok(instance) => Ok(instance),
                Err(e) => {
                    let err = Error::from(e);
                    if is_not_found(&err) {
                        Err(Error::InstanceNotFound(name))
                    } else {
                        Err(err)
                    }
                }
            };
        }

        let external = node_addresses(node, "ExternalIP");
        for force in [false, true] {
            let instances = self.list(force).await?;
            if let Some(found) = instances.iter().find(|i| i.label == name) {
                return Ok(found.clone());
            }
            if let Some(found) = instances
                .iter()
                .find(|i| i.ipv4.iter().any(|ip| external.contains(ip)))
            {
                return Ok(found.clone());
            }
        }
        Err(Error::InstanceNotFound(name))
    }

    /// First private IPv4 assigned to the instance
    pub async fn private_ipv4(&self, instance: &Instance) -> Result<Option<String>> {
        if let Some(ip) = instance.ipv4.iter().find(|ip| is_private_ipv4(ip)) {
            return Ok(Some(ip.clone()));
        }
        let ips = self.linode.get_instance_ip_addresses(instance.id).await?;
        Ok(ips.ipv4.private.first().map(|ip| ip.address.clone()))
    }
}
