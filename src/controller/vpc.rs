//! VPC and subnet name resolution with per-process caches

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{is_not_found, Error, Result};
use crate::linode::{LinodeApi, VpcIp, VpcSubnet};

pub struct VpcResolver {
    linode: Arc<dyn LinodeApi>,
    vpc_names: Vec<String>,
    subnet_names: Vec<String>,
    nb_backend_subnet_id: Option<i64>,
    vpc_ids: RwLock<HashMap<String, i64>>,
    subnet_ids: RwLock<HashMap<(i64, String), i64>>,
}

impl VpcResolver {
    /// Resolver with no configured VPC; lookups still work on demand
    pub fn new(linode: Arc<dyn LinodeApi>) -> Self {
        Self {
            linode,
            vpc_names: Vec::new(),
            subnet_names: Vec::new(),
            nb_backend_subnet_id: None,
            vpc_ids: RwLock::new(HashMap::new()),
            subnet_ids: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve configured IDs to names so the rest of the process can use names
    /// uniformly, then resolve the NodeBalancer backend subnet.
    pub async fn init(linode: Arc<dyn LinodeApi>, config: &Config) -> Result<Self> {
        let mut resolver = Self::new(linode);

        if !config.vpc_ids.is_empty() {
            for id in &config.vpc_ids {
                let vpc = resolver.linode.get_vpc(*id).await?;
                resolver.vpc_ids.write().await.insert(vpc.label.clone(), vpc.id);
                resolver.vpc_names.push(vpc.label);
            }
            let first_vpc = config.vpc_ids[0];
            for id in &config.subnet_ids {
                let subnet = resolver.linode.get_vpc_subnet(first_vpc, *id).await?;
                resolver
                    .subnet_ids
                    .write()
                    .await
                    .insert((first_vpc, subnet.label.clone()), subnet.id);
                resolver.subnet_names.push(subnet.label);
            }
        } else {
            resolver.vpc_names = config.vpc_names.clone();
            resolver.subnet_names = config.subnet_names.clone();
        }

        if !config.disable_nodebalancer_vpc_backends {
            resolver.nb_backend_subnet_id = match (
                config.nodebalancer_backend_ipv4_subnet_id,
                config.nodebalancer_backend_ipv4_subnet_name.as_deref(),
            ) {
                (Some(id), _) => Some(id),
                (None, Some(name)) => {
                    let vpc = resolver.vpc_names.first().cloned().ok_or_else(|| {
                        Error::ConfigError(
                            "--nodebalancer-backend-ipv4-subnet-name requires a VPC".to_string(),
                        )
                    })?;
                    let vpc_id = resolver.resolve_vpc_id(&vpc).await?;
                    Some(resolver.resolve_subnet_id(vpc_id, name).await?)
                }
                (None, None) => None,
            };
        }

        info!(
            vpcs = ?resolver.vpc_names,
            subnets = ?resolver.subnet_names,
            nb_backend_subnet = ?resolver.nb_backend_subnet_id,
            "VPC configuration resolved"
        );
        Ok(resolver)
    }

    pub fn vpc_names(&self) -> &[String] {
        &self.vpc_names
    }

    /// Subnet NodeBalancer backends are placed in when no annotation overrides it
    pub fn nb_backend_subnet_id(&self) -> Option<i64> {
        self.nb_backend_subnet_id
    }

    pub async fn resolve_vpc_id(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.vpc_ids.read().await.get(name) {
            return Ok(*id);
        }

        let mut cache = self.vpc_ids.write().await;
        if let Some(id) = cache.get(name) {
            return Ok(*id);
        }
        debug!(vpc = %name, "VPC cache miss, listing VPCs");
        for vpc in self.linode.list_vpcs().await? {
            cache.insert(vpc.label, vpc.id);
        }
        cache
            .get(name)
            .copied()
            .ok_or_else(|| Error::VpcNotFound(name.to_string()))
    }

    pub async fn resolve_subnet_id(&self, vpc_id: i64, name: &str) -> Result<i64> {
        let key = (vpc_id, name.to_string());
        if let Some(id) = self.subnet_ids.read().await.get(&key) {
            return Ok(*id);
        }

        let mut cache = self.subnet_ids.write().await;
        if let Some(id) = cache.get(&key) {
            return Ok(*id);
        }
        debug!(vpc_id, subnet = %name, "subnet cache miss, listing subnets");
        for subnet in self.linode.list_vpc_subnets(vpc_id).await? {
            cache.insert((vpc_id, subnet.label), subnet.id);
        }
        cache
            .get(&key)
            .copied()
            .ok_or_else(|| Error::SubnetNotFound(name.to_string()))
    }

    pub async fn get_subnet(&self, vpc_id: i64, subnet_id: i64) -> Result<VpcSubnet> {
        Ok(self.linode.get_vpc_subnet(vpc_id, subnet_id).await?)
    }

    /// IDs of every configured VPC
    pub async fn configured_vpc_ids(&self) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(self.vpc_names.len());
        for name in &self.vpc_names {
            ids.push(self.resolve_vpc_id(name).await?);
        }
        Ok(ids)
    }

    /// List IPs of the named VPC. A 404 drops the cached ID so the next call re-resolves.
    pub async fn list_vpc_ips(&self, name: &str) -> Result<Vec<VpcIp>> {
        let id = self.resolve_vpc_id(name).await?;
        match self.linode.list_vpc_ip_addresses(id).await {
            Ok(ips) => Ok(ips),
            Err(e) => {
                let err = Error::from(e);
                if is_not_found(&err) {
                    warn!(vpc = %name, id, "VPC disappeared, invalidating cache entry");
                    self.vpc_ids.write().await.remove(name);
                }
                Err(err)
            }
        }
    }
}
