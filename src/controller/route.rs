//! Pod-CIDR routes expressed as VPC interface IP ranges

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::{IpNet, Ipv4Net};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::instances::InstanceResolver;
use crate::controller::vpc::VpcResolver;
use crate::error::{Error, Result};
use crate::k8s::ClusterClient;
use crate::linode::{
    Instance, InstanceConfigInterfaceUpdateOptions, InterfaceGeneration, InterfacePurpose,
    LinodeApi, LinodeInterfaceRange, LinodeInterfaceRangesUpdate, LinodeInterfaceUpdateOptions,
    LinodeInterfaceVpcUpdate,
};

/// How often the reconcile loop compares Node podCIDRs with routes
pub const RECONCILE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Route {
    /// Instance label, which is also the Node name
    pub target_node: String,
    pub destination_cidr: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InterfaceRef {
    Config { config_id: i64, interface_id: i64 },
    Linode { interface_id: i64 },
}

/// A VPC interface with an address, from either interface model
#[derive(Clone, Debug)]
struct VpcInterface {
    target: InterfaceRef,
    ranges: Vec<String>,
}

struct CachedRoutes {
    fetched: Instant,
    routes: Vec<Route>,
}

pub struct RouteController {
    linode: Arc<dyn LinodeApi>,
    cluster: Arc<dyn ClusterClient>,
    vpcs: Arc<VpcResolver>,
    instances: Arc<InstanceResolver>,
    /// Only routes inside this range are removed by [`RouteController::reconcile`]
    cluster_cidr: Option<Ipv4Net>,
    ttl: Duration,
    cache: Mutex<Option<CachedRoutes>>,
}

impl RouteController {
    pub fn new(
        linode: Arc<dyn LinodeApi>,
        cluster: Arc<dyn ClusterClient>,
        vpcs: Arc<VpcResolver>,
        instances: Arc<InstanceResolver>,
        cluster_cidr: Option<Ipv4Net>,
        ttl: Duration,
    ) -> Self {
        Self {
            linode,
            cluster,
            vpcs,
            instances,
            cluster_cidr,
            ttl,
            cache: Mutex::new(None),
        }
    }

    async fn vpc_interfaces(
        &self,
        instance: &Instance,
        vpc_ids: &[i64],
    ) -> Result<Vec<VpcInterface>> {
        let mut found = Vec::new();
        match instance.interface_generation {
            InterfaceGeneration::Linode => {
                for iface in self.linode.list_interfaces(instance.id).await? {
                    let Some(vpc) = iface.vpc else { continue };
                    if !vpc_ids.contains(&vpc.vpc_id) || vpc.ipv4.addresses.is_empty() {
                        continue;
                    }
                    found.push(VpcInterface {
                        target: InterfaceRef::Linode {
                            interface_id: iface.id,
                        },
                        ranges: vpc.ipv4.ranges.into_iter().map(|r| r.range).collect(),
                    });
                }
            }
            InterfaceGeneration::LegacyConfig => {
                for config in self.linode.list_instance_configs(instance.id).await? {
                    for iface in config.interfaces {
                        let in_vpc = iface.purpose == InterfacePurpose::Vpc
                            && iface.vpc_id.is_some_and(|id| vpc_ids.contains(&id));
                        let has_address = iface
                            .ipv4
                            .as_ref()
                            .and_then(|ip| ip.vpc.as_deref())
                            .is_some_and(|ip| !ip.is_empty());
                        if in_vpc && has_address {
                            found.push(VpcInterface {
                                target: InterfaceRef::Config {
                                    config_id: config.id,
                                    interface_id: iface.id,
                                },
                                ranges: iface.ip_ranges,
                            });
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    /// Linodes holding an address in any configured VPC
    async fn vpc_members(&self) -> Result<HashSet<i64>> {
        let mut members = HashSet::new();
        for name in self.vpcs.vpc_names() {
            members.extend(
                self.vpcs
                    .list_vpc_ips(name)
                    .await?
                    .into_iter()
                    .map(|ip| ip.linode_id),
            );
        }
        Ok(members)
    }

    async fn fetch_routes(&self) -> Result<Vec<Route>> {
        let vpc_ids = self.vpcs.configured_vpc_ids().await?;
        let members = self.vpc_members().await?;
        let mut routes = Vec::new();
        for instance in self
            .instances
            .list(true)
            .await?
            .into_iter()
            .filter(|i| members.contains(&i.id))
        {
            for iface in self.vpc_interfaces(&instance, &vpc_ids).await? {
                routes.extend(iface.ranges.into_iter().map(|range| Route {
                    target_node: instance.label.clone(),
                    destination_cidr: range,
                }));
            }
        }
        Ok(routes)
    }

    /// Routes of every instance in a configured VPC whose Node is in the cluster
    pub async fn list_routes(&self) -> Result<Vec<Route>> {
        let routes = {
            let mut cache = self.cache.lock().await;
            let fresh = cache
                .as_ref()
                .is_some_and(|c| c.fetched.elapsed() < self.ttl);
            if !fresh {
                debug!("refreshing route cache");
                *cache = Some(CachedRoutes {
                    fetched: Instant::now(),
                    routes: self.fetch_routes().await?,
                });
            }
            cache.as_ref().map(|c| c.routes.clone()).unwrap_or_default()
        };

        let nodes: HashSet<String> = self
            .cluster
            .list_nodes()
            .await?
            .iter()
            .map(|n| n.name_any())
            .collect();
        Ok(routes
            .into_iter()
            .filter(|r| nodes.contains(&r.target_node))
            .collect())
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn target_interface(&self, route: &Route) -> Result<(Instance, VpcInterface)> {
        let node = self
            .cluster
            .get_node(&route.target_node)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(route.target_node.clone()))?;
        let instance = self.instances.lookup(&node).await?;
        let vpc_ids = self.vpcs.configured_vpc_ids().await?;
        let iface = self
            .vpc_interfaces(&instance, &vpc_ids)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoVpcInterface(route.target_node.clone()))?;
        Ok((instance, iface))
    }

    async fn set_ranges(
        &self,
        instance: &Instance,
        target: InterfaceRef,
        ranges: Vec<String>,
    ) -> Result<()> {
        match target {
            InterfaceRef::Linode { interface_id } => {
                let opts = LinodeInterfaceUpdateOptions {
                    vpc: LinodeInterfaceVpcUpdate {
                        ipv4: LinodeInterfaceRangesUpdate {
                            ranges: ranges
                                .into_iter()
                                .map(|range| LinodeInterfaceRange { range })
                                .collect(),
                        },
                    },
                };
                self.linode
                    .update_interface(instance.id, interface_id, &opts)
                    .await?;
            }
            InterfaceRef::Config {
                config_id,
                interface_id,
            } => {
                let opts = InstanceConfigInterfaceUpdateOptions { ip_ranges: ranges };
                self.linode
                    .update_instance_config_interface(instance.id, config_id, interface_id, &opts)
                    .await?;
            }
        }
        self.invalidate().await;
        Ok(())
    }

    /// A route belongs to the cluster when its destination lies in the cluster CIDR
    fn is_responsible_for(&self, route: &Route) -> bool {
        let Some(cluster) = self.cluster_cidr else {
            return false;
        };
        match route.destination_cidr.parse::<IpNet>() {
            Ok(IpNet::V4(dest)) => cluster.contains(&dest),
            _ => false,
        }
    }

    #[instrument(
        skip(self, route),
        fields(node = %route.target_node, cidr = %route.destination_cidr)
    )]
    pub async fn create_route(&self, route: &Route) -> Result<()> {
        let (instance, iface) = self.target_interface(route).await?;
        if iface.ranges.contains(&route.destination_cidr) {
            debug!("route already present");
            return Ok(());
        }
        let mut ranges = iface.ranges;
        ranges.push(route.destination_cidr.clone());
        self.set_ranges(&instance, iface.target, ranges).await?;
        info!("Created route");
        Ok(())
    }

    #[instrument(
        skip(self, route),
        fields(node = %route.target_node, cidr = %route.destination_cidr)
    )]
    pub async fn delete_route(&self, route: &Route) -> Result<()> {
        let (instance, iface) = self.target_interface(route).await?;
        if !iface.ranges.contains(&route.destination_cidr) {
            debug!("route already absent");
            return Ok(());
        }
        let ranges = iface
            .ranges
            .into_iter()
            .filter(|r| r != &route.destination_cidr)
            .collect();
        self.set_ranges(&instance, iface.target, ranges).await?;
        info!("Deleted route");
        Ok(())
    }

    /// Create a route for every IPv4 podCIDR lacking one and delete cluster routes no Node owns.
    /// Ranges outside the cluster CIDR were not placed by this controller and are left alone.
    pub async fn reconcile(&self) -> Result<()> {
        let nodes = self.cluster.list_nodes().await?;
        let routes = self.list_routes().await?;

        let wanted: BTreeMap<String, BTreeSet<String>> = nodes
            .iter()
            .map(|node| (node.name_any(), ipv4_pod_cidrs(node)))
            .collect();
        let existing: BTreeSet<Route> = routes.into_iter().collect();

        for (node, cidrs) in &wanted {
            for cidr in cidrs {
                let route = Route {
                    target_node: node.clone(),
                    destination_cidr: cidr.clone(),
                };
                if existing.contains(&route) {
                    continue;
                }
                if let Err(e) = self.create_route(&route).await {
                    warn!(node = %node, cidr = %cidr, error = %e, "Failed to create route");
                }
            }
        }

        for route in &existing {
            let owned = wanted
                .get(&route.target_node)
                .is_some_and(|cidrs| cidrs.contains(&route.destination_cidr));
            if owned {
                continue;
            }
            if !self.is_responsible_for(route) {
                debug!(
                    node = %route.target_node,
                    cidr = %route.destination_cidr,
                    "keeping range outside the cluster CIDR"
                );
                continue;
            }
            if let Err(e) = self.delete_route(route).await {
                warn!(
                    node = %route.target_node,
                    cidr = %route.destination_cidr,
                    error = %e,
                    "Failed to delete route"
                );
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        info!("Starting route controller");
        let mut ticker = tokio::time::interval(RECONCILE_PERIOD);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile().await {
                error!(error = %e, "Route reconciliation failed");
            }
        }
    }
}

fn ipv4_pod_cidrs(node: &Node) -> BTreeSet<String> {
    node.spec
        .as_ref()
        .and_then(|s| s.pod_cidrs.as_ref())
        .map(|cidrs| {
            cidrs
                .iter()
                .filter(|c| matches!(c.parse::<IpNet>(), Ok(IpNet::V4(_))))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}
