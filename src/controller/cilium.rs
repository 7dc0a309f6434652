//! Shared-IP load balancers advertised over BGP by Cilium
//!
//! Public IPs are allocated on an unbooted "IP holder" instance and shared
//! onto every BGP-selected node. Each Service gets a one-address
//! `CiliumLoadBalancerIPPool`. The intersection of the pools' addresses and
//! the holder's addresses is treated as the shared set on every operation, so
//! addresses removed out of band drop out on their own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::annotations::{self, parse_selector, selector_matches};
use crate::config::{Config, LoadBalancerType};
use crate::controller::instances::InstanceResolver;
use crate::controller::loadbalancer::{ingress_ips, service_key};
use crate::controller::retry::retry_on_conflict;
use crate::crd::{
    BGPCommunities, CiliumBGPNeighbor, CiliumBGPNeighborGracefulRestart, CiliumBGPPathAttributes,
    CiliumBGPPeeringPolicy, CiliumBGPPeeringPolicySpec, CiliumBGPVirtualRouter,
    CiliumLoadBalancerIPPool, CiliumLoadBalancerIPPoolIPBlock, CiliumLoadBalancerIPPoolSpec,
    SlimLabelSelector, SlimLabelSelectorRequirement,
};
use crate::error::{ignore_not_found, Error, Result};
use crate::k8s::ClusterClient;
use crate::linode::{Filter, Instance, InstanceCreateOptions, IpAddressesShareOptions, LinodeApi};

pub const PEERING_POLICY_NAME: &str = "linode-ccm-bgp-peering";
pub const IP_HOLDER_PREFIX: &str = "linode-ccm-ip-holder-";
const MAX_HOLDER_LABEL: usize = 63;
const LOCAL_ASN: i64 = 65001;
const PEER_ASN: i64 = 65000;
const NEIGHBOR_COUNT: u32 = 4;
const HOLDER_TYPE: &str = "g6-nanode-1";
const HOLDER_IMAGE: &str = "linode/ubuntu22.04";

/// Label of the IP holder for `region`; the suffix is truncated to fit 63 characters
pub fn ip_holder_label(region: &str, suffix: &str) -> String {
    let base = format!("{IP_HOLDER_PREFIX}{region}");
    if suffix.is_empty() {
        return base;
    }
    let room = MAX_HOLDER_LABEL.saturating_sub(base.len() + 1);
    let suffix: String = suffix.chars().take(room).collect();
    if suffix.is_empty() {
        base
    } else {
        format!("{base}-{suffix}")
    }
}

pub fn pool_name(service: &Service) -> String {
    format!(
        "{}-{}-pool",
        service.namespace().unwrap_or_else(|| "default".to_string()),
        service.name_any()
    )
}

/// Peering policy for the region with numeric `region_id`
pub fn peering_policy(
    region_id: u32,
    peer_prefix: &str,
    node_selector: Option<&str>,
) -> CiliumBGPPeeringPolicy {
    let neighbors = (1..=NEIGHBOR_COUNT)
        .map(|i| CiliumBGPNeighbor {
            peer_address: format!("{peer_prefix}:{region_id}:34::{i}/64"),
            peer_asn: PEER_ASN,
            ebgp_multihop_ttl: Some(10),
            connect_retry_time_seconds: Some(5),
            hold_time_seconds: Some(9),
            keep_alive_time_seconds: Some(3),
            graceful_restart: Some(CiliumBGPNeighborGracefulRestart {
                enabled: true,
                restart_time_seconds: Some(120),
            }),
            advertised_path_attributes: vec![CiliumBGPPathAttributes {
                selector_type: "CiliumLoadBalancerIPPool".to_string(),
                selector: Some(SlimLabelSelector::default()),
                communities: Some(BGPCommunities {
                    well_known: vec!["no-export".to_string()],
                    ..Default::default()
                }),
            }],
        })
        .collect();

    let node_selector = node_selector.map(|raw| SlimLabelSelector {
        match_labels: Some(parse_selector(raw)),
        ..Default::default()
    });

    let mut policy = CiliumBGPPeeringPolicy::new(
        PEERING_POLICY_NAME,
        CiliumBGPPeeringPolicySpec {
            node_selector,
            virtual_routers: vec![CiliumBGPVirtualRouter {
                local_asn: LOCAL_ASN,
                export_pod_cidr: false,
                service_selector: Some(SlimLabelSelector {
                    match_expressions: Some(vec![SlimLabelSelectorRequirement {
                        key: "somekey".to_string(),
                        operator: "NotIn".to_string(),
                        values: vec!["never-used-value".to_string()],
                    }]),
                    ..Default::default()
                }),
                neighbors,
            }],
        },
    );
    policy.metadata.labels = Some(managed_by());
    policy
}

fn managed_by() -> BTreeMap<String, String> {
    BTreeMap::from([(
        annotations::MANAGED_BY_LABEL.to_string(),
        annotations::MANAGED_BY_VALUE.to_string(),
    )])
}

fn ingress_status(addresses: &[String]) -> LoadBalancerStatus {
    LoadBalancerStatus {
        ingress: Some(
            addresses
                .iter()
                .map(|ip| LoadBalancerIngress {
                    ip: Some(ip.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

pub struct CiliumLoadBalancers {
    linode: Arc<dyn LinodeApi>,
    cluster: Arc<dyn ClusterClient>,
    config: Arc<Config>,
    instances: Arc<InstanceResolver>,
    /// Serializes holder allocation and sharing so concurrent Services see a consistent set
    sharing: Mutex<()>,
}

impl CiliumLoadBalancers {
    pub fn new(
        linode: Arc<dyn LinodeApi>,
        cluster: Arc<dyn ClusterClient>,
        config: Arc<Config>,
        instances: Arc<InstanceResolver>,
    ) -> Self {
        Self {
            linode,
            cluster,
            config,
            instances,
            sharing: Mutex::new(()),
        }
    }

    /// Nodes take part in BGP sharing only when the cluster is set up for it
    pub fn is_enabled(&self) -> bool {
        self.config.load_balancer_type == LoadBalancerType::CiliumBgp
            || self.config.bgp_node_selector.is_some()
    }

    /// A selected Node that has not received the shared address list yet
    pub fn needs_sharing(&self, node: &Node) -> bool {
        self.is_enabled()
            && self.selects(&node.metadata)
            && annotations::label(&node.metadata, annotations::NODE_IP_SHARING_UPDATED)
                != Some("true")
    }

    fn selects(&self, meta: &ObjectMeta) -> bool {
        match self.config.bgp_node_selector.as_deref() {
            Some(raw) => selector_matches(&parse_selector(raw), meta),
            None => true,
        }
    }

    fn region_id(&self) -> Result<u32> {
        self.config
            .region_id(&self.config.region)
            .ok_or_else(|| Error::UnsupportedRegion(self.config.region.clone()))
    }

    async fn ensure_peering_policy(&self) -> Result<()> {
        let region_id = self.region_id()?;
        if self.cluster.get_peering_policy(PEERING_POLICY_NAME).await?.is_some() {
            return Ok(());
        }
        let policy = peering_policy(
            region_id,
            &self.config.bgp_peer_prefix,
            self.config.bgp_node_selector.as_deref(),
        );
        info!(name = PEERING_POLICY_NAME, region_id, "creating BGP peering policy");
        self.cluster.create_peering_policy(&policy).await
    }

    /// Holder for this region, adopting one with the legacy label
    async fn find_ip_holder(&self) -> Result<Option<Instance>> {
        let label = ip_holder_label(&self.config.region, &self.config.ip_holder_suffix);
        let found = self
            .linode
            .list_instances(Some(&Filter::by_label(&label)))
            .await?;
        if let Some(holder) = found.into_iter().next() {
            return Ok(Some(holder));
        }
        if self.config.ip_holder_suffix.is_empty() {
            return Ok(None);
        }
        let legacy = ip_holder_label(&self.config.region, "");
        let found = self
            .linode
            .list_instances(Some(&Filter::by_label(&legacy)))
            .await?;
        if let Some(holder) = found.into_iter().next() {
            info!(holder = holder.id, label = %legacy, "adopting IP holder with legacy label");
            return Ok(Some(holder));
        }
        Ok(None)
    }

    async fn ensure_ip_holder(&self) -> Result<Instance> {
        if let Some(holder) = self.find_ip_holder().await? {
            return Ok(holder);
        }
        let label = ip_holder_label(&self.config.region, &self.config.ip_holder_suffix);
        let holder = self
            .linode
            .create_instance(&InstanceCreateOptions {
                region: self.config.region.clone(),
                type_: HOLDER_TYPE.to_string(),
                label: label.clone(),
                image: Some(HOLDER_IMAGE.to_string()),
                root_pass: Some(random_password()),
                booted: Some(false),
                tags: vec![self.config.cluster_name.clone()],
            })
            .await?;
        info!(holder = holder.id, label = %label, "created IP holder");
        Ok(holder)
    }

    /// Pool addresses that are still present on the holder
    async fn shared_addresses(
        &self,
        holder: &Instance,
        extra: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut in_cluster: BTreeSet<String> = self
            .cluster
            .list_ip_pools()
            .await?
            .iter()
            .flat_map(|pool| pool.addresses())
            .collect();
        in_cluster.extend(extra.map(str::to_string));

        let on_holder: BTreeSet<String> = self
            .linode
            .get_instance_ip_addresses(holder.id)
            .await?
            .ipv4
            .public
            .into_iter()
            .map(|ip| ip.address)
            .collect();

        Ok(in_cluster.intersection(&on_holder).cloned().collect())
    }

    async fn share_onto(&self, node: &Node, addresses: &[String]) -> Result<()> {
        let instance = self.instances.lookup(node).await?;
        self.linode
            .share_ip_addresses(&IpAddressesShareOptions {
                ips: addresses.to_vec(),
                linode_id: instance.id,
            })
            .await?;
        let name = node.name_any();
        let patch = json!({
            "metadata": { "labels": { annotations::NODE_IP_SHARING_UPDATED: "true" } }
        });
        retry_on_conflict("label node ip sharing", || {
            self.cluster.patch_node(&name, &patch)
        })
        .await?;
        debug!(node = %name, count = addresses.len(), "shared IPs onto node");
        Ok(())
    }

    pub async fn has_pool(&self, service: &Service) -> Result<bool> {
        Ok(self.cluster.get_ip_pool(&pool_name(service)).await?.is_some())
    }

    pub async fn get_status(&self, service: &Service) -> Result<Option<LoadBalancerStatus>> {
        Ok(self
            .cluster
            .get_ip_pool(&pool_name(service))
            .await?
            .map(|pool| ingress_status(&pool.addresses())))
    }

    #[instrument(skip(self, service, nodes), fields(service = %service_key(service)))]
    pub async fn ensure(&self, service: &Service, nodes: &[Node]) -> Result<LoadBalancerStatus> {
        self.ensure_peering_policy().await?;

        let name = pool_name(service);
        if let Some(pool) = self.cluster.get_ip_pool(&name).await? {
            debug!(pool = %name, "IP pool already exists");
            return Ok(ingress_status(&pool.addresses()));
        }

        let _guard = self.sharing.lock().await;
        let holder = self.ensure_ip_holder().await?;
        let new_ip = self.linode.add_instance_ip_address(holder.id, true).await?;
        info!(holder = holder.id, ip = %new_ip.address, "allocated shared IP");

        // an address that never reaches a pool is invisible to later intersections
        if let Err(e) = self.publish(service, &name, &holder, &new_ip.address, nodes).await {
            warn!(
                holder = holder.id,
                ip = %new_ip.address,
                error = %e,
                "releasing unpublished IP"
            );
            let released = self
                .linode
                .delete_instance_ip_address(holder.id, &new_ip.address)
                .await
                .map_err(Error::from);
            if let Err(release) = ignore_not_found(released) {
                error!(
                    holder = holder.id,
                    ip = %new_ip.address,
                    error = %release,
                    "could not release IP"
                );
            }
            return Err(e);
        }
        Ok(ingress_status(&[new_ip.address]))
    }

    /// Share `address` onto the selected nodes and record it in the Service's pool
    async fn publish(
        &self,
        service: &Service,
        name: &str,
        holder: &Instance,
        address: &str,
        nodes: &[Node],
    ) -> Result<()> {
        let shared = self.shared_addresses(holder, Some(address)).await?;
        for node in nodes.iter().filter(|n| self.selects(&n.metadata)) {
            self.share_onto(node, &shared).await?;
        }

        let mut pool = CiliumLoadBalancerIPPool::new(
            name,
            CiliumLoadBalancerIPPoolSpec {
                blocks: vec![CiliumLoadBalancerIPPoolIPBlock {
                    cidr: Some(format!("{address}/32")),
                }],
                service_selector: Some(SlimLabelSelector {
                    match_labels: Some(BTreeMap::from([
                        (
                            annotations::SERVICE_NAMESPACE_LABEL.to_string(),
                            service.namespace().unwrap_or_else(|| "default".to_string()),
                        ),
                        (annotations::SERVICE_NAME_LABEL.to_string(), service.name_any()),
                    ])),
                    ..Default::default()
                }),
                disabled: false,
            },
        );
        pool.metadata.labels = Some(managed_by());
        self.cluster.create_ip_pool(&pool).await?;
        info!(pool = %name, ip = %address, "created IP pool");
        Ok(())
    }

    /// Share the current address set onto a node that joined after the pools were made
    #[instrument(skip(self, node), fields(node = %node.name_any()))]
    pub async fn update_node(&self, node: &Node) -> Result<()> {
        if !self.selects(&node.metadata) {
            return Ok(());
        }
        let updated = annotations::label(&node.metadata, annotations::NODE_IP_SHARING_UPDATED);
        if updated == Some("true") {
            return Ok(());
        }
        if self.cluster.list_ip_pools().await?.is_empty() {
            debug!("no IP pools, nothing to share");
            return Ok(());
        }
        let _guard = self.sharing.lock().await;
        let Some(holder) = self.find_ip_holder().await? else {
            debug!("no IP holder yet, nothing to share");
            return Ok(());
        };
        let shared = self.shared_addresses(&holder, None).await?;
        if shared.is_empty() {
            return Ok(());
        }
        self.share_onto(node, &shared).await
    }

    #[instrument(skip(self, service), fields(service = %service_key(service)))]
    pub async fn ensure_deleted(&self, service: &Service) -> Result<()> {
        let name = pool_name(service);
        let mut addresses: BTreeSet<String> = ingress_ips(service).into_iter().collect();
        if let Some(pool) = self.cluster.get_ip_pool(&name).await? {
            addresses.extend(pool.addresses());
        }

        if !addresses.is_empty() {
            let _guard = self.sharing.lock().await;
            for node in self
                .cluster
                .list_nodes()
                .await?
                .iter()
                .filter(|n| self.selects(&n.metadata))
            {
                let instance = match self.instances.lookup(node).await {
                    Ok(instance) => instance,
                    Err(Error::InstanceNotFound(name)) => {
                        warn!(node = %name, "no Linode for node, skipping IP removal");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                for ip in &addresses {
                    ignore_not_found(
                        self.linode
                            .delete_instance_ip_address(instance.id, ip)
                            .await
                            .map_err(Error::from),
                    )?;
                }
            }
            if let Some(holder) = self.find_ip_holder().await? {
                for ip in &addresses {
                    info!(holder = holder.id, ip = %ip, "releasing shared IP");
                    ignore_not_found(
                        self.linode
                            .delete_instance_ip_address(holder.id, ip)
                            .await
                            .map_err(Error::from),
                    )?;
                }
            }
        }

        self.cluster.delete_ip_pool(&name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config_with;
    use crate::k8s::fake::FakeCluster;
    use crate::linode::fake::FakeLinode;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use std::time::Duration;

    fn node(name: &str, bgp: bool) -> Node {
        let mut labels = BTreeMap::new();
        if bgp {
            labels.insert("cilium-bgp-peering".to_string(), "true".to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                load_balancer_class: Some(annotations::CILIUM_LB_CLASS.to_string()),
                ..Default::default()
            }),
            status: None,
        }
    }

    struct Harness {
        linode: Arc<FakeLinode>,
        cluster: Arc<FakeCluster>,
        lb: CiliumLoadBalancers,
        nodes: Vec<Node>,
    }

    fn harness(extra: &[&str]) -> Harness {
        let linode = Arc::new(FakeLinode::new());
        let cluster = Arc::new(FakeCluster::new());
        linode.add_instance(1, "n1", "203.0.113.1", None);
        linode.add_instance(2, "n2", "203.0.113.2", None);
        linode.add_instance(3, "n3", "203.0.113.3", None);
        let nodes = vec![node("n1", true), node("n2", true), node("n3", false)];
        for n in &nodes {
            cluster.add_node(n.clone());
        }
        let mut args = vec!["--bgp-node-selector", "cilium-bgp-peering=true"];
        args.extend_from_slice(extra);
        let config = Arc::new(test_config_with(&args));
        let instances = Arc::new(InstanceResolver::new(linode.clone(), Duration::from_secs(900)));
        let lb = CiliumLoadBalancers::new(linode.clone(), cluster.clone(), config, instances);
        Harness {
            linode,
            cluster,
            lb,
            nodes,
        }
    }

    #[test]
    fn test_holder_labels() {
        assert_eq!(ip_holder_label("us-ord", ""), "linode-ccm-ip-holder-us-ord");
        assert_eq!(
            ip_holder_label("us-ord", "blue"),
            "linode-ccm-ip-holder-us-ord-blue"
        );
        assert_eq!(ip_holder_label("us-ord", &"s".repeat(100)).len(), 63);
    }

    #[test]
    fn test_peering_policy_neighbors() {
        let policy = peering_policy(18, "2600:3c0f", Some("cilium-bgp-peering=true"));
        let router = &policy.spec.virtual_routers[0];
        assert_eq!(router.local_asn, 65001);
        let addresses: Vec<&str> = router
            .neighbors
            .iter()
            .map(|n| n.peer_address.as_str())
            .collect();
        assert_eq!(
            addresses,
            vec![
                "2600:3c0f:18:34::1/64",
                "2600:3c0f:18:34::2/64",
                "2600:3c0f:18:34::3/64",
                "2600:3c0f:18:34::4/64",
            ]
        );
        assert!(router.neighbors.iter().all(|n| n.peer_asn == 65000));
    }

    #[tokio::test]
    async fn test_shared_ip_creation() {
        let h = harness(&[]);
        let status = h.lb.ensure(&service(), &h.nodes).await.unwrap();
        let ip = status.ingress.unwrap()[0].ip.clone().unwrap();

        let calls = h.linode.calls();
        assert_eq!(calls[0], "CreateInstance label=linode-ccm-ip-holder-us-ord");
        assert!(calls[1].starts_with("AddInstanceIPAddress"));
        assert_eq!(
            &calls[2..],
            [
                format!("ShareIPAddresses linode=1 ips={ip}"),
                format!("ShareIPAddresses linode=2 ips={ip}"),
            ]
        );

        let pool = h.cluster.with(|s| s.pools.get("default-web-pool").cloned()).unwrap();
        assert_eq!(pool.spec.blocks[0].cidr, Some(format!("{ip}/32")));
        let selector = pool.spec.service_selector.unwrap().match_labels.unwrap();
        assert_eq!(selector[annotations::SERVICE_NAME_LABEL], "web");

        let policy = h.cluster.with(|s| s.policies.get(PEERING_POLICY_NAME).cloned());
        assert_eq!(
            policy.unwrap().spec.virtual_routers[0].neighbors[0].peer_address,
            "2600:3c0f:18:34::1/64"
        );
        let labelled = h.cluster.node("n1").unwrap();
        assert_eq!(
            annotations::label(&labelled.metadata, annotations::NODE_IP_SHARING_UPDATED),
            Some("true")
        );
        assert!(annotations::label(
            &h.cluster.node("n3").unwrap().metadata,
            annotations::NODE_IP_SHARING_UPDATED
        )
        .is_none());

        h.linode.clear_calls();
        h.lb.ensure(&service(), &h.nodes).await.unwrap();
        assert!(h.linode.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_region() {
        let h = harness(&["--bgp-custom-id-map", r#"{"us-foobar": 2}"#]);
        assert!(matches!(
            h.lb.ensure(&service(), &h.nodes).await,
            Err(Error::UnsupportedRegion(_))
        ));
    }

    #[tokio::test]
    async fn test_legacy_holder_is_adopted() {
        let h = harness(&["--ip-holder-suffix", "blue"]);
        h.linode
            .add_instance(50, "linode-ccm-ip-holder-us-ord", "203.0.113.50", None);
        h.lb.ensure(&service(), &h.nodes).await.unwrap();
        assert!(h.linode.calls()[0].starts_with("AddInstanceIPAddress id=50"));
    }

    #[tokio::test]
    async fn test_external_removal_drops_address() {
        let h = harness(&[]);
        let first = h.lb.ensure(&service(), &h.nodes).await.unwrap();
        let first_ip = first.ingress.unwrap()[0].ip.clone().unwrap();
        let holder = h.lb.find_ip_holder().await.unwrap().unwrap();
        h.linode.with(|s| {
            s.instance_ips
                .get_mut(&holder.id)
                .unwrap()
                .ipv4
                .public
                .retain(|ip| ip.address != first_ip)
        });

        let mut other = service();
        other.metadata.name = Some("api".to_string());
        h.linode.clear_calls();
        let second = h.lb.ensure(&other, &h.nodes).await.unwrap();
        let second_ip = second.ingress.unwrap()[0].ip.clone().unwrap();
        assert!(h
            .linode
            .calls()
            .contains(&format!("ShareIPAddresses linode=1 ips={second_ip}")));
    }

    #[tokio::test]
    async fn test_failed_share_releases_new_ip() {
        let h = harness(&[]);
        h.linode.fail_next("ShareIPAddresses", 500);
        assert!(h.lb.ensure(&service(), &h.nodes).await.is_err());

        let holder = h.lb.find_ip_holder().await.unwrap().unwrap();
        let calls = h.linode.calls();
        assert!(calls
            .last()
            .unwrap()
            .starts_with(&format!("DeleteInstanceIPAddress id={}", holder.id)));
        assert!(h.cluster.with(|s| s.pools.is_empty()));
        let on_holder = h.linode.with(|s| s.instance_ips[&holder.id].ipv4.public.len());
        assert_eq!(on_holder, 0);

        // the retry allocates one address and keeps it
        h.lb.ensure(&service(), &h.nodes).await.unwrap();
        let on_holder = h.linode.with(|s| s.instance_ips[&holder.id].ipv4.public.len());
        assert_eq!(on_holder, 1);
    }

    #[tokio::test]
    async fn test_nodebalancer_mode_never_needs_sharing() {
        let linode = Arc::new(FakeLinode::new());
        let cluster = Arc::new(FakeCluster::new());
        let instances = Arc::new(InstanceResolver::new(linode.clone(), Duration::from_secs(900)));
        let lb = CiliumLoadBalancers::new(
            linode,
            cluster,
            Arc::new(test_config_with(&[])),
            instances,
        );
        assert!(!lb.is_enabled());
        assert!(!lb.needs_sharing(&node("n1", true)));

        let h = harness(&[]);
        assert!(h.lb.needs_sharing(&node("n1", true)));
        assert!(!h.lb.needs_sharing(&node("n3", false)));
    }

    #[tokio::test]
    async fn test_node_catch_up_and_delete() {
        let h = harness(&[]);
        let mut svc = service();
        let status = h.lb.ensure(&svc, &h.nodes[..1]).await.unwrap();
        let ip = status.ingress.as_ref().unwrap()[0].ip.clone().unwrap();

        h.linode.clear_calls();
        let n2 = h.cluster.node("n2").unwrap();
        h.lb.update_node(&n2).await.unwrap();
        assert_eq!(h.linode.calls(), vec![format!("ShareIPAddresses linode=2 ips={ip}")]);

        h.linode.clear_calls();
        let labelled = h.cluster.node("n2").unwrap();
        h.lb.update_node(&labelled).await.unwrap();
        assert!(h.linode.calls().is_empty());

        svc.status = Some(k8s_openapi::api::core::v1::ServiceStatus {
            load_balancer: Some(status),
            ..Default::default()
        });
        h.lb.ensure_deleted(&svc).await.unwrap();
        let calls = h.linode.calls();
        assert!(calls.contains(&format!("DeleteInstanceIPAddress id=1 ip={ip}")));
        assert!(calls.contains(&format!("DeleteInstanceIPAddress id=2 ip={ip}")));
        assert!(h.cluster.with(|s| s.pools.is_empty()));

        h.lb.ensure_deleted(&svc).await.unwrap();
    }
}
