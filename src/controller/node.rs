//! Node watcher: keeps Linode metadata on Nodes, per-node firewalls, and BGP IP sharing

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::Api,
    client::Client,
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::annotations;
use crate::controller::cilium::CiliumLoadBalancers;
use crate::controller::firewall::{FirewallReconciler, FirewallTarget};
use crate::controller::instances::InstanceResolver;
use crate::controller::queue::WorkQueue;
use crate::controller::retry::retry_on_conflict;
use crate::error::{is_retryable, Result};
use crate::k8s::ClusterClient;
use crate::linode::LinodeApi;

/// A queued pass over one Node
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeWork {
    pub name: String,
    pub added: Instant,
    /// Bypass the metadata TTL
    pub force: bool,
}

type FirewallAnnotations = (Option<String>, Option<String>);

fn firewall_annotations(node: &Node) -> FirewallAnnotations {
    let get = |key| annotations::get(&node.metadata, key).map(str::to_string);
    (
        get(annotations::NODE_FIREWALL_ID),
        get(annotations::NODE_FIREWALL_ACL),
    )
}

/// What a Node looked like the last time the watcher reported it
#[derive(Clone, Debug, PartialEq, Eq)]
struct Observed {
    firewall: FirewallAnnotations,
    needs_sharing: bool,
}

#[derive(Default)]
struct Tracking {
    seen: HashMap<String, Observed>,
    /// Time of the newest enqueue per Node
    last_added: HashMap<String, Instant>,
    /// Time of the last completed pass per Node
    last_processed: HashMap<String, Instant>,
}

pub struct NodeController {
    cluster: Arc<dyn ClusterClient>,
    instances: Arc<InstanceResolver>,
    firewalls: FirewallReconciler,
    cilium: Arc<CiliumLoadBalancers>,
    queue: WorkQueue<NodeWork>,
    tracking: Mutex<Tracking>,
    metadata_ttl: Duration,
    retry_interval: Duration,
}

impl NodeController {
    pub fn new(
        linode: Arc<dyn LinodeApi>,
        cluster: Arc<dyn ClusterClient>,
        instances: Arc<InstanceResolver>,
        cilium: Arc<CiliumLoadBalancers>,
        cluster_name: &str,
        metadata_ttl: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            instances,
            firewalls: FirewallReconciler::new(linode, cluster_name),
            cilium,
            queue: WorkQueue::new(),
            tracking: Mutex::new(Tracking::default()),
            metadata_ttl,
            retry_interval,
        }
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, name: String, force: bool) {
        let added = Instant::now();
        self.tracking().last_added.insert(name.clone(), added);
        self.queue.add(NodeWork { name, added, force });
    }

    /// Queue a pass when the Node is new, its firewall annotations changed, or
    /// its labels just brought it into the BGP selection
    pub fn observe(&self, node: &Node) {
        let name = node.name_any();
        let current = Observed {
            firewall: firewall_annotations(node),
            needs_sharing: self.cilium.needs_sharing(node),
        };
        let previous = self.tracking().seen.insert(name.clone(), current.clone());
        match previous {
            None => self.enqueue(name, false),
            Some(previous) if previous.firewall != current.firewall => {
                debug!(node = %name, "firewall annotations changed");
                self.enqueue(name, true)
            }
            Some(previous) if current.needs_sharing && !previous.needs_sharing => {
                debug!(node = %name, "node joined the BGP selection");
                self.enqueue(name, true)
            }
            Some(_) => {}
        }
    }

    pub fn forget(&self, node: &Node) {
        let name = node.name_any();
        let mut tracking = self.tracking();
        tracking.seen.remove(&name);
        tracking.last_added.remove(&name);
        tracking.last_processed.remove(&name);
    }

    fn is_stale(&self, work: &NodeWork) -> bool {
        self.tracking()
            .last_added
            .get(&work.name)
            .map(|latest| *latest > work.added)
            .unwrap_or(false)
    }

    fn recently_processed(&self, name: &str) -> bool {
        self.tracking()
            .last_processed
            .get(name)
            .map(|at| at.elapsed() < self.metadata_ttl)
            .unwrap_or(false)
    }

    /// Bring the Node's host-uuid label and private-ip annotation in line with its Linode
    async fn refresh_metadata(
        &self,
        node: &Node,
        host_uuid: &str,
        private_ip: Option<&str>,
    ) -> Result<()> {
        let name = node.name_any();
        let mut labels = Map::new();
        if !host_uuid.is_empty()
            && annotations::label(&node.metadata, annotations::NODE_HOST_UUID) != Some(host_uuid)
        {
            labels.insert(annotations::NODE_HOST_UUID.to_string(), Value::from(host_uuid));
        }
        let mut node_annotations = Map::new();
        if let Some(ip) = private_ip {
            if annotations::get(&node.metadata, annotations::NODE_PRIVATE_IP) != Some(ip) {
                node_annotations.insert(annotations::NODE_PRIVATE_IP.to_string(), Value::from(ip));
            }
        }
        if labels.is_empty() && node_annotations.is_empty() {
            debug!(node = %name, "node metadata up to date");
            return Ok(());
        }

        let mut metadata = Map::new();
        if !labels.is_empty() {
            metadata.insert("labels".to_string(), Value::Object(labels));
        }
        if !node_annotations.is_empty() {
            metadata.insert("annotations".to_string(), Value::Object(node_annotations));
        }
        let patch = json!({ "metadata": metadata });
        retry_on_conflict("patch node metadata", || {
            self.cluster.patch_node(&name, &patch)
        })
        .await?;
        info!(node = %name, "updated node metadata");
        Ok(())
    }

    #[instrument(skip(self, work), fields(node = %work.name))]
    async fn process(&self, work: &NodeWork) -> Result<()> {
        if self.is_stale(work) {
            debug!("discarding stale work item");
            return Ok(());
        }
        if !work.force && self.recently_processed(&work.name) {
            debug!("node processed within metadata TTL, skipping");
            return Ok(());
        }
        let Some(node) = self.cluster.get_node(&work.name).await? else {
            debug!("node is gone");
            return Ok(());
        };

        let instance = self.instances.lookup(&node).await?;
        let private_ip = self.instances.private_ipv4(&instance).await?;
        self.refresh_metadata(&node, &instance.host_uuid, private_ip.as_deref())
            .await?;

        let target = FirewallTarget::linode(instance.id, &work.name, &node.metadata);
        self.firewalls.reconcile(&target).await?;

        if self.cilium.is_enabled() {
            self.cilium.update_node(&node).await?;
        }

        self.tracking()
            .last_processed
            .insert(work.name.clone(), Instant::now());
        Ok(())
    }

    /// Handle one queued item. Returns false once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(work) = self.queue.get().await else {
            return false;
        };
        let started = Instant::now();
        let result = self.process(&work).await;
        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile("node", started.elapsed().as_secs_f64(), &result);
        match result {
            Ok(()) => debug!(node = %work.name, elapsed = ?started.elapsed(), "node processed"),
            Err(e) if is_retryable(&e) => {
                warn!(
                    node = %work.name,
                    error = %e,
                    retry_in = ?self.retry_interval,
                    "node processing failed, rescheduling"
                );
                self.queue.add_after(work.clone(), self.retry_interval);
            }
            Err(e) => error!(node = %work.name, error = %e, "node processing failed, dropping"),
        }
        self.queue.done(&work);
        true
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub async fn run(self: Arc<Self>, client: Client) {
        let api: Api<Node> = Api::all(client);
        let worker = {
            let this = self.clone();
            tokio::spawn(async move { while this.process_next().await {} })
        };

        info!("Starting Node controller");
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        while let Some(event) = events.next().await {
            match event {
                Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                    self.observe(&node)
                }
                Ok(watcher::Event::Delete(node)) => self.forget(&node),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Node watch failed"),
            }
        }

        self.shut_down();
        let _ = worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config_with;
    use crate::crd::{
        CiliumLoadBalancerIPPool, CiliumLoadBalancerIPPoolIPBlock, CiliumLoadBalancerIPPoolSpec,
    };
    use crate::k8s::fake::FakeCluster;
    use crate::linode::fake::FakeLinode;
    use k8s_openapi::api::core::v1::NodeSpec;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    struct Harness {
        linode: Arc<FakeLinode>,
        cluster: Arc<FakeCluster>,
        controller: NodeController,
    }

    fn harness(ttl: Duration) -> Harness {
        harness_with(ttl, &[])
    }

    fn harness_with(ttl: Duration, args: &[&str]) -> Harness {
        let linode = Arc::new(FakeLinode::new());
        let cluster = Arc::new(FakeCluster::new());
        linode.add_instance(111, "n1", "203.0.113.1", Some("192.168.128.5"));
        cluster.add_node(node(&[]));
        let instances = Arc::new(InstanceResolver::new(linode.clone(), Duration::from_secs(900)));
        let cilium = Arc::new(CiliumLoadBalancers::new(
            linode.clone(),
            cluster.clone(),
            Arc::new(test_config_with(args)),
            instances.clone(),
        ));
        let controller = NodeController::new(
            linode.clone(),
            cluster.clone(),
            instances,
            cilium,
            "linodelb",
            ttl,
            Duration::from_secs(60),
        );
        Harness {
            linode,
            cluster,
            controller,
        }
    }

    fn node(pairs: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                annotations: Some(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some("linode://111".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_metadata_is_refreshed_once() {
        let h = harness(Duration::from_secs(300));
        h.controller.observe(&node(&[]));
        assert!(h.controller.process_next().await);

        let updated = h.cluster.node("n1").unwrap();
        assert_eq!(
            annotations::label(&updated.metadata, annotations::NODE_HOST_UUID),
            Some("host-111")
        );
        assert_eq!(
            annotations::get(&updated.metadata, annotations::NODE_PRIVATE_IP),
            Some("192.168.128.5")
        );
        assert_eq!(h.cluster.with(|s| s.node_patches.len()), 1);

        // unchanged annotations do not requeue
        h.controller.observe(&node(&[]));
        assert!(h.controller.queue.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_suppresses_unforced_work() {
        let h = harness(Duration::from_secs(300));
        h.controller.observe(&node(&[]));
        assert!(h.controller.process_next().await);
        h.cluster.with(|s| s.node_patches.clear());

        h.controller.enqueue("n1".to_string(), false);
        assert!(h.controller.process_next().await);
        assert!(h.cluster.with(|s| s.node_patches.is_empty()));
        assert!(h.linode.calls().is_empty());
    }

    #[tokio::test]
    async fn test_firewall_annotation_change_forces_pass() {
        let h = harness(Duration::from_secs(300));
        h.controller.observe(&node(&[]));
        assert!(h.controller.process_next().await);

        let acl = r#"{"allowList":{"ipv4":["10.0.0.0/8"]}}"#;
        let annotated = node(&[(annotations::NODE_FIREWALL_ACL, acl)]);
        h.cluster.add_node(annotated.clone());
        h.controller.observe(&annotated);
        assert!(h.controller.process_next().await);

        let calls = h.linode.calls();
        assert!(calls[0].starts_with("CreateFirewall label="), "{calls:?}");
    }

    #[tokio::test]
    async fn test_nodebalancer_mode_skips_ip_sharing() {
        let h = harness(Duration::from_secs(300));
        h.linode.fail_next("ListInstances", 500);
        h.controller.observe(&node(&[]));
        assert!(h.controller.process_next().await);

        assert!(h.controller.queue.is_empty());
        assert!(h.linode.with(|s| s.failures.contains_key("ListInstances")));
    }

    #[tokio::test]
    async fn test_bgp_label_change_shares_ips() {
        let h = harness_with(
            Duration::from_secs(300),
            &["--bgp-node-selector", "cilium-bgp-peering=true"],
        );
        h.linode
            .add_instance(50, "linode-ccm-ip-holder-us-ord", "203.0.113.50", None);
        h.cluster.with(|s| {
            s.pools.insert(
                "default-web-pool".to_string(),
                CiliumLoadBalancerIPPool::new(
                    "default-web-pool",
                    CiliumLoadBalancerIPPoolSpec {
                        blocks: vec![CiliumLoadBalancerIPPoolIPBlock {
                            cidr: Some("203.0.113.50/32".to_string()),
                        }],
                        service_selector: None,
                        disabled: false,
                    },
                ),
            )
        });

        h.controller.observe(&node(&[]));
        assert!(h.controller.process_next().await);
        assert!(h.linode.calls().is_empty());

        let mut labelled = h.cluster.node("n1").unwrap();
        labelled.metadata.labels.get_or_insert_with(BTreeMap::new).insert(
            "cilium-bgp-peering".to_string(),
            "true".to_string(),
        );
        h.cluster.add_node(labelled.clone());
        h.controller.observe(&labelled);
        assert_eq!(h.controller.queue.len(), 1);
        assert!(h.controller.process_next().await);
        assert_eq!(
            h.linode.calls(),
            vec!["ShareIPAddresses linode=111 ips=203.0.113.50"]
        );

        // the sharing label takes it out of the selection's pending set
        let shared = h.cluster.node("n1").unwrap();
        h.controller.observe(&shared);
        assert!(h.controller.queue.is_empty());
    }

    #[tokio::test]
    async fn test_stale_items_are_discarded() {
        let h = harness(Duration::ZERO);
        let stale = NodeWork {
            name: "n1".to_string(),
            added: Instant::now() - Duration::from_millis(10),
            force: true,
        };
        h.controller.enqueue("n1".to_string(), true);
        h.controller.queue.add(stale.clone());

        assert!(h.controller.is_stale(&stale));
        assert!(h.controller.process_next().await);
        assert!(h.controller.process_next().await);
        assert_eq!(h.cluster.with(|s| s.node_patches.len()), 1);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_dropped() {
        let h = harness(Duration::from_secs(300));
        let mut missing = node(&[]);
        missing.metadata.name = Some("n9".to_string());
        if let Some(spec) = missing.spec.as_mut() {
            spec.provider_id = Some("linode://999".to_string());
        }
        h.cluster.add_node(missing.clone());
        h.controller.observe(&missing);
        assert!(h.controller.process_next().await);
        assert!(h.controller.queue.is_empty());
    }
}
