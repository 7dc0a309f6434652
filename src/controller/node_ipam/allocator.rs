//! Assigns pod CIDRs to Nodes that have none

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::Api,
    client::Client,
    runtime::{watcher, WatchStreamExt},
    Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::cidr_set::CidrSet;
use crate::config::Config;
use crate::controller::queue::WorkQueue;
use crate::controller::retry::{retry_if, Backoff};
use crate::error::{Error, Result};
use crate::k8s::{ClusterClient, EventRecord};

const PATCH_BACKOFF_BASE: Duration = Duration::from_millis(100);
const PATCH_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// `spec.podCIDRs`, falling back to `spec.podCIDR`
fn pod_cidrs(node: &Node) -> Vec<String> {
    let spec = node.spec.as_ref();
    let cidrs = spec
        .and_then(|s| s.pod_cidrs.clone())
        .filter(|c| !c.is_empty())
        .or_else(|| spec.and_then(|s| s.pod_cidr.clone()).map(|c| vec![c]));
    cidrs.unwrap_or_default()
}

fn ipv4_pod_cidr(node: &Node) -> Result<Option<Ipv4Net>> {
    for raw in pod_cidrs(node) {
        let cidr: IpNet = raw.parse().map_err(|_| {
            Error::ValidationError(format!(
                "node {} has malformed podCIDR {raw}",
                node.name_any()
            ))
        })?;
        if let IpNet::V4(v4) = cidr {
            return Ok(Some(v4));
        }
    }
    Ok(None)
}

fn external_ipv4(node: &Node) -> Option<Ipv4Addr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .filter(|a| a.type_ == "ExternalIP")
        .find_map(|a| match a.address.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Some(ip),
            _ => None,
        })
}

/// `fd00::<ipv4 as two hextets>:0/112`.
///
/// Only unique while public IPv4 addresses are; replace once a real IPv6
/// allocator exists.
pub fn derive_ipv6(ip: Ipv4Addr) -> Ipv6Net {
    let [a, b, c, d] = ip.octets();
    let hi = u16::from_be_bytes([a, b]);
    let lo = u16::from_be_bytes([c, d]);
    let addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, hi, lo, 0);
    // 112 is a valid prefix length
    Ipv6Net::new(addr, 112).unwrap_or_default()
}

/// The bitmap and the Node each block was handed to
struct Blocks {
    set: CidrSet,
    owners: BTreeMap<String, Ipv4Net>,
}

impl Blocks {
    fn release_owned(&mut self, name: &str) -> Option<Result<Ipv4Net>> {
        let cidr = self.owners.remove(name)?;
        Some(self.set.release(&cidr).map(|()| cidr))
    }
}

pub struct CidrAllocator {
    cluster: Arc<dyn ClusterClient>,
    blocks: Mutex<Blocks>,
    queue: WorkQueue<String>,
    retries: u32,
}

impl CidrAllocator {
    /// Build the bitmap and seed it from the Nodes that already carry CIDRs
    pub async fn init(cluster: Arc<dyn ClusterClient>, config: &Config) -> Result<Self> {
        let cluster_cidr = config.cluster_cidr.ok_or_else(|| {
            Error::ConfigError("--allocate-node-cidrs requires --cluster-cidr".to_string())
        })?;
        let mut set = CidrSet::new(cluster_cidr, config.node_cidr_mask_size_ipv4)?;

        for service in [config.service_cidr, config.secondary_service_cidr]
            .into_iter()
            .flatten()
        {
            let reserved = set.reserve(&service);
            debug!(cidr = %service, reserved, "Reserved service CIDR");
        }

        let mut owners = BTreeMap::new();
        for node in cluster.list_nodes().await? {
            if let Some(cidr) = ipv4_pod_cidr(&node)? {
                set.occupy(&cidr)?;
                debug!(node = %node.name_any(), %cidr, "Marked pod CIDR as occupied");
                owners.insert(node.name_any(), cidr);
            }
        }
        info!(
            cluster_cidr = %cluster_cidr,
            mask = config.node_cidr_mask_size_ipv4,
            occupied = set.allocated(),
            "Node CIDR allocator initialized"
        );

        Ok(Self {
            cluster,
            blocks: Mutex::new(Blocks { set, owners }),
            queue: WorkQueue::new(),
            retries: config.cidr_update_retries,
        })
    }

    fn blocks(&self) -> MutexGuard<'_, Blocks> {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue Nodes without CIDRs; record the block of Nodes that have one
    pub fn on_apply(&self, node: &Node) {
        let name = node.name_any();
        match ipv4_pod_cidr(node) {
            Ok(Some(cidr)) => {
                let mut blocks = self.blocks();
                if let Err(e) = blocks.set.occupy(&cidr) {
                    warn!(node = %name, error = %e, "Pod CIDR is not tracked");
                    return;
                }
                blocks.owners.insert(name, cidr);
            }
            Ok(None) if pod_cidrs(node).is_empty() => self.queue.add(name),
            Ok(None) => {}
            Err(e) => warn!(node = %name, error = %e, "Ignoring node"),
        }
    }

    fn release(&self, name: &str) {
        let released = self.blocks().release_owned(name);
        match released {
            Some(Ok(cidr)) => info!(node = %name, %cidr, "Released pod CIDR"),
            Some(Err(e)) => warn!(node = %name, error = %e, "Could not release pod CIDR"),
            None => debug!(node = %name, "Node held no pod CIDR"),
        }
    }

    pub fn on_delete(&self, node: &Node) {
        self.release(&node.name_any());
    }

    /// Release the blocks of Nodes absent from a completed re-list.
    ///
    /// The watcher reports no deletions for objects removed while it was
    /// re-listing, so the listing itself is the only evidence they are gone.
    pub fn release_missing(&self, listed: &HashSet<String>) {
        let gone: Vec<String> = self
            .blocks()
            .owners
            .keys()
            .filter(|name| !listed.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            self.release(&name);
        }
    }

    async fn warn_node(&self, node: &Node, reason: &str, message: String) {
        let event = EventRecord::warning(reason, message);
        if let Err(e) = self.cluster.publish_event(&node.object_ref(&()), event).await {
            warn!(node = %node.name_any(), error = %e, "Failed to publish event");
        }
    }

    #[instrument(skip(self, name), fields(node = %name))]
    pub async fn allocate(&self, name: &str) -> Result<()> {
        let Some(node) = self.cluster.get_node(name).await? else {
            debug!("Node is gone");
            return Ok(());
        };
        if !pod_cidrs(&node).is_empty() {
            return Ok(());
        }

        let next = self.blocks().set.allocate_next();
        let v4 = match next {
            Ok(cidr) => cidr,
            Err(e) => {
                self.warn_node(&node, "CIDRNotAvailable", format!("Node {name}: {e}"))
                    .await;
                return Err(e);
            }
        };
        let mut cidrs = vec![v4.to_string()];
        match external_ipv4(&node) {
            Some(ip) => cidrs.push(derive_ipv6(ip).to_string()),
            None => debug!("Node has no ExternalIP, assigning IPv4 only"),
        }

        let patch = json!({ "spec": { "podCIDR": v4.to_string(), "podCIDRs": cidrs } });
        let backoff = Backoff::exponential(self.retries, PATCH_BACKOFF_BASE, PATCH_BACKOFF_CAP);
        let patched = retry_if(&backoff, "patch_node_cidrs", |_| true, || {
            self.cluster.patch_node(name, &patch)
        })
        .await;

        match patched {
            Ok(()) => {
                self.blocks().owners.insert(name.to_string(), v4);
                info!(cidrs = ?cidrs, "Assigned pod CIDRs");
                Ok(())
            }
            Err(e) => {
                let released = self.blocks().set.release(&v4);
                if let Err(release) = released {
                    error!(cidr = %v4, error = %release, "Could not release pod CIDR");
                }
                self.warn_node(
                    &node,
                    "CIDRAssignmentFailed",
                    format!("Failed to assign pod CIDR {v4}: {e}"),
                )
                .await;
                Err(e)
            }
        }
    }

    pub async fn process_next(&self) -> bool {
        let Some(name) = self.queue.get().await else {
            return false;
        };
        if let Err(e) = self.allocate(&name).await {
            error!(node = %name, error = %e, "Pod CIDR allocation failed");
        }
        self.queue.done(&name);
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

        info!("Starting node CIDR allocator");
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        let mut listed = HashSet::new();
        while let Some(event) = events.next().await {
            match event {
                Ok(watcher::Event::Init) => listed.clear(),
                Ok(watcher::Event::InitApply(node)) => {
                    listed.insert(node.name_any());
                    self.on_apply(&node);
                }
                Ok(watcher::Event::InitDone) => self.release_missing(&listed),
                Ok(watcher::Event::Apply(node)) => self.on_apply(&node),
                Ok(watcher::Event::Delete(node)) => self.on_delete(&node),
                Err(e) => warn!(error = %e, "Node watch failed"),
            }
        }

        self.shut_down();
        let _ = worker.await;
    }
}
