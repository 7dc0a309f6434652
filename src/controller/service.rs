//! Service watchers
//!
//! Two loops run over Services of type `LoadBalancer`:
//! - the apply loop, a kube-runtime [`Controller`] that ensures the load
//!   balancer and publishes `status.loadBalancer`. It holds every managed
//!   Service with [`annotations::LB_CLEANUP_FINALIZER`] and releases the cloud
//!   resources before letting the Service go, so deletions missed by a watch
//!   (or made while the controller was down) still reach the cloud;
//! - the deletion watcher, which queues deleted Services and releases their
//!   cloud resources, rescheduling on 429/5xx.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{future, Stream, StreamExt};
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::{self, Store},
        watcher, WatchStreamExt,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::annotations;
use crate::controller::instances::node_addresses;
use crate::controller::loadbalancer::{service_key, LoadBalancers};
use crate::controller::queue::WorkQueue;
use crate::error::{is_retryable, Error, Result};
use crate::k8s::ClusterClient;

const LOAD_BALANCER: &str = "LoadBalancer";

pub fn is_load_balancer(service: &Service) -> bool {
    service.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some(LOAD_BALANCER)
}

/// LoadBalancer Services with no class or one this controller implements
pub fn is_managed(service: &Service) -> bool {
    if !is_load_balancer(service) {
        return false;
    }
    match service
        .spec
        .as_ref()
        .and_then(|s| s.load_balancer_class.as_deref())
    {
        None => true,
        Some(class) => class == annotations::CILIUM_LB_CLASS,
    }
}

// ----------------------------------------------------------------------------
// Deletion watcher
// ----------------------------------------------------------------------------

pub struct ServiceDeletions {
    lbs: Arc<LoadBalancers>,
    queue: WorkQueue<String>,
    /// Last observed state of each deleted Service, by `namespace/name`
    pending: Mutex<HashMap<String, Service>>,
    retry_interval: Duration,
}

impl ServiceDeletions {
    pub fn new(lbs: Arc<LoadBalancers>, retry_interval: Duration) -> Self {
        Self {
            lbs,
            queue: WorkQueue::new(),
            pending: Mutex::new(HashMap::new()),
            retry_interval,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Service>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue_deleted(&self, service: Service) {
        if !is_managed(&service) {
            return;
        }
        let key = service_key(&service);
        debug!(service = %key, "queueing deleted Service");
        self.pending().insert(key.clone(), service);
        self.queue.add(key);
    }

    /// Handle one queued deletion. Returns false once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let service = self.pending().get(&key).cloned();
        if let Some(service) = service {
            let started = Instant::now();
            let result = self.lbs.ensure_deleted(&service).await;
            #[cfg(feature = "metrics")]
            super::metrics::observe_reconcile(
                "service-deletion",
                started.elapsed().as_secs_f64(),
                &result,
            );
            match result {
                Ok(()) => {
                    info!(service = %key, elapsed = ?started.elapsed(), "released load balancer");
                    self.pending().remove(&key);
                }
                Err(e) if is_retryable(&e) => {
                    warn!(
                        service = %key,
                        error = %e,
                        retry_in = ?self.retry_interval,
                        "deletion failed, rescheduling"
                    );
                    self.queue.add_after(key.clone(), self.retry_interval);
                }
                Err(e) => {
                    error!(service = %key, error = %e, "deletion failed, dropping");
                    self.pending().remove(&key);
                }
            }
        }
        self.queue.done(&key);
        true
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub async fn run(self: Arc<Self>, client: Client) {
        let api: Api<Service> = Api::all(client);
        let worker = {
            let this = self.clone();
            tokio::spawn(async move { while this.process_next().await {} })
        };

        info!("Starting Service deletion watcher");
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        while let Some(event) = events.next().await {
            match event {
                Ok(watcher::Event::Delete(service)) => self.enqueue_deleted(service),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Service watch failed"),
            }
        }

        self.shut_down();
        let _ = worker.await;
    }
}

// ----------------------------------------------------------------------------
// Apply loop
// ----------------------------------------------------------------------------

/// Shared state for the LoadBalancer apply loop
pub struct ServiceContext {
    pub lbs: Arc<LoadBalancers>,
    pub cluster: Arc<dyn ClusterClient>,
    pub nodes: Store<Node>,
    pub retry_interval: Duration,
}

fn current_status(service: &Service) -> Option<&LoadBalancerStatus> {
    service.status.as_ref()?.load_balancer.as_ref()
}

pub fn has_cleanup_finalizer(service: &Service) -> bool {
    service
        .finalizers()
        .iter()
        .any(|f| f == annotations::LB_CLEANUP_FINALIZER)
}

async fn add_cleanup_finalizer(cluster: &dyn ClusterClient, service: &Service) -> Result<()> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let mut finalizers = service.finalizers().to_vec();
    finalizers.push(annotations::LB_CLEANUP_FINALIZER.to_string());
    cluster
        .set_service_finalizers(&namespace, &service.name_any(), &finalizers)
        .await?;
    debug!("added cleanup finalizer");
    Ok(())
}

async fn remove_cleanup_finalizer(cluster: &dyn ClusterClient, service: &Service) -> Result<()> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let finalizers: Vec<String> = service
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != annotations::LB_CLEANUP_FINALIZER)
        .cloned()
        .collect();
    cluster
        .set_service_finalizers(&namespace, &service.name_any(), &finalizers)
        .await?;
    debug!("removed cleanup finalizer");
    Ok(())
}

/// Release the cloud resources of a deleted (or no longer LoadBalancer) Service, then drop the finalizer
async fn cleanup(service: &Service, ctx: &ServiceContext) -> Result<()> {
    let started = Instant::now();
    let result = ctx.lbs.ensure_deleted(service).await;
    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile("service-cleanup", started.elapsed().as_secs_f64(), &result);
    result?;
    remove_cleanup_finalizer(ctx.cluster.as_ref(), service).await?;
    info!(elapsed = ?started.elapsed(), "released load balancer");
    Ok(())
}

#[instrument(skip(service, ctx), fields(name = %service.name_any(), namespace = ?service.namespace()))]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<ServiceContext>) -> Result<Action> {
    if !is_managed(&service) || service.metadata.deletion_timestamp.is_some() {
        if has_cleanup_finalizer(&service) {
            cleanup(&service, &ctx).await?;
        }
        return Ok(Action::await_change());
    }
    if !has_cleanup_finalizer(&service) {
        add_cleanup_finalizer(ctx.cluster.as_ref(), &service).await?;
    }

    let started = Instant::now();
    let nodes: Vec<Node> = ctx.nodes.state().iter().map(|n| (**n).clone()).collect();
    let result = ctx.lbs.ensure(&service, &nodes).await;
    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile("service", started.elapsed().as_secs_f64(), &result);
    let status = result?;

    if current_status(&service) != Some(&status) {
        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        ctx.cluster
            .patch_service_status(&namespace, &service.name_any(), &status)
            .await?;
        info!(elapsed = ?started.elapsed(), "published load balancer status");
    } else {
        debug!("load balancer status unchanged");
    }
    Ok(Action::await_change())
}

pub fn error_policy(service: Arc<Service>, error: &Error, ctx: Arc<ServiceContext>) -> Action {
    // a deleting Service stays blocked on the finalizer until cleanup succeeds
    if is_retryable(error) || service.metadata.deletion_timestamp.is_some() {
        warn!(service = %service_key(&service), error = %error, "reconcile failed, rescheduling");
        Action::requeue(ctx.retry_interval)
    } else {
        error!(service = %service_key(&service), error = %error, "reconcile failed");
        Action::await_change()
    }
}

/// Fields of a Node that change the backend set
fn backend_fingerprint(node: &Node) -> (Vec<String>, Option<String>, Option<String>) {
    (
        node_addresses(node, "InternalIP"),
        annotations::get(&node.metadata, annotations::NODE_EXCLUDE_FROM_NB).map(str::to_string),
        annotations::get(&node.metadata, annotations::NODE_PRIVATE_IP).map(str::to_string),
    )
}

/// Emits once per Node event that changes some backend set
fn backend_changes<S>(events: S) -> impl Stream<Item = ()>
where
    S: Stream<Item = std::result::Result<watcher::Event<Node>, watcher::Error>>,
{
    let mut seen = BTreeMap::new();
    events.filter_map(move |event| {
        let changed = match event {
            Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                let fingerprint = backend_fingerprint(&node);
                seen.insert(node.name_any(), fingerprint.clone()) != Some(fingerprint)
            }
            Ok(watcher::Event::Delete(node)) => seen.remove(&node.name_any()).is_some(),
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "Node watch failed");
                false
            }
        };
        future::ready(changed.then_some(()))
    })
}

/// Makes a `Send` stream `Sync` for `Controller::reconcile_all_on`; polling
/// goes through `&mut self`, so the mutex is never actually locked
struct SyncStream<S>(Mutex<std::pin::Pin<Box<S>>>);

impl<S: Stream> Stream for SyncStream<S> {
    type Item = S::Item;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        match self.get_mut().0.get_mut() {
            Ok(inner) => inner.as_mut().poll_next(cx),
            Err(poisoned) => poisoned.into_inner().as_mut().poll_next(cx),
        }
    }
}

/// Main entry point of the LoadBalancer apply loop
pub async fn run_controller(
    client: Client,
    lbs: Arc<LoadBalancers>,
    cluster: Arc<dyn ClusterClient>,
    retry_interval: Duration,
) -> Result<()> {
    let services: Api<Service> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client);

    let (reader, writer) = reflector::store();
    let node_events = reflector::reflector(
        writer,
        watcher(nodes, watcher::Config::default()).default_backoff(),
    );

    let ctx = Arc::new(ServiceContext {
        lbs,
        cluster,
        nodes: reader,
        retry_interval,
    });

    info!("Starting LoadBalancer Service controller");
    Controller::new(services, watcher::Config::default())
        .reconcile_all_on(SyncStream(Mutex::new(Box::pin(backend_changes(node_events)))))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(service = %obj.name, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile error"),
            }
        })
        .await;
    Ok(())
}
