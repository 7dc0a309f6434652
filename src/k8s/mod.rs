//! Kubernetes side effects performed by the controllers
//!
//! Controllers never hold a raw `kube::Client`; they go through
//! [`ClusterClient`] so reconcile logic can be driven against the in-memory
//! fake in tests.

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Event, LoadBalancerStatus, Node, ObjectReference, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Value};

use crate::annotations::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::crd::{CiliumBGPPeeringPolicy, CiliumLoadBalancerIPPool};
use crate::error::{Error, Result};

/// Field manager used for every patch
pub const FIELD_MANAGER: &str = "linode-ccm";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// A Kubernetes Event to publish against an object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

impl EventRecord {
    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
    /// JSON merge patch against the Node (metadata or spec)
    async fn patch_node(&self, name: &str, patch: &Value) -> Result<()>;

    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LoadBalancerStatus,
    ) -> Result<()>;
    /// Replace `metadata.finalizers` of the Service
    async fn set_service_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;

    /// Pools labelled as managed by this controller
    async fn list_ip_pools(&self) -> Result<Vec<CiliumLoadBalancerIPPool>>;
    async fn get_ip_pool(&self, name: &str) -> Result<Option<CiliumLoadBalancerIPPool>>;
    async fn create_ip_pool(&self, pool: &CiliumLoadBalancerIPPool) -> Result<()>;
    /// Delete a pool; a missing pool is not an error
    async fn delete_ip_pool(&self, name: &str) -> Result<()>;

    async fn get_peering_policy(&self, name: &str) -> Result<Option<CiliumBGPPeeringPolicy>>;
    async fn create_peering_policy(&self, policy: &CiliumBGPPeeringPolicy) -> Result<()>;

    async fn publish_event(&self, object: &ObjectReference, event: EventRecord) -> Result<()>;
}

/// kube-rs implementation of [`ClusterClient`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn not_found_as_none<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        not_found_as_none(api.get(name).await)
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LoadBalancerStatus,
    ) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": { "loadBalancer": status } });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_service_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_ip_pools(&self) -> Result<Vec<CiliumLoadBalancerIPPool>> {
        let api: Api<CiliumLoadBalancerIPPool> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"));
        Ok(api.list(&params).await?.items)
    }

    async fn get_ip_pool(&self, name: &str) -> Result<Option<CiliumLoadBalancerIPPool>> {
        let api: Api<CiliumLoadBalancerIPPool> = Api::all(self.client.clone());
        not_found_as_none(api.get(name).await)
    }

    async fn create_ip_pool(&self, pool: &CiliumLoadBalancerIPPool) -> Result<()> {
        let api: Api<CiliumLoadBalancerIPPool> = Api::all(self.client.clone());
        api.create(&PostParams::default(), pool).await?;
        Ok(())
    }

    async fn delete_ip_pool(&self, name: &str) -> Result<()> {
        let api: Api<CiliumLoadBalancerIPPool> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn get_peering_policy(&self, name: &str) -> Result<Option<CiliumBGPPeeringPolicy>> {
        let api: Api<CiliumBGPPeeringPolicy> = Api::all(self.client.clone());
        not_found_as_none(api.get(name).await)
    }

    async fn create_peering_policy(&self, policy: &CiliumBGPPeeringPolicy) -> Result<()> {
        let api: Api<CiliumBGPPeeringPolicy> = Api::all(self.client.clone());
        api.create(&PostParams::default(), policy).await?;
        Ok(())
    }

    async fn publish_event(&self, object: &ObjectReference, event: EventRecord) -> Result<()> {
        let namespace = object
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let record = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!(
                    "{}-",
                    object.name.clone().unwrap_or_else(|| "linode-ccm".to_string())
                )),
                namespace: Some(namespace),
                ..Default::default()
            },
            type_: Some(event.type_.as_str().to_string()),
            reason: Some(event.reason),
            message: Some(event.message),
            involved_object: object.clone(),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        events.create(&PostParams::default(), &record).await?;
        Ok(())
    }
}
