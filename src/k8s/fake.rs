//! In-memory [`ClusterClient`] used by the controller tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, ObjectReference, Secret};
use kube::ResourceExt;
use serde_json::Value;

use super::{ClusterClient, EventRecord};
use crate::crd::{CiliumBGPPeeringPolicy, CiliumLoadBalancerIPPool};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct State {
    pub nodes: BTreeMap<String, Node>,
    pub secrets: HashMap<(String, String), Secret>,
    pub service_status: HashMap<(String, String), LoadBalancerStatus>,
    pub service_finalizers: HashMap<(String, String), Vec<String>>,
    pub pools: BTreeMap<String, CiliumLoadBalancerIPPool>,
    pub policies: BTreeMap<String, CiliumBGPPeeringPolicy>,
    pub events: Vec<(String, EventRecord)>,
    pub node_patches: Vec<(String, Value)>,
    /// Number of upcoming `patch_node` calls that fail with a 409
    pub patch_conflicts: u32,
}

#[derive(Default)]
pub struct FakeCluster {
    pub state: Mutex<State>,
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(map) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn conflict() -> Error {
    Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_node(&self, node: Node) {
        self.with(|s| s.nodes.insert(node.name_any(), node));
    }

    pub fn add_secret(&self, namespace: &str, secret: Secret) {
        self.with(|s| {
            s.secrets
                .insert((namespace.to_string(), secret.name_any()), secret)
        });
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.with(|s| s.nodes.get(name).cloned())
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.with(|s| s.events.iter().map(|(_, e)| e.reason.clone()).collect())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.with(|s| {
            s.secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.with(|s| s.nodes.values().cloned().collect()))
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.node(name))
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.patch_conflicts > 0 {
            s.patch_conflicts -= 1;
            return Err(conflict());
        }
        let node = s.nodes.get(name).cloned().ok_or_else(|| {
            Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("nodes \"{name}\" not found"),
                reason: "NotFound".to_string(),
                code: 404,
            }))
        })?;
        let mut value = serde_json::to_value(&node)?;
        merge_patch(&mut value, patch);
        let patched: Node = serde_json::from_value(value)?;
        s.nodes.insert(name.to_string(), patched);
        s.node_patches.push((name.to_string(), patch.clone()));
        Ok(())
    }

    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LoadBalancerStatus,
    ) -> Result<()> {
        self.with(|s| {
            s.service_status
                .insert((namespace.to_string(), name.to_string()), status.clone())
        });
        Ok(())
    }

    async fn set_service_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        self.with(|s| {
            s.service_finalizers.insert(
                (namespace.to_string(), name.to_string()),
                finalizers.to_vec(),
            )
        });
        Ok(())
    }

    async fn list_ip_pools(&self) -> Result<Vec<CiliumLoadBalancerIPPool>> {
        Ok(self.with(|s| s.pools.values().cloned().collect()))
    }

    async fn get_ip_pool(&self, name: &str) -> Result<Option<CiliumLoadBalancerIPPool>> {
        Ok(self.with(|s| s.pools.get(name).cloned()))
    }

    async fn create_ip_pool(&self, pool: &CiliumLoadBalancerIPPool) -> Result<()> {
        self.with(|s| s.pools.insert(pool.name_any(), pool.clone()));
        Ok(())
    }

    async fn delete_ip_pool(&self, name: &str) -> Result<()> {
        self.with(|s| s.pools.remove(name));
        Ok(())
    }

    async fn get_peering_policy(&self, name: &str) -> Result<Option<CiliumBGPPeeringPolicy>> {
        Ok(self.with(|s| s.policies.get(name).cloned()))
    }

    async fn create_peering_policy(&self, policy: &CiliumBGPPeeringPolicy) -> Result<()> {
        self.with(|s| s.policies.insert(policy.name_any(), policy.clone()));
        Ok(())
    }

    async fn publish_event(&self, object: &ObjectReference, event: EventRecord) -> Result<()> {
        let name = object.name.clone().unwrap_or_default();
        self.with(|s| s.events.push((name, event)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_patch(&mut target, &json!({"a": {"b": null, "e": 5}, "d": [1]}));
        assert_eq!(target, json!({"a": {"c": 2, "e": 5}, "d": [1]}));
    }
}
