//! Cilium BGP control-plane resources written by the shared-IP load balancer
//!
//! Only the fields the controller sets are modelled; Cilium owns the CRDs.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label selector as Cilium serialises it (`matchLabels` / `matchExpressions`)
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SlimLabelSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<SlimLabelSelectorRequirement>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SlimLabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

// ----------------------------------------------------------------------------
// CiliumLoadBalancerIPPool
// ----------------------------------------------------------------------------

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cilium.io",
    version = "v2alpha1",
    kind = "CiliumLoadBalancerIPPool",
    plural = "ciliumloadbalancerippools"
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumLoadBalancerIPPoolSpec {
    #[serde(default)]
    pub blocks: Vec<CiliumLoadBalancerIPPoolIPBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_selector: Option<SlimLabelSelector>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CiliumLoadBalancerIPPoolIPBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
}

impl CiliumLoadBalancerIPPool {
    /// Host addresses declared by this pool's `/32` blocks
    pub fn addresses(&self) -> Vec<String> {
        self.spec
            .blocks
            .iter()
            .filter_map(|b| b.cidr.as_deref())
            .filter_map(|cidr| cidr.strip_suffix("/32"))
            .map(str::to_string)
            .collect()
    }
}

// ----------------------------------------------------------------------------
// CiliumBGPPeeringPolicy
// ----------------------------------------------------------------------------

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cilium.io",
    version = "v2alpha1",
    kind = "CiliumBGPPeeringPolicy",
    plural = "ciliumbgppeeringpolicies"
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPPeeringPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<SlimLabelSelector>,
    pub virtual_routers: Vec<CiliumBGPVirtualRouter>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPVirtualRouter {
    #[serde(rename = "localASN")]
    pub local_asn: i64,
    #[serde(rename = "exportPodCIDR", default)]
    pub export_pod_cidr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_selector: Option<SlimLabelSelector>,
    pub neighbors: Vec<CiliumBGPNeighbor>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNeighbor {
    pub peer_address: String,
    #[serde(rename = "peerASN")]
    pub peer_asn: i64,
    #[serde(rename = "eBGPMultihopTTL", default, skip_serializing_if = "Option::is_none")]
    pub ebgp_multihop_ttl: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_retry_time_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_time_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_time_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_restart: Option<CiliumBGPNeighborGracefulRestart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advertised_path_attributes: Vec<CiliumBGPPathAttributes>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNeighborGracefulRestart {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_time_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPPathAttributes {
    pub selector_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SlimLabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communities: Option<BGPCommunities>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BGPCommunities {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub standard: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub well_known: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_api_coordinates() {
        assert_eq!(CiliumLoadBalancerIPPool::group(&()), "cilium.io");
        assert_eq!(CiliumLoadBalancerIPPool::version(&()), "v2alpha1");
        assert_eq!(
            CiliumBGPPeeringPolicy::plural(&()),
            "ciliumbgppeeringpolicies"
        );
    }

    #[test]
    fn test_neighbor_wire_names() {
        let neighbor = CiliumBGPNeighbor {
            peer_address: "2600:3c0f:18:34::1/64".to_string(),
            peer_asn: 65000,
            ebgp_multihop_ttl: Some(10),
            ..Default::default()
        };
        let value = serde_json::to_value(&neighbor).unwrap();
        assert_eq!(value["peerASN"], 65000);
        assert_eq!(value["eBGPMultihopTTL"], 10);
        assert!(value.get("holdTimeSeconds").is_none());
    }

    #[test]
    fn test_pool_addresses() {
        let pool = CiliumLoadBalancerIPPool::new(
            "default-web-pool",
            CiliumLoadBalancerIPPoolSpec {
                blocks: vec![
                    CiliumLoadBalancerIPPoolIPBlock {
                        cidr: Some("198.51.100.7/32".to_string()),
                    },
                    CiliumLoadBalancerIPPoolIPBlock { cidr: None },
                ],
                ..Default::default()
            },
        );
        assert_eq!(pool.addresses(), vec!["198.51.100.7".to_string()]);
    }
}
