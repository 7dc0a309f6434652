//! Selection of NodeBalancer backends from the cluster's Nodes

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::annotations;
use crate::controller::instances::node_addresses;
use crate::error::{Error, Result};
use crate::linode::{NodeBalancerNodeOptions, NodeModeOption};

pub const BACKEND_WEIGHT: i32 = 100;
const LABEL_MIN: usize = 3;
const LABEL_MAX: usize = 32;

/// VPC subnet the backends are addressed in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSubnet {
    pub id: i64,
    pub range: Ipv4Net,
}

/// Whether `node` is eligible to serve traffic for a NodeBalancer
pub fn is_eligible(node: &Node, exclude_control_plane: bool) -> bool {
    if annotations::get_bool(&node.metadata, annotations::NODE_EXCLUDE_FROM_NB) {
        return false;
    }
    if exclude_control_plane
        && annotations::label(&node.metadata, annotations::NODE_CONTROL_PLANE).is_some()
    {
        return false;
    }
    true
}

/// Backend labels accept letters, digits, `-`, `_` and `.`, 3 to 32 characters
pub fn backend_label(node_name: &str) -> String {
    let mut label: String = node_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(LABEL_MAX)
        .collect();
    while label.len() < LABEL_MIN {
        label.push('x');
    }
    label
}

fn backend_address(node: &Node, subnet: Option<&BackendSubnet>) -> Result<String> {
    let name = node.name_any();
    match subnet {
        None => {
            if let Some(ip) = annotations::get(&node.metadata, annotations::NODE_PRIVATE_IP) {
                return Ok(ip.to_string());
            }
            node_addresses(node, "InternalIP")
                .into_iter()
                .next()
                .ok_or(Error::NoAddress(name))
        }
        Some(subnet) => {
            let address = node_addresses(node, "InternalIP")
                .into_iter()
                .next()
                .ok_or_else(|| Error::NoAddress(name.clone()))?;
            let inside = address
                .parse::<Ipv4Addr>()
                .map(|ip| subnet.range.contains(&ip))
                .unwrap_or(false);
            if !inside {
                return Err(Error::BackendOutsideSubnet {
                    node: name,
                    address,
                    subnet: subnet.range.to_string(),
                });
            }
            Ok(address)
        }
    }
}

/// Build the backend set for one NodeBalancer port. The result is sorted.
pub fn build_backends(
    nodes: &[Node],
    node_port: i32,
    exclude_control_plane: bool,
    subnet: Option<&BackendSubnet>,
) -> Result<Vec<NodeBalancerNodeOptions>> {
    let mut backends = Vec::new();
    for node in nodes.iter().filter(|n| is_eligible(n, exclude_control_plane)) {
        let address = backend_address(node, subnet)?;
        backends.push(NodeBalancerNodeOptions {
            address: format!("{address}:{node_port}"),
            label: backend_label(&node.name_any()),
            weight: BACKEND_WEIGHT,
            mode: NodeModeOption::Accept,
            subnet_id: subnet.map(|s| s.id),
        });
    }
    if backends.is_empty() {
        return Err(Error::NoNodesAvailable);
    }
    backends.sort();
    Ok(backends)
}
