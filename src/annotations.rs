//! Annotation and label keys read from and written to Services and Nodes

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

pub const SERVICE_PREFIX: &str = "service.beta.kubernetes.io/linode-loadbalancer-";

// Service: per-port defaults
pub const DEFAULT_PROTOCOL: &str = "service.beta.kubernetes.io/linode-loadbalancer-default-protocol";
pub const DEFAULT_PROXY_PROTOCOL: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-default-proxy-protocol";
pub const DEFAULT_ALGORITHM: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-default-algorithm";
pub const DEFAULT_STICKINESS: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-default-stickiness";
/// Deprecated JSON list of `{"port": .., "tls-secret-name": ..}`
pub const TLS: &str = "service.beta.kubernetes.io/linode-loadbalancer-tls";
pub const UDP_CHECK_PORT: &str = "service.beta.kubernetes.io/linode-loadbalancer-udp-check-port";

// Service: health checks
pub const CHECK_TYPE: &str = "service.beta.kubernetes.io/linode-loadbalancer-check-type";
pub const CHECK_PATH: &str = "service.beta.kubernetes.io/linode-loadbalancer-check-path";
pub const CHECK_BODY: &str = "service.beta.kubernetes.io/linode-loadbalancer-check-body";
pub const CHECK_INTERVAL: &str = "service.beta.kubernetes.io/linode-loadbalancer-check-interval";
pub const CHECK_TIMEOUT: &str = "service.beta.kubernetes.io/linode-loadbalancer-check-timeout";
pub const CHECK_ATTEMPTS: &str = "service.beta.kubernetes.io/linode-loadbalancer-check-attempts";
pub const CHECK_PASSIVE: &str = "service.beta.kubernetes.io/linode-loadbalancer-check-passive";

// Service: NodeBalancer lifecycle
pub const THROTTLE: &str = "service.beta.kubernetes.io/linode-loadbalancer-throttle";
pub const PRESERVE: &str = "service.beta.kubernetes.io/linode-loadbalancer-preserve";
pub const NODEBALANCER_ID: &str = "service.beta.kubernetes.io/linode-loadbalancer-nodebalancer-id";
pub const NODEBALANCER_LABEL: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-nodebalancer-label";
pub const NODEBALANCER_TYPE: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-nodebalancer-type";
pub const HOSTNAME_ONLY_INGRESS: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-hostname-only-ingress";
pub const ENABLE_IPV6_INGRESS: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-enable-ipv6-ingress";
pub const TAGS: &str = "service.beta.kubernetes.io/linode-loadbalancer-tags";
pub const RESERVED_IPV4: &str = "service.beta.kubernetes.io/linode-loadbalancer-reserved-ipv4";

// Service: firewall
pub const FIREWALL_ID: &str = "service.beta.kubernetes.io/linode-loadbalancer-firewall-id";
pub const FIREWALL_ACL: &str = "service.beta.kubernetes.io/linode-loadbalancer-firewall-acl";

// Service: VPC backends
pub const BACKEND_IPV4_RANGE: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-backend-ipv4-range";
pub const BACKEND_VPC_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-backend-vpc-name";
pub const BACKEND_SUBNET_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-backend-subnet-name";
pub const BACKEND_SUBNET_ID: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-backend-subnet-id";

// Node
pub const NODE_EXCLUDE_FROM_NB: &str = "node.k8s.linode.com/exclude-from-nb";
pub const NODE_PRIVATE_IP: &str = "node.k8s.linode.com/private-ip";
pub const NODE_HOST_UUID: &str = "node.k8s.linode.com/host-uuid";
pub const NODE_IP_SHARING_UPDATED: &str = "node.k8s.linode.com/ip-sharing-updated";
pub const NODE_FIREWALL_ID: &str = "node.k8s.linode.com/firewall-id";
pub const NODE_FIREWALL_ACL: &str = "node.k8s.linode.com/firewall-acl";
pub const NODE_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

// Cilium
pub const CILIUM_LB_CLASS: &str = "io.cilium/bgp-control-plane";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "linode-ccm";
pub const SERVICE_NAMESPACE_LABEL: &str = "io.kubernetes.service.namespace";
pub const SERVICE_NAME_LABEL: &str = "io.kubernetes.service.name";

/// Finalizer holding a LoadBalancer Service until its cloud resources are released
pub const LB_CLEANUP_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

/// Key of the per-port JSON override for `port`
pub fn port_config(port: i32) -> String {
    format!("{SERVICE_PREFIX}port-{port}")
}

pub fn get<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|v| v.as_str())
}

pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(|v| v.as_str())
}

/// `true`, `1`, `yes` and friends; anything else is false
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "on" | "t"
    )
}

pub fn get_bool(meta: &ObjectMeta, key: &str) -> bool {
    get(meta, key).map(parse_bool).unwrap_or(false)
}

/// Parse a `k=v,k2=v2` selector. An empty string selects everything.
pub fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (kv.to_string(), String::new()),
        })
        .collect()
}

/// True when every selector pair is present in `labels`. A bare key matches on presence.
pub fn selector_matches(selector: &BTreeMap<String, String>, meta: &ObjectMeta) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector.iter().all(|(k, v)| match labels.get(k) {
        Some(actual) => v.is_empty() || actual == v,
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_port_config_key() {
        assert_eq!(
            port_config(443),
            "service.beta.kubernetes.io/linode-loadbalancer-port-443"
        );
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn test_selector() {
        let selector = parse_selector("cilium-bgp-peering=true, zone");
        assert_eq!(selector.len(), 2);
        assert!(selector_matches(
            &selector,
            &meta(&[("cilium-bgp-peering", "true"), ("zone", "a")])
        ));
        assert!(!selector_matches(
            &selector,
            &meta(&[("cilium-bgp-peering", "false"), ("zone", "a")])
        ));
        assert!(selector_matches(&parse_selector(""), &meta(&[])));
    }
}
