//! Service `status.loadBalancer` publication and hostname parsing

use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Service};

use crate::annotations;
use crate::linode::NodeBalancer;

const HOSTNAME_SUFFIX: &str = ".nodebalancer.linode.com";

/// Extract the IPv4 from `nb-<ipv4>.<region>.nodebalancer.linode.com`.
/// The address may be written with dots or dashes.
pub fn ipv4_from_hostname(hostname: &str) -> Option<Ipv4Addr> {
    let rest = hostname.strip_prefix("nb-")?.strip_suffix(HOSTNAME_SUFFIX)?;
    let (addr, region) = rest.rsplit_once('.')?;
    if region.is_empty() {
        return None;
    }
    addr.replace('-', ".").parse().ok()
}

/// NodeBalancer IPv4 recorded in the Service status, if any
pub fn status_ipv4(service: &Service) -> Option<Ipv4Addr> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .filter_map(|i| i.hostname.as_deref())
        .find_map(ipv4_from_hostname)
}

/// Every ingress IP recorded in the Service status
pub fn ingress_ips(service: &Service) -> Vec<String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone()).collect())
        .unwrap_or_default()
}

/// Ingress entries for `nb`. A configured `hostname_only` overrides the annotation.
pub fn build_status(
    service: &Service,
    nb: &NodeBalancer,
    hostname_only: Option<bool>,
    ipv6_globally: bool,
) -> LoadBalancerStatus {
    let meta = &service.metadata;
    let hostname_only = hostname_only
        .unwrap_or_else(|| annotations::get_bool(meta, annotations::HOSTNAME_ONLY_INGRESS));
    let ipv6 = ipv6_globally || annotations::get_bool(meta, annotations::ENABLE_IPV6_INGRESS);

    let mut ingress = vec![LoadBalancerIngress {
        hostname: nb.hostname.clone(),
        ip: if hostname_only { None } else { nb.ipv4.clone() },
        ..Default::default()
    }];
    if ipv6 {
        if let Some(v6) = nb.ipv6.clone().filter(|v| !v.is_empty()) {
            ingress.push(LoadBalancerIngress {
                ip: Some(v6),
                ..Default::default()
            });
        }
    }
    LoadBalancerStatus {
        ingress: Some(ingress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceStatus;
    use kube::api::ObjectMeta;

    fn nb() -> NodeBalancer {
        NodeBalancer {
            id: 12,
            hostname: Some("nb-192-0-2-7.us-ord.nodebalancer.linode.com".to_string()),
            ipv4: Some("192.0.2.7".to_string()),
            ipv6: Some("2600:3c00::7".to_string()),
            ..Default::default()
        }
    }

    fn service(pairs: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                annotations: Some(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_parses_hostnames() {
        assert_eq!(
            ipv4_from_hostname("nb-192-0-2-7.us-ord.nodebalancer.linode.com"),
            Some(Ipv4Addr::new(192, 0, 2, 7))
        );
        assert_eq!(
            ipv4_from_hostname("nb-192.0.2.7.us-ord.nodebalancer.linode.com"),
            Some(Ipv4Addr::new(192, 0, 2, 7))
        );
        assert_eq!(ipv4_from_hostname("nb-192-0-2-7.nodebalancer.linode.com"), None);
        assert_eq!(ipv4_from_hostname("example.com"), None);
    }

    #[test]
    fn test_default_status_has_hostname_and_ip() {
        let status = build_status(&service(&[]), &nb(), None, false);
        let ingress = status.ingress.unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].ip.as_deref(), Some("192.0.2.7"));
        assert!(ingress[0].hostname.is_some());
    }

    #[test]
    fn test_hostname_only_and_ipv6() {
        let svc = service(&[
            (annotations::HOSTNAME_ONLY_INGRESS, "true"),
            (annotations::ENABLE_IPV6_INGRESS, "true"),
        ]);
        let ingress = build_status(&svc, &nb(), None, false).ingress.unwrap();
        assert!(ingress[0].ip.is_none());
        assert_eq!(ingress[1].ip.as_deref(), Some("2600:3c00::7"));

        let ingress = build_status(&svc, &nb(), Some(false), false).ingress.unwrap();
        assert_eq!(ingress[0].ip.as_deref(), Some("192.0.2.7"));

        let ingress = build_status(&service(&[]), &nb(), None, true).ingress.unwrap();
        assert_eq!(ingress.len(), 2);
    }

    #[test]
    fn test_status_ipv4() {
        let mut svc = service(&[]);
        assert!(status_ipv4(&svc).is_none());
        svc.status = Some(ServiceStatus {
            load_balancer: Some(build_status(&svc, &nb(), None, false)),
            ..Default::default()
        });
        assert_eq!(status_ipv4(&svc), Some(Ipv4Addr::new(192, 0, 2, 7)));
        assert_eq!(ingress_ips(&svc), vec!["192.0.2.7".to_string()]);
    }
}
