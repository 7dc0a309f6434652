//! Per-port NodeBalancer configuration derived from Service annotations
//!
//! Resolution order for every setting is: the `port-<n>` JSON annotation, then
//! the service-wide `default-*` annotation, then the built-in default. The
//! per-protocol whitelists live in a single table, [`PROTOCOL_RULES`].

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::api::ObjectMeta;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::annotations::{self, get};
use crate::error::{Error, Result};
use crate::linode::{
    ConfigAlgorithm, ConfigCheck, ConfigProtocol, ConfigStickiness, NodeBalancerConfig,
    NodeBalancerConfigOptions, NodeBalancerNode, NodeBalancerNodeOptions, NodeMode,
    NodeModeOption, ProxyProtocol,
};

pub const DEFAULT_CHECK_INTERVAL: i32 = 5;
pub const DEFAULT_CHECK_TIMEOUT: i32 = 3;
pub const DEFAULT_CHECK_ATTEMPTS: i32 = 2;
pub const DEFAULT_UDP_CHECK_PORT: i32 = 80;

/// What each NodeBalancer protocol accepts
pub struct ProtocolRules {
    pub protocol: ConfigProtocol,
    /// Kubernetes Service port protocol the NodeBalancer protocol requires
    pub service_protocol: &'static str,
    pub proxy_protocols: &'static [ProxyProtocol],
    pub algorithms: &'static [ConfigAlgorithm],
    /// Empty when the protocol has no stickiness setting
    pub stickiness: &'static [ConfigStickiness],
    pub default_stickiness: ConfigStickiness,
}

pub const PROTOCOL_RULES: [ProtocolRules; 4] = [
    ProtocolRules {
        protocol: ConfigProtocol::Tcp,
        service_protocol: "TCP",
        proxy_protocols: &[ProxyProtocol::None, ProxyProtocol::V1, ProxyProtocol::V2],
        algorithms: &[
            ConfigAlgorithm::RoundRobin,
            ConfigAlgorithm::LeastConnections,
            ConfigAlgorithm::Source,
        ],
        stickiness: &[],
        default_stickiness: ConfigStickiness::None,
    },
    ProtocolRules {
        protocol: ConfigProtocol::Http,
        service_protocol: "TCP",
        proxy_protocols: &[ProxyProtocol::None, ProxyProtocol::V1, ProxyProtocol::V2],
        algorithms: &[
            ConfigAlgorithm::RoundRobin,
            ConfigAlgorithm::LeastConnections,
            ConfigAlgorithm::Source,
        ],
        stickiness: &[
            ConfigStickiness::None,
            ConfigStickiness::Table,
            ConfigStickiness::HttpCookie,
        ],
        default_stickiness: ConfigStickiness::Table,
    },
    ProtocolRules {
        protocol: ConfigProtocol::Https,
        service_protocol: "TCP",
        proxy_protocols: &[ProxyProtocol::None, ProxyProtocol::V1, ProxyProtocol::V2],
        algorithms: &[
            ConfigAlgorithm::RoundRobin,
            ConfigAlgorithm::LeastConnections,
            ConfigAlgorithm::Source,
        ],
        stickiness: &[
            ConfigStickiness::None,
            ConfigStickiness::Table,
            ConfigStickiness::HttpCookie,
        ],
        default_stickiness: ConfigStickiness::Table,
    },
    ProtocolRules {
        protocol: ConfigProtocol::Udp,
        service_protocol: "UDP",
        proxy_protocols: &[ProxyProtocol::None],
        algorithms: &[
            ConfigAlgorithm::RoundRobin,
            ConfigAlgorithm::LeastConnections,
            ConfigAlgorithm::RingHash,
        ],
        stickiness: &[ConfigStickiness::None, ConfigStickiness::Session],
        default_stickiness: ConfigStickiness::Session,
    },
];

pub fn rules_for(protocol: ConfigProtocol) -> &'static ProtocolRules {
    PROTOCOL_RULES
        .iter()
        .find(|r| r.protocol == protocol)
        .unwrap_or(&PROTOCOL_RULES[0])
}

/// Body of the `port-<n>` annotation
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortConfigAnnotation {
    pub protocol: Option<String>,
    pub proxy_protocol: Option<String>,
    pub algorithm: Option<String>,
    pub stickiness: Option<String>,
    pub tls_secret_name: Option<String>,
    pub udp_check_port: Option<i32>,
}

/// Entry of the deprecated service-wide TLS annotation
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TlsAnnotationEntry {
    port: i32,
    tls_secret_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Http,
    Https { tls_secret_name: String },
    Udp { check_port: i32 },
}

impl PortProtocol {
    pub fn config_protocol(&self) -> ConfigProtocol {
        match self {
            PortProtocol::Tcp => ConfigProtocol::Tcp,
            PortProtocol::Http => ConfigProtocol::Http,
            PortProtocol::Https { .. } => ConfigProtocol::Https,
            PortProtocol::Udp { .. } => ConfigProtocol::Udp,
        }
    }

    pub fn tls_secret_name(&self) -> Option<&str> {
        match self {
            PortProtocol::Https { tls_secret_name } => Some(tls_secret_name),
            _ => None,
        }
    }

    pub fn udp_check_port(&self) -> Option<i32> {
        match self {
            PortProtocol::Udp { check_port } => Some(*check_port),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    pub check: ConfigCheck,
    pub path: Option<String>,
    pub body: Option<String>,
    pub interval: i32,
    pub timeout: i32,
    pub attempts: i32,
    pub passive: bool,
}

/// Fully resolved configuration of one Service port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConfig {
    pub port: i32,
    pub node_port: i32,
    pub protocol: PortProtocol,
    pub proxy_protocol: ProxyProtocol,
    pub algorithm: ConfigAlgorithm,
    pub stickiness: ConfigStickiness,
    pub health: HealthCheck,
}

/// PEM certificate chain and key read from the TLS Secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: String,
    pub key: String,
}

fn invalid(annotation: &str, reason: impl Into<String>) -> Error {
    Error::InvalidAnnotation {
        annotation: annotation.to_string(),
        reason: reason.into(),
    }
}

/// Parse a wire enum from its snake_case name
fn parse_wire<T: for<'de> Deserialize<'de>>(annotation: &str, value: &str) -> Result<T> {
    let normalized = value.trim().to_ascii_lowercase();
    serde_json::from_value(serde_json::Value::String(normalized.clone()))
        .map_err(|_| invalid(annotation, format!("unrecognized value {normalized:?}")))
}

fn parse_int(meta: &ObjectMeta, key: &str, default: i32) -> Result<i32> {
    match get(meta, key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(key, format!("{raw:?} is not an integer"))),
        None => Ok(default),
    }
}

fn tls_annotation_secret(meta: &ObjectMeta, port: i32) -> Result<Option<String>> {
    let Some(raw) = get(meta, annotations::TLS) else {
        return Ok(None);
    };
    let entries: Vec<TlsAnnotationEntry> = serde_json::from_str(raw)
        .map_err(|e| invalid(annotations::TLS, e.to_string()))?;
    Ok(entries
        .into_iter()
        .find(|e| e.port == port)
        .map(|e| e.tls_secret_name))
}

pub fn port_annotation(meta: &ObjectMeta, port: i32) -> Result<PortConfigAnnotation> {
    let key = annotations::port_config(port);
    match get(meta, &key) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| invalid(&key, e.to_string())),
        None => Ok(PortConfigAnnotation::default()),
    }
}

fn health_check(meta: &ObjectMeta, protocol: ConfigProtocol) -> Result<HealthCheck> {
    let check: ConfigCheck = match get(meta, annotations::CHECK_TYPE) {
        Some(raw) => parse_wire(annotations::CHECK_TYPE, raw)?,
        None => ConfigCheck::Connection,
    };

    let path = match check {
        ConfigCheck::Http | ConfigCheck::HttpBody => Some(
            get(meta, annotations::CHECK_PATH)
                .filter(|p| !p.is_empty())
                .unwrap_or("/")
                .to_string(),
        ),
        _ => None,
    };
    let body = match check {
        ConfigCheck::HttpBody => match get(meta, annotations::CHECK_BODY).filter(|b| !b.is_empty()) {
            Some(body) => Some(body.to_string()),
            None => {
                return Err(invalid(
                    annotations::CHECK_BODY,
                    "check type http_body requires a body regex",
                ))
            }
        },
        _ => None,
    };

    let passive = match protocol {
        ConfigProtocol::Udp => false,
        _ => get(meta, annotations::CHECK_PASSIVE)
            .map(annotations::parse_bool)
            .unwrap_or(true),
    };

    Ok(HealthCheck {
        check,
        path,
        body,
        interval: parse_int(meta, annotations::CHECK_INTERVAL, DEFAULT_CHECK_INTERVAL)?,
        timeout: parse_int(meta, annotations::CHECK_TIMEOUT, DEFAULT_CHECK_TIMEOUT)?,
        attempts: parse_int(meta, annotations::CHECK_ATTEMPTS, DEFAULT_CHECK_ATTEMPTS)?,
        passive,
    })
}

/// Resolve the configuration of `port` on `service`
pub fn resolve(service: &Service, port: &ServicePort) -> Result<PortConfig> {
    let meta = &service.metadata;
    let ann = port_annotation(meta, port.port)?;
    let port_key = annotations::port_config(port.port);

    let (protocol_key, protocol_raw) = match (&ann.protocol, get(meta, annotations::DEFAULT_PROTOCOL)) {
        (Some(p), _) => (port_key.as_str(), p.as_str()),
        (None, Some(p)) => (annotations::DEFAULT_PROTOCOL, p),
        (None, None) => (annotations::DEFAULT_PROTOCOL, "tcp"),
    };
    let protocol: ConfigProtocol = parse_wire(protocol_key, protocol_raw)?;
    let rules = rules_for(protocol);

    let service_protocol = port.protocol.as_deref().unwrap_or("TCP");
    if !service_protocol.eq_ignore_ascii_case(rules.service_protocol) {
        return Err(Error::ValidationError(format!(
            "port {} uses {} but NodeBalancer protocol {} requires {}",
            port.port, service_protocol, protocol, rules.service_protocol
        )));
    }

    let proxy_protocol: ProxyProtocol = match (&ann.proxy_protocol, get(meta, annotations::DEFAULT_PROXY_PROTOCOL)) {
        (Some(p), _) => parse_wire(&port_key, p)?,
        (None, Some(p)) => parse_wire(annotations::DEFAULT_PROXY_PROTOCOL, p)?,
        (None, None) => ProxyProtocol::None,
    };
    if !rules.proxy_protocols.contains(&proxy_protocol) {
        return Err(Error::ValidationError(format!(
            "proxy protocol {proxy_protocol} is not supported for {protocol}"
        )));
    }

    let algorithm: ConfigAlgorithm = match (&ann.algorithm, get(meta, annotations::DEFAULT_ALGORITHM)) {
        (Some(a), _) => parse_wire(&port_key, a)?,
        (None, Some(a)) => parse_wire(annotations::DEFAULT_ALGORITHM, a)?,
        (None, None) => ConfigAlgorithm::RoundRobin,
    };
    if !rules.algorithms.contains(&algorithm) {
        return Err(Error::ValidationError(format!(
            "algorithm {algorithm} is not supported for {protocol}"
        )));
    }

    let stickiness = if rules.stickiness.is_empty() {
        rules.default_stickiness
    } else {
        let stickiness: ConfigStickiness = match (&ann.stickiness, get(meta, annotations::DEFAULT_STICKINESS)) {
            (Some(s), _) => parse_wire(&port_key, s)?,
            (None, Some(s)) => parse_wire(annotations::DEFAULT_STICKINESS, s)?,
            (None, None) => rules.default_stickiness,
        };
        if !rules.stickiness.contains(&stickiness) {
            return Err(Error::ValidationError(format!(
                "stickiness {stickiness} is not supported for {protocol}"
            )));
        }
        stickiness
    };

    let tls_secret_name = match &ann.tls_secret_name {
        Some(name) => Some(name.clone()),
        None => tls_annotation_secret(meta, port.port)?,
    };

    if ann.udp_check_port.is_some() && protocol != ConfigProtocol::Udp {
        return Err(Error::ValidationError(format!(
            "udp-check-port is only valid for udp ports, port {} is {protocol}",
            port.port
        )));
    }

    let protocol = match protocol {
        ConfigProtocol::Tcp => PortProtocol::Tcp,
        ConfigProtocol::Http => PortProtocol::Http,
        ConfigProtocol::Https => PortProtocol::Https {
            tls_secret_name: tls_secret_name.ok_or_else(|| {
                Error::ValidationError(format!(
                    "port {} uses https but names no TLS secret",
                    port.port
                ))
            })?,
        },
        ConfigProtocol::Udp => {
            if tls_secret_name.is_some() {
                return Err(Error::ValidationError(format!(
                    "port {} uses udp and cannot carry TLS",
                    port.port
                )));
            }
            let check_port = match ann.udp_check_port {
                Some(p) => p,
                None => parse_int(meta, annotations::UDP_CHECK_PORT, DEFAULT_UDP_CHECK_PORT)?,
            };
            if !(1..=65535).contains(&check_port) {
                return Err(Error::ValidationError(format!(
                    "udp check port {check_port} is outside 1-65535"
                )));
            }
            PortProtocol::Udp { check_port }
        }
    };

    Ok(PortConfig {
        port: port.port,
        node_port: port.node_port.unwrap_or_default(),
        health: health_check(meta, protocol.config_protocol())?,
        protocol,
        proxy_protocol,
        algorithm,
        stickiness,
    })
}

/// Resolve every port of `service`
pub fn resolve_all(service: &Service) -> Result<Vec<PortConfig>> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().map(|p| resolve(service, p)).collect())
        .unwrap_or_else(|| Ok(Vec::new()))
}

impl PortConfig {
    pub fn options(
        &self,
        tls: Option<&TlsMaterial>,
        nodes: Vec<NodeBalancerNodeOptions>,
    ) -> NodeBalancerConfigOptions {
        NodeBalancerConfigOptions {
            port: self.port,
            protocol: self.protocol.config_protocol(),
            proxy_protocol: self.proxy_protocol,
            algorithm: self.algorithm,
            stickiness: self.stickiness,
            check: self.health.check,
            check_interval: self.health.interval,
            check_timeout: self.health.timeout,
            check_attempts: self.health.attempts,
            check_path: self.health.path.clone(),
            check_body: self.health.body.clone(),
            check_passive: self.health.passive,
            udp_check_port: self.protocol.udp_check_port(),
            ssl_cert: tls.map(|t| t.cert.clone()),
            ssl_key: tls.map(|t| t.key.clone()),
            nodes,
        }
    }
}

/// SHA-256 of the first certificate's DER, as upper-case colon-separated hex
pub fn cert_fingerprint(pem: &str) -> Option<String> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";
    let start = pem.find(BEGIN)? + BEGIN.len();
    let end = start + pem[start..].find(END)?;
    let b64: String = pem[start..end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let der = STANDARD.decode(b64).ok()?;
    let digest = Sha256::digest(&der);
    Some(
        digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// True when the existing config and its nodes already match `desired`
pub fn config_matches(
    existing: &NodeBalancerConfig,
    existing_nodes: &[NodeBalancerNode],
    desired: &NodeBalancerConfigOptions,
) -> bool {
    let same_settings = existing.port == desired.port
        && existing.protocol == desired.protocol
        && existing.proxy_protocol == desired.proxy_protocol
        && existing.algorithm == desired.algorithm
        && existing.stickiness == desired.stickiness
        && existing.check == desired.check
        && existing.check_interval == desired.check_interval
        && existing.check_timeout == desired.check_timeout
        && existing.check_attempts == desired.check_attempts
        && existing.check_path == desired.check_path.clone().unwrap_or_default()
        && existing.check_body == desired.check_body.clone().unwrap_or_default()
        && existing.check_passive == desired.check_passive;
    if !same_settings {
        return false;
    }

    if desired.protocol == ConfigProtocol::Udp && existing.udp_check_port != desired.udp_check_port {
        return false;
    }

    if desired.protocol == ConfigProtocol::Https {
        let wanted = desired.ssl_cert.as_deref().and_then(cert_fingerprint);
        if wanted.as_deref() != Some(existing.ssl_fingerprint.as_str()) {
            return false;
        }
    }

    let current: BTreeMap<&str, (&str, i32, NodeModeOption)> = existing_nodes
        .iter()
        .map(|n| {
            let mode = match n.mode {
                NodeMode::Drain => NodeModeOption::Drain,
                _ => NodeModeOption::Accept,
            };
            (n.address.as_str(), (n.label.as_str(), n.weight, mode))
        })
        .collect();
    let wanted: BTreeMap<&str, (&str, i32, NodeModeOption)> = desired
        .nodes
        .iter()
        .map(|n| (n.address.as_str(), (n.label.as_str(), n.weight, n.mode)))
        .collect();
    current == wanted && existing_nodes.len() == desired.nodes.len()
}
