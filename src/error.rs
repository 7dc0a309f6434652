//! Error types for the controller manager
//!
//! Every controller returns [`Error`]. Cloud failures are carried as
//! [`LinodeError`] and classified through [`ErrorKind`] so that retry decisions
//! are made by matching on a variant rather than comparing status codes.

use thiserror::Error;

use crate::linode::{ErrorKind, LinodeError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Linode API error: {0}")]
    LinodeError(#[from] LinodeError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid CIDR: {0}")]
    CidrParseError(#[from] ipnet::AddrParseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid annotation {annotation}: {reason}")]
    InvalidAnnotation { annotation: String, reason: String },

    #[error("Load balancer for service {service} not found (NodeBalancer {id})")]
    LoadBalancerNotFound { service: String, id: i64 },

    #[error("VPC {0} not found")]
    VpcNotFound(String),

    #[error("Subnet {0} not found")]
    SubnetNotFound(String),

    #[error("Instance for node {0} not found")]
    InstanceNotFound(String),

    #[error("Invalid provider ID {0:?}")]
    InvalidProviderId(String),

    #[error("Node {0} has no usable address")]
    NoAddress(String),

    #[error("No nodes available for NodeBalancer")]
    NoNodesAvailable,

    #[error("Backend address {address} of node {node} is outside subnet {subnet}")]
    BackendOutsideSubnet {
        node: String,
        address: String,
        subnet: String,
    },

    #[error("Too many firewalls attached to {0}")]
    TooManyFirewalls(String),

    #[error("Too many IPs in firewall ACL: {0} rules needed, at most {1} allowed")]
    TooManyIps(usize, usize),

    #[error("Invalid firewall configuration: {0}")]
    InvalidFirewallConfig(String),

    #[error("Region {0} does not support BGP load balancers")]
    UnsupportedRegion(String),

    #[error("CIDR range exhausted")]
    CidrRangeExhausted,

    #[error("CIDR {cidr} is not inside cluster CIDR {cluster}")]
    CidrOutOfRange { cidr: String, cluster: String },

    #[error("Node {0} has no interface in a configured VPC")]
    NoVpcInterface(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Classify the error as seen by the cloud API. Non-cloud errors are `Other`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LinodeError(e) => e.kind(),
            _ => ErrorKind::Other,
        }
    }

    /// Short label used for metrics and logs
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::LinodeError(e) => e.kind().as_str(),
            Error::ValidationError(_)
            | Error::InvalidAnnotation { .. }
            | Error::InvalidFirewallConfig(_)
            | Error::InvalidProviderId(_) => "validation",
            Error::TooManyFirewalls(_) | Error::TooManyIps(..) | Error::CidrRangeExhausted => {
                "capacity"
            }
            _ => "other",
        }
    }
}

pub fn is_not_found(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound)
}

pub fn is_rate_limited(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::RateLimited)
}

pub fn is_retryable_server_error(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::ServerError)
}

pub fn is_unauthenticated(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::AuthFailed)
}

/// 429 and 5xx responses are rescheduled by the controllers; everything else is dropped.
pub fn is_retryable(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::RateLimited | ErrorKind::ServerError)
}

/// Turn a cloud 404 into success. Used on every deletion path.
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if is_not_found(&e) => Ok(()),
        other => other,
    }
}
